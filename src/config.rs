use crate::error::{EmotagError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Emotion label exempted from the audio/text disagreement check.
pub const DEFAULT_NEUTRAL_LABEL: &str = "中立";

/// Sample rate every clip is resampled to before recognition.
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenameMethod {
    #[default]
    Sidecar,
    Manifest,
}

impl std::fmt::Display for RenameMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenameMethod::Sidecar => write!(f, "sidecar"),
            RenameMethod::Manifest => write!(f, "manifest"),
        }
    }
}

impl std::str::FromStr for RenameMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sidecar" | "lab" => Ok(RenameMethod::Sidecar),
            "manifest" | "list" => Ok(RenameMethod::Manifest),
            _ => Err(format!(
                "Unknown rename method: {}. Use 'sidecar' or 'manifest'",
                s
            )),
        }
    }
}

/// How a kept or classified file is materialized at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    #[default]
    Copy,
    Move,
}

impl std::fmt::Display for TransferMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferMode::Copy => write!(f, "copy"),
            TransferMode::Move => write!(f, "move"),
        }
    }
}

impl std::str::FromStr for TransferMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy" => Ok(TransferMode::Copy),
            "move" => Ok(TransferMode::Move),
            _ => Err(format!("Unknown transfer mode: {}. Use 'copy' or 'move'", s)),
        }
    }
}

/// Destination folder layout used by the duration filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FolderLayout {
    /// Every kept file lands directly in the destination root, prefixed
    /// with its parent folder name.
    Flatten,
    /// Relative paths below the source root are kept.
    Mirror,
    /// Like `Mirror`, under an extra folder named after the source root.
    MirrorWithRoot,
    /// `MirrorWithRoot` when the source root has many top-level entries,
    /// `Mirror` otherwise.
    #[default]
    Auto,
}

impl std::fmt::Display for FolderLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FolderLayout::Flatten => write!(f, "flatten"),
            FolderLayout::Mirror => write!(f, "mirror"),
            FolderLayout::MirrorWithRoot => write!(f, "mirror-root"),
            FolderLayout::Auto => write!(f, "auto"),
        }
    }
}

impl std::str::FromStr for FolderLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "flatten" => Ok(FolderLayout::Flatten),
            "mirror" => Ok(FolderLayout::Mirror),
            "mirror-root" | "mirror-with-root" => Ok(FolderLayout::MirrorWithRoot),
            "auto" => Ok(FolderLayout::Auto),
            _ => Err(format!(
                "Unknown layout: {}. Use 'flatten', 'mirror', 'mirror-root', or 'auto'",
                s
            )),
        }
    }
}

/// What the recognition engine does with clips of a batch whose model call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryPolicy {
    /// Report every clip of the batch as failed.
    #[default]
    None,
    /// Re-submit each clip on its own once.
    Individually,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base URL of the audio emotion inference service.
    pub recognizer_url: String,
    /// Base URL of the text emotion classifier service.
    pub text_classifier_url: String,
    pub batch_size: usize,
    pub max_workers: usize,
    pub min_duration: f64,
    pub max_duration: f64,
    pub sample_rate: u32,
    pub neutral_label: String,
    pub rename_method: RenameMethod,
    pub transfer_mode: TransferMode,
    pub layout: FolderLayout,
    pub retry_policy: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recognizer_url: "http://127.0.0.1:8000".to_string(),
            text_classifier_url: "http://127.0.0.1:8000".to_string(),
            batch_size: 50,
            max_workers: 4,
            min_duration: 3.0,
            max_duration: 10.0,
            sample_rate: DEFAULT_SAMPLE_RATE,
            neutral_label: DEFAULT_NEUTRAL_LABEL.to_string(),
            rename_method: RenameMethod::default(),
            transfer_mode: TransferMode::default(),
            layout: FolderLayout::default(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                let contents = std::fs::read_to_string(&config_path)?;
                config = toml::from_str::<Config>(&contents).map_err(|e| {
                    EmotagError::Config(format!(
                        "Failed to parse {}: {}",
                        config_path.display(),
                        e
                    ))
                })?;
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("EMOTAG_RECOGNIZER_URL") {
            self.recognizer_url = url;
        }
        if let Ok(url) = std::env::var("EMOTAG_TEXT_CLASSIFIER_URL") {
            self.text_classifier_url = url;
        }
        if let Ok(label) = std::env::var("EMOTAG_NEUTRAL_LABEL") {
            self.neutral_label = label;
        }
        if let Some(v) = env_parse("EMOTAG_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse("EMOTAG_MAX_WORKERS") {
            self.max_workers = v;
        }
        if let Some(v) = env_parse("EMOTAG_MIN_DURATION") {
            self.min_duration = v;
        }
        if let Some(v) = env_parse("EMOTAG_MAX_DURATION") {
            self.max_duration = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmotagError::Config(
                "Batch size must be greater than 0".to_string(),
            ));
        }

        if self.max_workers == 0 {
            return Err(EmotagError::Config(
                "Max workers must be greater than 0".to_string(),
            ));
        }

        if !(self.min_duration >= 0.0 && self.min_duration <= self.max_duration) {
            return Err(EmotagError::Config(format!(
                "Invalid duration range [{}, {}]",
                self.min_duration, self.max_duration
            )));
        }

        if self.sample_rate == 0 {
            return Err(EmotagError::Config(
                "Sample rate must be greater than 0".to_string(),
            ));
        }

        if self.recognizer_url.trim().is_empty() {
            return Err(EmotagError::Config(
                "Recognizer URL not set. Export EMOTAG_RECOGNIZER_URL=http://host:port".to_string(),
            ));
        }

        Ok(())
    }

    /// Persist this configuration to the user config file.
    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::config_file_path()
            .ok_or_else(|| EmotagError::Config("No user config directory".to_string()))?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| EmotagError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    pub fn config_file_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("emotag").join("config.toml"))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_method_parsing() {
        assert_eq!("sidecar".parse::<RenameMethod>().unwrap(), RenameMethod::Sidecar);
        assert_eq!("lab".parse::<RenameMethod>().unwrap(), RenameMethod::Sidecar);
        assert_eq!("MANIFEST".parse::<RenameMethod>().unwrap(), RenameMethod::Manifest);
        assert_eq!("list".parse::<RenameMethod>().unwrap(), RenameMethod::Manifest);
        assert!("csv".parse::<RenameMethod>().is_err());
    }

    #[test]
    fn test_layout_parsing() {
        assert_eq!("flatten".parse::<FolderLayout>().unwrap(), FolderLayout::Flatten);
        assert_eq!("mirror-root".parse::<FolderLayout>().unwrap(), FolderLayout::MirrorWithRoot);
        assert_eq!(FolderLayout::MirrorWithRoot.to_string(), "mirror-root");
        assert!("tree".parse::<FolderLayout>().is_err());
    }

    #[test]
    fn test_transfer_mode_parsing() {
        assert_eq!("copy".parse::<TransferMode>().unwrap(), TransferMode::Copy);
        assert_eq!("Move".parse::<TransferMode>().unwrap(), TransferMode::Move);
        assert!("link".parse::<TransferMode>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.min_duration, 3.0);
        assert_eq!(config.max_duration, 10.0);
        assert_eq!(config.neutral_label, "中立");
        assert_eq!(config.transfer_mode, TransferMode::Copy);
        assert_eq!(config.retry_policy, RetryPolicy::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.min_duration = 12.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recognizer_url = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("batch_size = 8\nlayout = \"flatten\"").unwrap();
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.layout, FolderLayout::Flatten);
        assert_eq!(config.max_workers, 4);
    }
}
