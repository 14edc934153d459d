use crate::audio::collect_audio_files;
use crate::config::{Config, RenameMethod};
use crate::pipeline::PipelineConfig;
use console::style;
use dialoguer::{Confirm, Input, Select};
use std::fs;
use std::path::{Path, PathBuf};

pub struct InteractiveResult {
    pub input: PathBuf,
    pub config: Config,
    pub pipeline_config: PipelineConfig,
}

pub fn run_interactive_wizard() -> anyhow::Result<InteractiveResult> {
    print_header();

    // Step 1: Check/Setup service endpoints
    let config = setup_services()?;

    // Step 2: Select input folder
    let input = select_input_folder()?;

    let mut pipeline_config = PipelineConfig::from_config(&config);

    // Step 3: Duration filter
    setup_filter(&mut pipeline_config)?;

    // Step 4: Rename method
    setup_rename(&mut pipeline_config)?;

    // Step 5: Batching
    pipeline_config.batch_size = Input::new()
        .with_prompt("Batch size")
        .default(pipeline_config.batch_size)
        .validate_with(|v: &usize| if *v > 0 { Ok(()) } else { Err("must be greater than 0") })
        .interact_text()?;
    pipeline_config.max_workers = Input::new()
        .with_prompt("Concurrent workers")
        .default(pipeline_config.max_workers)
        .validate_with(|v: &usize| if *v > 0 { Ok(()) } else { Err("must be greater than 0") })
        .interact_text()?;

    // Step 6: Text cross-check
    pipeline_config.text_emotion = Confirm::new()
        .with_prompt("Cross-check labels against the text in file names?")
        .default(pipeline_config.text_emotion)
        .interact()?;

    // Step 7: Confirm
    print_summary(&input, &pipeline_config);

    if !Confirm::new()
        .with_prompt("Proceed with these settings?")
        .default(true)
        .interact()?
    {
        anyhow::bail!("Cancelled by user");
    }

    println!();

    Ok(InteractiveResult {
        input,
        config,
        pipeline_config,
    })
}

fn print_header() {
    println!();
    println!(
        "{}",
        style("╔═══════════════════════════════════════════════════╗").cyan()
    );
    println!(
        "{}",
        style("║        emotag - Audio Emotion Tagger/Sorter       ║").cyan()
    );
    println!(
        "{}",
        style("╚═══════════════════════════════════════════════════╝").cyan()
    );
    println!();
}

fn setup_services() -> anyhow::Result<Config> {
    let mut config = Config::load().unwrap_or_default();

    println!(
        "{} Recognition service: {}",
        style("✓").green(),
        style(&config.recognizer_url).cyan()
    );

    if !Confirm::new()
        .with_prompt("Change service endpoints?")
        .default(false)
        .interact()?
    {
        return Ok(config);
    }

    config.recognizer_url = Input::new()
        .with_prompt("Recognition service URL")
        .default(config.recognizer_url.clone())
        .interact_text()?;
    config.text_classifier_url = Input::new()
        .with_prompt("Text classifier URL")
        .default(config.text_classifier_url.clone())
        .interact_text()?;

    if config.recognizer_url.trim().is_empty() {
        anyhow::bail!("Recognition service URL is required");
    }

    // Offer to save
    if Confirm::new()
        .with_prompt("Save endpoints to config file?")
        .default(true)
        .interact()?
    {
        let path = config.save()?;
        println!(
            "{} Saved to {}\n",
            style("✓").green(),
            path.display()
        );
    }

    Ok(config)
}

fn select_input_folder() -> anyhow::Result<PathBuf> {
    println!("\n{}", style("Select input folder:").bold());

    let folders = scan_audio_folders(Path::new("."))?;

    if folders.is_empty() {
        println!("  No folders with .wav clips found in current directory.\n");
        return prompt_folder();
    }

    let mut items: Vec<String> = folders
        .iter()
        .map(|(path, clips, bytes)| {
            format!("{} ({} clips, {})", path.display(), clips, format_size(*bytes))
        })
        .collect();
    items.push("Enter custom path...".to_string());

    let selection = Select::new()
        .with_prompt("Choose a folder")
        .items(&items)
        .default(0)
        .interact()?;

    if selection == folders.len() {
        prompt_folder()
    } else {
        Ok(folders[selection].0.clone())
    }
}

fn prompt_folder() -> anyhow::Result<PathBuf> {
    let path: String = Input::new()
        .with_prompt("Enter folder path")
        .interact_text()?;
    let path = PathBuf::from(path.trim());
    if !path.is_dir() {
        anyhow::bail!("Folder not found: {}", path.display());
    }
    Ok(path)
}

/// Subfolders of `dir` holding at least one clip, with clip count and size.
fn scan_audio_folders(dir: &Path) -> anyhow::Result<Vec<(PathBuf, usize, u64)>> {
    let mut folders = Vec::new();

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        let clips = collect_audio_files(&path);
        if clips.is_empty() {
            continue;
        }
        let bytes = clips
            .iter()
            .filter_map(|c| fs::metadata(c).ok())
            .map(|m| m.len())
            .sum();
        folders.push((path, clips.len(), bytes));
    }

    folders.sort_by(|a, b| a.0.file_name().cmp(&b.0.file_name()));
    Ok(folders)
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn setup_filter(config: &mut PipelineConfig) -> anyhow::Result<()> {
    config.disable_filter = !Confirm::new()
        .with_prompt("Filter clips by duration?")
        .default(true)
        .interact()?;

    if config.disable_filter {
        return Ok(());
    }

    config.min_duration = Input::new()
        .with_prompt("Minimum duration (s)")
        .default(config.min_duration)
        .interact_text()?;
    let min = config.min_duration;
    config.max_duration = Input::new()
        .with_prompt("Maximum duration (s)")
        .default(config.max_duration.max(min))
        .validate_with(move |v: &f64| {
            if *v >= min {
                Ok(())
            } else {
                Err("must not be below the minimum")
            }
        })
        .interact_text()?;

    Ok(())
}

fn setup_rename(config: &mut PipelineConfig) -> anyhow::Result<()> {
    let methods = [
        ("Sidecar", "Name each clip after its .lab file", Some(RenameMethod::Sidecar)),
        ("Manifest", "Names from a .list manifest", Some(RenameMethod::Manifest)),
        ("Skip", "Keep current file names", None),
    ];

    let items: Vec<String> = methods
        .iter()
        .map(|(name, desc, _)| format!("{} - {}", name, desc))
        .collect();

    let default = methods
        .iter()
        .position(|(_, _, m)| *m == config.rename_method)
        .unwrap_or(0);

    let selection = Select::new()
        .with_prompt("Select rename method")
        .items(&items)
        .default(default)
        .interact()?;

    config.rename_method = methods[selection].2;

    if config.rename_method == Some(RenameMethod::Manifest) {
        let path: String = Input::new()
            .with_prompt("Manifest file")
            .interact_text()?;
        let path = PathBuf::from(path.trim());
        if !path.is_file() {
            anyhow::bail!("Manifest not found: {}", path.display());
        }
        config.manifest = Some(path);
    }

    Ok(())
}

fn describe_rename(config: &PipelineConfig) -> String {
    match (config.rename_method, &config.manifest) {
        (None, _) => "skip".to_string(),
        (Some(RenameMethod::Manifest), Some(manifest)) => {
            format!("manifest ({})", manifest.display())
        }
        (Some(method), _) => method.to_string(),
    }
}

fn print_summary(input: &Path, config: &PipelineConfig) {
    println!("\n{}", style("═══ Summary ═══").bold());
    println!("  Input:     {}", style(input.display()).cyan());
    if config.disable_filter {
        println!("  Filter:    off");
    } else {
        println!(
            "  Filter:    {:.1}-{:.1}s → {}",
            config.min_duration,
            config.max_duration,
            config.filtered_dir.display()
        );
    }
    println!("  Rename:    {}", describe_rename(config));
    println!(
        "  Batching:  {} clips x {} workers",
        config.batch_size, config.max_workers
    );
    println!(
        "  Text:      {}",
        if config.text_emotion { "cross-check" } else { "off" }
    );
    println!("  Log:       {}", style(config.log_path.display()).cyan());
    println!("  Output:    {}", style(config.output_dir.display()).cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn test_scan_audio_folders() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("a/1.wav"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("b/nested/2.WAV"), [0u8; 20]).unwrap();
        fs::write(dir.path().join("b/notes.txt"), b"x").unwrap();

        let folders = scan_audio_folders(dir.path()).unwrap();
        let summary: Vec<(String, usize, u64)> = folders
            .into_iter()
            .map(|(p, n, b)| (p.file_name().unwrap().to_string_lossy().into_owned(), n, b))
            .collect();

        assert_eq!(
            summary,
            vec![("a".to_string(), 1, 10), ("b".to_string(), 1, 20)]
        );
    }

    #[test]
    fn test_describe_rename() {
        let mut config = PipelineConfig::default();
        assert_eq!(describe_rename(&config), "sidecar");

        config.rename_method = Some(RenameMethod::Manifest);
        config.manifest = Some(PathBuf::from("names.list"));
        assert_eq!(describe_rename(&config), "manifest (names.list)");

        config.rename_method = None;
        assert_eq!(describe_rename(&config), "skip");
    }
}
