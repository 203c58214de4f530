//! Arcanum CLI
//!
//! Command-line interface for the Lua/Luau obfuscation engine.

mod gemini;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use arcanum_core::{
    obfuscate_with_rewriter, parse, print_chunk, ObfuscationFailure, ObfuscationResult, Settings,
};
use clap::{Parser, Subcommand};

use crate::gemini::GeminiRewriter;

/// Settings file picked up from the working directory when `--config` is absent
const DEFAULT_CONFIG: &str = "arcanum.toml";

#[derive(Parser)]
#[command(name = "arcanum")]
#[command(about = "Lua/Luau obfuscation engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct SettingsArgs {
    /// Settings file (.toml or .json; default: ./arcanum.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the seed
    #[arg(long)]
    seed: Option<String>,

    /// Override the watermark (empty string disables it)
    #[arg(long)]
    watermark: Option<String>,

    /// Run the remote AI rewrite step first (needs GEMINI_API_KEY)
    #[arg(long)]
    ai: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Obfuscate one script
    Obfuscate {
        /// Input script
        file: PathBuf,

        #[command(flatten)]
        settings: SettingsArgs,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the full result (code, logs, stats) as JSON
        #[arg(long)]
        json: bool,
    },

    /// Obfuscate every .lua/.luau file under a directory
    Batch {
        /// Source directory
        dir: PathBuf,

        #[command(flatten)]
        settings: SettingsArgs,

        /// Output directory (default: <dir>/obfuscated)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Write a default settings file
    Init {
        /// Target path (default: ./arcanum.toml)
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Parse a script and verify that it survives an emit/re-parse round trip
    Check {
        /// Script to check
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("arcanum=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Obfuscate {
            file,
            settings,
            output,
            json,
        } => {
            cmd_obfuscate(file, settings, output, json).await?;
        }
        Commands::Batch {
            dir,
            settings,
            output,
        } => {
            cmd_batch(dir, settings, output).await?;
        }
        Commands::Init { path, force } => {
            cmd_init(path, force)?;
        }
        Commands::Check { file } => {
            cmd_check(&file)?;
        }
    }

    Ok(())
}

/// Resolve the effective settings from a file and command-line overrides
fn load_settings(args: &SettingsArgs) -> Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None if Path::new(DEFAULT_CONFIG).exists() => Settings::from_file(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load settings from {}", DEFAULT_CONFIG))?,
        None => Settings::default(),
    };
    if let Some(seed) = &args.seed {
        settings.seed = seed.clone();
    }
    if let Some(watermark) = &args.watermark {
        settings.watermark = watermark.clone();
    }
    if args.ai {
        settings.use_ai = true;
    }
    Ok(settings)
}

async fn run_one(source: &str, settings: &Settings) -> Result<ObfuscationResult> {
    let rewriter = GeminiRewriter::from_env();
    match obfuscate_with_rewriter(source, settings, &rewriter).await {
        Ok(result) => Ok(result),
        Err(ObfuscationFailure { error, logs }) => {
            for line in &logs {
                eprintln!("{}", line);
            }
            Err(error.into())
        }
    }
}

/// Obfuscate a single file
async fn cmd_obfuscate(
    file: PathBuf,
    args: SettingsArgs,
    output: Option<PathBuf>,
    json: bool,
) -> Result<()> {
    let settings = load_settings(&args)?;
    let source = fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let result = run_one(&source, &settings)
        .await
        .with_context(|| format!("Failed to obfuscate {}", file.display()))?;

    let rendered = if json {
        serde_json::to_string_pretty(&result)?
    } else {
        result.code.clone()
    };
    match output {
        Some(path) => {
            fs::write(&path, &rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote {}", path.display());
        }
        None => print!("{}", rendered),
    }

    if !json {
        for line in &result.logs {
            eprintln!("{}", line);
        }
        eprintln!("{}", describe_stats(&result));
    }
    Ok(())
}

fn describe_stats(result: &ObfuscationResult) -> String {
    let stats = &result.stats;
    match &stats.reduction {
        Some(reduction) => format!(
            "{} -> {} bytes ({} smaller)",
            stats.original_size, stats.new_size, reduction
        ),
        None => format!("{} -> {} bytes", stats.original_size, stats.new_size),
    }
}

fn is_script(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("lua") | Some("luau")
    )
}

/// Collect scripts under `dir`, skipping `exclude`
fn collect_scripts(dir: &Path, exclude: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path == exclude {
            continue;
        }
        if path.is_dir() {
            collect_scripts(&path, exclude, out)?;
        } else if is_script(&path) {
            out.push(path);
        }
    }
    Ok(())
}

/// Obfuscate a directory tree, mirroring its layout into the output directory
async fn cmd_batch(dir: PathBuf, args: SettingsArgs, output: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(&args)?;
    let output = output.unwrap_or_else(|| dir.join("obfuscated"));

    let mut scripts = Vec::new();
    collect_scripts(&dir, &output, &mut scripts)?;
    scripts.sort();
    if scripts.is_empty() {
        bail!("No .lua or .luau files found in {}", dir.display());
    }

    let mut failed = 0;
    for script in &scripts {
        let relative = script.strip_prefix(&dir).unwrap_or(script);
        let source = fs::read_to_string(script)
            .with_context(|| format!("Failed to read {}", script.display()))?;
        match run_one(&source, &settings).await {
            Ok(result) => {
                let target = output.join(relative);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create {}", parent.display()))?;
                }
                fs::write(&target, &result.code)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
                println!("  {}: {}", relative.display(), describe_stats(&result));
            }
            Err(e) => {
                failed += 1;
                println!("  {}: FAILED ({})", relative.display(), e);
            }
        }
    }

    println!(
        "\nObfuscated {} of {} files into {}",
        scripts.len() - failed,
        scripts.len(),
        output.display()
    );
    if failed > 0 {
        bail!("{} files failed", failed);
    }
    Ok(())
}

/// Write the default settings
fn cmd_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let settings = Settings::default();
    let rendered = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_string_pretty(&settings)?,
        _ => settings.to_toml()?,
    };
    fs::write(&path, rendered).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote default settings to {}", path.display());
    Ok(())
}

/// Parse, emit and re-parse a script
fn cmd_check(file: &Path) -> Result<()> {
    let source =
        fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let chunk = parse(&source).with_context(|| format!("Failed to parse {}", file.display()))?;
    let emitted = print_chunk(&chunk);
    let reparsed = parse(&emitted).context("Emitted code does not parse")?;
    if reparsed != chunk {
        bail!("Round trip changed the syntax tree of {}", file.display());
    }

    println!(
        "{}: ok ({} statements, {} -> {} bytes)",
        file.display(),
        chunk.block.stmts.len(),
        source.len(),
        emitted.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn args(config: Option<PathBuf>) -> SettingsArgs {
        SettingsArgs {
            config,
            seed: Some("CLI".to_string()),
            watermark: None,
            ai: false,
        }
    }

    #[test]
    fn test_init_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("arcanum.toml");
        cmd_init(Some(path.clone()), false).unwrap();
        assert!(cmd_init(Some(path.clone()), false).is_err());

        let settings = load_settings(&args(Some(path))).unwrap();
        assert_eq!(settings, Settings::default().with_seed("CLI"));
    }

    #[test]
    fn test_check_accepts_valid_script() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ok.lua");
        fs::write(&path, "local a = {1, 2} for _, v in ipairs(a) do print(v) end").unwrap();
        cmd_check(&path).unwrap();

        fs::write(&path, "local a = ").unwrap();
        assert!(cmd_check(&path).is_err());
    }

    #[tokio::test]
    async fn test_batch_mirrors_tree() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.lua"), "print(1)").unwrap();
        fs::write(dir.path().join("sub/b.luau"), "local x = 2 print(x)").unwrap();
        fs::write(dir.path().join("notes.txt"), "skip").unwrap();

        let out = dir.path().join("out");
        cmd_batch(dir.path().to_path_buf(), args(None), Some(out.clone()))
            .await
            .unwrap();
        assert!(out.join("a.lua").exists());
        assert!(out.join("sub/b.luau").exists());
        assert!(!out.join("notes.txt").exists());
    }
}
