use clap::Parser;
use eyre::{Context, Result, eyre};
use kobo2calibre::{migrate, utils};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

/// Import Kobo highlights into a Calibre library as viewer annotations.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Mount point of the Kobo device (the folder containing `.kobo`).
    #[arg(value_name = "KOBO_VOLUME")]
    kobo_volume: Option<PathBuf>,

    /// Calibre library folder (the one containing `metadata.db`).
    #[arg(value_name = "CALIBRE_LIBRARY")]
    calibre_library: Option<PathBuf>,

    /// Only process books whose device path or title contains this text.
    #[arg(long, value_name = "TEXT")]
    filter_bookname: Option<String>,

    /// Calibre color for highlights the device recorded without one.
    #[arg(long, value_name = "COLOR")]
    default_color: Option<String>,

    /// Match and convert, but do not write to the Calibre database.
    #[arg(long)]
    dry_run: bool,

    /// Do not back up metadata.db before writing.
    #[arg(long)]
    no_backup: bool,

    /// Path to a specific configuration file.
    /// Defaults to $XDG_CONFIG_HOME/kobo2calibre/config.toml
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log every book and highlight processed.
    #[arg(short, long)]
    debug: bool,

    /// Only print warnings and errors.
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,
}

#[derive(Deserialize, Default)]
struct FileConfig {
    kobo_volume: Option<PathBuf>,
    calibre_library: Option<PathBuf>,
    default_color: Option<String>,
}

fn load_file_config(explicit_path: Option<&Path>) -> Result<FileConfig> {
    let path = if let Some(p) = explicit_path {
        if !p.exists() {
            return Err(eyre!("Config file not found: {}", p.display()));
        }
        Some(p.to_path_buf())
    } else {
        dirs::config_dir()
            .map(|d| d.join("kobo2calibre/config.toml"))
            .filter(|p| p.exists())
    };

    match path {
        None => Ok(FileConfig::default()),
        Some(p) => {
            let content = fs::read_to_string(&p)
                .wrap_err_with(|| format!("Failed to read config: {}", p.display()))?;
            toml::from_str(&content)
                .wrap_err_with(|| format!("Failed to parse config: {}", p.display()))
        }
    }
}

fn init_tracing(debug: bool, quiet: bool) {
    let level = if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("kobo2calibre={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug, cli.quiet);

    // 1. Load config file (CLI path > default path)
    let file_cfg = load_file_config(cli.config.as_deref())?;

    // 2. Resolve the two stores (CLI > Config)
    let kobo_volume = cli
        .kobo_volume
        .or(file_cfg.kobo_volume)
        .ok_or_else(|| {
            eyre!(
                "No Kobo volume given.\n\
                 Pass it as the first argument, or set kobo_volume in config.toml."
            )
        })?;
    let calibre_library = cli
        .calibre_library
        .or(file_cfg.calibre_library)
        .ok_or_else(|| {
            eyre!(
                "No Calibre library given.\n\
                 Pass it as the second argument, or set calibre_library in config.toml."
            )
        })?;

    // 3. Resolve color (CLI > Config > Default)
    let default_color = utils::validate_color(
        cli.default_color
            .or(file_cfg.default_color)
            .as_deref()
            .unwrap_or("green"),
    )?;

    // 4. Build the migration config
    let config = utils::MigrateConfig {
        kobo_volume,
        calibre_library,
        filter_bookname: cli.filter_bookname,
        default_color,
        dry_run: cli.dry_run,
        backup: !cli.no_backup,
        progress: !cli.quiet && !cli.debug,
    };

    // 5. Run the business logic
    let summary = migrate::execute(&config)?;
    if !cli.quiet {
        eprintln!("{}", summary);
    }
    Ok(())
}
