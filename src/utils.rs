use eyre::{Result, eyre};
use std::path::{Path, PathBuf};

/// Configuration required to run the migration.
/// This decouples the logic from how the arguments were parsed (CLI/Config file).
#[derive(Clone, Debug)]
pub struct MigrateConfig {
    /// Mount point of the Kobo device.
    pub kobo_volume: PathBuf,
    /// Root of the Calibre library (the directory holding `metadata.db`).
    pub calibre_library: PathBuf,
    /// Only books whose device path or title contains this are processed.
    pub filter_bookname: Option<String>,
    pub default_color: String,
    pub dry_run: bool,
    pub backup: bool,
    pub progress: bool,
}

impl MigrateConfig {
    pub fn new(kobo_volume: PathBuf, calibre_library: PathBuf) -> Self {
        Self {
            kobo_volume,
            calibre_library,
            filter_bookname: None,
            default_color: "green".into(),
            dry_run: false,
            backup: true,
            progress: false,
        }
    }

    pub fn accepts(&self, volume_id: &str, title: Option<&str>) -> bool {
        match self.filter_bookname.as_deref() {
            None => true,
            Some(filter) => volume_id.contains(filter) || title.is_some_and(|t| t.contains(filter)),
        }
    }
}

/// Calibre's builtin highlight colors.
pub const BUILTIN_COLORS: &[&str] = &["yellow", "green", "blue", "red", "purple"];

pub fn validate_color(color: &str) -> Result<String> {
    let color = color.trim().to_lowercase();
    if BUILTIN_COLORS.contains(&color.as_str()) {
        Ok(color)
    } else {
        Err(eyre!(
            "Unknown highlight color {:?}; expected one of {}",
            color,
            BUILTIN_COLORS.join(", ")
        ))
    }
}

pub fn ensure_file(path: &Path, what: &str, hint: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(eyre!("{} not found at: {}\n{}", what, path.display(), hint))
    }
}
