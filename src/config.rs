// ============================================================================
// SETTINGS: read-only key=value file in the platform config directory
// ============================================================================

use std::path::{Path, PathBuf};

use crate::components::history::{DEFAULT_MAX_HISTORY, DEFAULT_MAX_MEMORY_BYTES};
use crate::io::TiffCompression;
use crate::ops::transform::Interpolation;

const APP_DIR: &str = "KnouxStudio";
const SETTINGS_FILE: &str = "settings.cfg";

#[derive(Clone, Debug, PartialEq)]
pub struct StudioSettings {
    pub max_undo_steps: usize,
    /// Undo memory cap in megabytes; 0 disables the cap.
    pub max_history_mb: usize,
    pub jpeg_quality: u8,
    pub tiff_compression: TiffCompression,
    pub default_interpolation: Interpolation,
    /// Default `tracing` filter directive when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            max_undo_steps: DEFAULT_MAX_HISTORY,
            max_history_mb: DEFAULT_MAX_MEMORY_BYTES / (1024 * 1024),
            jpeg_quality: 90,
            tiff_compression: TiffCompression::None,
            default_interpolation: Interpolation::Bilinear,
            log_level: "info".to_string(),
        }
    }
}

impl StudioSettings {
    /// Path to the settings file.
    /// On Linux:   ~/.config/KnouxStudio/settings.cfg  (XDG_CONFIG_HOME respected)
    /// On Windows: %APPDATA%\KnouxStudio\settings.cfg
    /// On macOS:   ~/Library/Application Support/KnouxStudio/settings.cfg
    pub fn settings_path() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            let appdata = std::env::var("APPDATA").or_else(|_| std::env::var("USERPROFILE")).ok()?;
            return Some(PathBuf::from(appdata).join(APP_DIR).join(SETTINGS_FILE));
        }
        #[cfg(target_os = "macos")]
        {
            let home = std::env::var("HOME").ok()?;
            return Some(
                PathBuf::from(home)
                    .join("Library")
                    .join("Application Support")
                    .join(APP_DIR)
                    .join(SETTINGS_FILE),
            );
        }
        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            let config_dir = std::env::var("XDG_CONFIG_HOME")
                .map(PathBuf::from)
                .or_else(|_| std::env::var("HOME").map(|h| PathBuf::from(h).join(".config")))
                .ok()?;
            Some(config_dir.join(APP_DIR).join(SETTINGS_FILE))
        }
    }

    /// Load from the platform path (defaults if missing or unreadable).
    pub fn load() -> Self {
        match Self::settings_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    /// Load from an explicit file. A missing file is not an error.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                tracing::debug!(path = %path.display(), "settings loaded");
                Self::parse(&content)
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), "could not read settings: {e}");
                }
                Self::default()
            }
        }
    }

    /// Parse `key=value` lines. Unknown keys are skipped and unparsable
    /// values leave the default in place.
    pub fn parse(content: &str) -> Self {
        let mut s = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else { continue };
            let key = key.trim();
            let val = val.trim();
            match key {
                "max_undo_steps" => match val.parse::<usize>() {
                    Ok(n) if n > 0 => s.max_undo_steps = n,
                    _ => warn_value(key, val),
                },
                "max_history_mb" => match val.parse() {
                    Ok(n) => s.max_history_mb = n,
                    Err(_) => warn_value(key, val),
                },
                "jpeg_quality" => match val.parse::<u8>() {
                    Ok(q) if (1..=100).contains(&q) => s.jpeg_quality = q,
                    _ => warn_value(key, val),
                },
                "tiff_compression" => match val.parse() {
                    Ok(c) => s.tiff_compression = c,
                    Err(_) => warn_value(key, val),
                },
                "default_interpolation" => match val.parse() {
                    Ok(i) => s.default_interpolation = i,
                    Err(_) => warn_value(key, val),
                },
                "log_level" if !val.is_empty() => s.log_level = val.to_string(),
                _ => tracing::debug!(key, "ignoring unknown settings key"),
            }
        }
        s
    }

    /// Undo memory cap in bytes, `None` when disabled.
    pub fn history_memory_limit(&self) -> Option<usize> {
        (self.max_history_mb > 0).then(|| self.max_history_mb.saturating_mul(1024 * 1024))
    }
}

fn warn_value(key: &str, val: &str) {
    tracing::warn!(key, value = val, "invalid settings value, keeping default");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_keys() {
        let s = StudioSettings::parse(
            "# studio settings\n\
             max_undo_steps = 20\n\
             max_history_mb=64\n\
             jpeg_quality=75\n\
             tiff_compression=deflate\n\
             default_interpolation=lanczos3\n\
             log_level=debug,knoux_studio=trace\n",
        );
        assert_eq!(s.max_undo_steps, 20);
        assert_eq!(s.history_memory_limit(), Some(64 * 1024 * 1024));
        assert_eq!(s.jpeg_quality, 75);
        assert_eq!(s.tiff_compression, TiffCompression::Deflate);
        assert_eq!(s.default_interpolation, Interpolation::Lanczos3);
        assert_eq!(s.log_level, "debug,knoux_studio=trace");
    }

    #[test]
    fn bad_values_and_unknown_keys_fall_back() {
        let s = StudioSettings::parse("jpeg_quality=0\nmax_undo_steps=lots\ntheme=dark\nnot a pair\n");
        assert_eq!(s, StudioSettings::default());
    }

    #[test]
    fn zero_history_mb_disables_cap() {
        let s = StudioSettings::parse("max_history_mb=0");
        assert_eq!(s.history_memory_limit(), None);
        assert_eq!(StudioSettings::default().history_memory_limit(), Some(DEFAULT_MAX_MEMORY_BYTES));
    }

    #[test]
    fn load_from_file_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.cfg");
        std::fs::write(&path, "max_undo_steps=7\n").unwrap();
        assert_eq!(StudioSettings::load_from(&path).max_undo_steps, 7);
        assert_eq!(StudioSettings::load_from(&dir.path().join("nope.cfg")), StudioSettings::default());
    }
}
