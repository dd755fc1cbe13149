use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;

pub const SETTINGS_FILE: &str = "settings.json";
pub const LOCAL_SETTINGS_FILE: &str = "settings.local.json";

/// The only strategy this implementation supports.  The `strategy` key is
/// kept for compatibility with older settings files.
pub const MANUAL_COMMIT: &str = "manual-commit";

// ===================================================================
// On-disk settings — strict JSON, unknown keys rejected
// ===================================================================

/// One settings file (`.entire/settings.json` or the `.local` overlay).
/// Every field is optional so the overlay can override key-by-key.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    enabled: Option<bool>,
    strategy: Option<String>,
    log_level: Option<String>,
    strategy_options: Option<StrategyOptionsFile>,
    telemetry: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StrategyOptionsFile {
    push_sessions: Option<bool>,
    summarize: Option<SummarizeFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SummarizeFile {
    enabled: Option<bool>,
}

// ===================================================================
// Resolved settings
// ===================================================================

/// Effective settings after merging `.entire/settings.json` with
/// `.entire/settings.local.json` (local wins per key) and applying
/// defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// When false, every hook verb is a no-op that exits 0.
    pub enabled: bool,
    /// Deprecated; anything other than `manual-commit` is a
    /// misconfiguration.
    pub strategy: String,
    /// `debug`|`info`|`warn`|`error`.  The `ENTIRE_LOG` env var wins.
    pub log_level: Option<String>,
    pub push_sessions: bool,
    pub summarize: bool,
    /// Tri-state: `Some(true)` opt-in, `Some(false)` opt-out, `None` ask.
    /// Plumbed but unused by the core.
    pub telemetry: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: MANUAL_COMMIT.into(),
            log_level: None,
            push_sessions: false,
            summarize: true,
            telemetry: None,
        }
    }
}

fn read_settings_file(path: &Path) -> Result<Option<SettingsFile>> {
    match fs::read_to_string(path) {
        Ok(s) => {
            let file: SettingsFile = serde_json::from_str(&s)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Some(file))
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

impl Settings {
    /// Load and merge settings from a `.entire` data directory.  Missing
    /// files mean defaults; the local file overrides the shared one
    /// key-by-key.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let mut settings = Settings::default();
        for name in [SETTINGS_FILE, LOCAL_SETTINGS_FILE] {
            if let Some(file) = read_settings_file(&data_dir.join(name))? {
                settings.apply(file);
            }
        }
        Ok(settings)
    }

    fn apply(&mut self, file: SettingsFile) {
        if let Some(v) = file.enabled {
            self.enabled = v;
        }
        if let Some(v) = file.strategy {
            self.strategy = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = Some(v);
        }
        if let Some(opts) = file.strategy_options {
            if let Some(v) = opts.push_sessions {
                self.push_sessions = v;
            }
            if let Some(s) = opts.summarize {
                if let Some(v) = s.enabled {
                    self.summarize = v;
                }
            }
        }
        if let Some(v) = file.telemetry {
            self.telemetry = Some(v);
        }
    }

    /// Validate the deprecated `strategy` key.
    pub fn validate(&self) -> Result<()> {
        if self.strategy != MANUAL_COMMIT {
            anyhow::bail!(
                "unsupported strategy {:?}; only {MANUAL_COMMIT:?} is available",
                self.strategy
            );
        }
        Ok(())
    }
}
