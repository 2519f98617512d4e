use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::document_model::LineEnding;
use crate::history::DEFAULT_MAX_ENTRIES;

const RC_FILE: &str = ".tbufrc";

#[derive(Debug, Clone, PartialEq)]
pub struct BufferConfig {
    /// Terminator forced onto inserted text. `None` keeps whatever the
    /// surrounding text uses.
    pub preferred_line_ending: Option<LineEnding>,
    pub undo_levels: usize,
    /// Milliseconds within which consecutive transactions merge into one undo step.
    pub group_interval: u64,
    pub stopped_changing_delay: u64,
    pub normalize_line_endings: bool,
    pub backup: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            preferred_line_ending: None,
            undo_levels: DEFAULT_MAX_ENTRIES,
            group_interval: 0,
            stopped_changing_delay: 300,
            normalize_line_endings: true,
            backup: true,
        }
    }
}

pub struct RcLoader;

impl RcLoader {
    /// Get the path to the RC file
    /// Looks for .tbufrc in:
    /// 1. Current directory
    /// 2. Home directory (~/.tbufrc)
    pub fn get_rc_path() -> Option<PathBuf> {
        let current_rc = Path::new(RC_FILE);
        if current_rc.exists() {
            return Some(current_rc.to_path_buf());
        }

        if let Ok(home) = env::var("HOME") {
            let home_rc = Path::new(&home).join(RC_FILE);
            if home_rc.exists() {
                return Some(home_rc);
            }
        }

        None
    }

    pub fn load_config() -> BufferConfig {
        match Self::get_rc_path() {
            Some(rc_path) => Self::load_from(&rc_path),
            None => BufferConfig::default(),
        }
    }

    /// Reads one rc file. Unreadable files leave every setting at its default.
    pub fn load_from(path: &Path) -> BufferConfig {
        let mut config = BufferConfig::default();
        match fs::read_to_string(path) {
            Ok(content) => Self::parse_config_content(&content, &mut config),
            Err(err) => debug!(path = %path.display(), %err, "rc file unreadable, using defaults"),
        }
        config
    }

    fn parse_config_content(content: &str, config: &mut BufferConfig) {
        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') || line.starts_with('"') {
                continue;
            }

            Self::parse_config_line(line, config);
        }
    }

    fn parse_config_line(line: &str, config: &mut BufferConfig) {
        // Remove inline comments
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        }
        .trim();

        let setting = line.strip_prefix("set ").map(str::trim).unwrap_or(line);
        match setting.split_once('=') {
            Some((key, value)) => Self::apply_value(key.trim(), value.trim(), config),
            None => Self::apply_flag(setting, config),
        }
    }

    fn apply_flag(flag: &str, config: &mut BufferConfig) {
        match flag {
            "normalizeendings" => config.normalize_line_endings = true,
            "nonormalizeendings" => config.normalize_line_endings = false,
            "backup" => config.backup = true,
            "nobackup" => config.backup = false,
            _ => {}
        }
    }

    fn apply_value(key: &str, value: &str, config: &mut BufferConfig) {
        match key {
            "fileformat" | "ff" | "line_ending" => {
                if let Some(ending) = LineEnding::from_name(value) {
                    config.preferred_line_ending = Some(ending);
                }
            }
            "undolevels" | "ul" => {
                if let Ok(levels) = value.parse::<usize>() {
                    if levels > 0 {
                        config.undo_levels = levels;
                    }
                }
            }
            "groupinterval" | "group_interval" => {
                if let Ok(interval) = value.parse::<u64>() {
                    config.group_interval = interval;
                }
            }
            "stoppedchanging" | "stopped_changing" => {
                if let Ok(delay) = value.parse::<u64>() {
                    config.stopped_changing_delay = delay;
                }
            }
            "normalizeendings" | "normalize_line_endings" => {
                config.normalize_line_endings = value == "true" || value == "1" || value == "yes";
            }
            "backup" => {
                config.backup = value == "true" || value == "1" || value == "yes";
            }
            _ => {}
        }
    }

    pub fn generate_sample_rc() -> String {
        r#"# text-buffer configuration file (.tbufrc)
# Lines starting with # or " are comments

# Line endings forced onto inserted text: unix, dos, or mac
set fileformat=unix

# History
set undolevels=10000     # Maximum undo stack entries
set groupinterval=300    # Merge transactions closer than this (ms)

# Notify listeners this long after the last edit (ms)
set stoppedchanging=300

set normalizeendings     # Or set nonormalizeendings
set backup               # Or set nobackup

# Alternative key=value syntax:
# line_ending=dos
# group_interval=0
# backup=false
"#
        .to_string()
    }
}
