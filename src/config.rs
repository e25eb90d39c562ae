//! Runtime options and the rule file.
//!
//! Options come from `config.json` under the user config directory, then
//! from the command line, which wins wherever both set something.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::mixer::{LevelScale, Naming, RuleEngine, RuleSpec};

/// Output encoding for labels. Bytes the encoding cannot represent are
/// dropped rather than replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Encoding {
    #[default]
    #[serde(rename = "utf-8", alias = "utf8")]
    #[value(name = "utf-8", alias = "utf8")]
    Utf8,
    #[serde(rename = "ascii")]
    #[value(name = "ascii")]
    Ascii,
}

impl Encoding {
    /// Decode a NUL-terminated property value.
    pub fn decode(&self, raw: &[u8]) -> String {
        let bytes: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
        match self {
            Encoding::Utf8 => String::from_utf8_lossy(&bytes)
                .chars()
                .filter(|c| *c != char::REPLACEMENT_CHARACTER)
                .collect(),
            Encoding::Ascii => bytes
                .into_iter()
                .filter(u8::is_ascii)
                .map(char::from)
                .collect(),
        }
    }

    /// Make an already decoded string printable in this encoding.
    pub fn sanitize(&self, text: &str) -> String {
        match self {
            Encoding::Utf8 => text.to_string(),
            Encoding::Ascii => text.chars().filter(char::is_ascii).collect(),
        }
    }
}

/// Which item gets focus when nothing is focused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FocusDefault {
    #[default]
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Options {
    /// Percent of the level range per keypress
    #[serde(default = "Options::default_adjust_step")]
    pub adjust_step: u32,

    #[serde(default = "Options::default_max_level")]
    pub max_level: u32,

    #[serde(default)]
    pub min_level: u32,

    #[serde(default)]
    pub use_media_name: bool,

    #[serde(default)]
    pub use_device_name: bool,

    #[serde(default)]
    pub verbose: bool,

    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub encoding: Encoding,

    #[serde(default)]
    pub focus_default: FocusDefault,

    #[serde(default = "Options::default_focus_new_items")]
    pub focus_new_items: bool,

    /// Seconds since the last keypress before new items may take focus
    #[serde(default = "Options::default_focus_new_items_delay")]
    pub focus_new_items_delay: f64,
}

impl Options {
    fn default_adjust_step() -> u32 {
        5
    }
    fn default_max_level() -> u32 {
        1 << 16
    }
    fn default_focus_new_items() -> bool {
        true
    }
    fn default_focus_new_items_delay() -> f64 {
        5.0
    }

    pub fn scale(&self) -> LevelScale {
        LevelScale::new(self.min_level, self.max_level)
    }

    pub fn naming(&self) -> Naming {
        Naming {
            use_media_name: self.use_media_name,
            use_device_name: self.use_device_name,
        }
    }

    /// Validated at load time; out-of-range values never reach here.
    pub fn focus_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.focus_new_items_delay).unwrap_or(Duration::MAX)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(step) = cli.adjust_step {
            self.adjust_step = step;
        }
        if let Some(level) = cli.max_level {
            self.max_level = level;
        }
        if let Some(level) = cli.min_level {
            self.min_level = level;
        }
        self.use_media_name |= cli.use_media_name;
        self.use_device_name |= cli.use_device_name;
        self.verbose |= cli.verbose;
        self.debug |= cli.debug;
        if let Some(encoding) = cli.encoding {
            self.encoding = encoding;
        }
        if let Some(focus) = cli.focus_default {
            self.focus_default = focus;
        }
        if let Some(focus) = cli.focus_new_items {
            self.focus_new_items = focus;
        }
        if let Some(delay) = cli.focus_new_items_delay {
            self.focus_new_items_delay = delay;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.adjust_step) {
            return Err(ConfigError::invalid(
                "adjust-step",
                format!("{} is not within 1-100", self.adjust_step),
            ));
        }
        if self.max_level <= self.min_level {
            return Err(ConfigError::invalid(
                "max-level",
                format!(
                    "{} must be greater than min-level ({})",
                    self.max_level, self.min_level
                ),
            ));
        }
        Duration::try_from_secs_f64(self.focus_new_items_delay).map_err(|e| {
            ConfigError::invalid(
                "focus-new-items-delay",
                format!("{}: {}", self.focus_new_items_delay, e),
            )
        })?;
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            adjust_step: Self::default_adjust_step(),
            max_level: Self::default_max_level(),
            min_level: 0,
            use_media_name: false,
            use_device_name: false,
            verbose: false,
            debug: false,
            encoding: Encoding::default(),
            focus_default: FocusDefault::default(),
            focus_new_items: Self::default_focus_new_items(),
            focus_new_items_delay: Self::default_focus_new_items_delay(),
        }
    }
}

#[derive(Parser, Debug, Default)]
#[command(name = "mixtty")]
#[command(about = "Terminal volume control for PulseAudio streams and devices", long_about = None)]
pub struct Cli {
    /// Configuration file (default: <config dir>/mixtty/config.json)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Adjustment for a single keypress, in percent of the range
    #[arg(short, long, value_name = "STEP")]
    pub adjust_step: Option<u32>,

    /// Level treated as the top of the scale
    #[arg(short = 'l', long, value_name = "LEVEL")]
    pub max_level: Option<u32>,

    /// Level treated as the bottom of the scale
    #[arg(long, value_name = "LEVEL")]
    pub min_level: Option<u32>,

    /// Name streams by "media.name" where it says something useful
    #[arg(short = 'n', long)]
    pub use_media_name: bool,

    /// Name devices by "device.description"
    #[arg(short = 'd', long)]
    pub use_device_name: bool,

    /// Log to stderr instead of the log file
    #[arg(short, long)]
    pub verbose: bool,

    /// Debug logging (implies logging to stderr)
    #[arg(long)]
    pub debug: bool,

    /// Label output encoding
    #[arg(short, long, value_enum)]
    pub encoding: Option<Encoding>,

    /// Item to focus when nothing else is
    #[arg(long, value_enum)]
    pub focus_default: Option<FocusDefault>,

    /// Move focus to newly added items
    #[arg(long, value_name = "BOOL")]
    pub focus_new_items: Option<bool>,

    /// Seconds after the last keypress before new items may take focus
    #[arg(long, value_name = "SECONDS")]
    pub focus_new_items_delay: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    options: Options,
    rules: Vec<RuleSpec>,
}

/// Everything loaded before the Session starts.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub options: Options,
    pub rules: Vec<RuleSpec>,
    /// File the configuration was read from, if any
    pub source: Option<PathBuf>,
}

impl Config {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("mixtty").join("config.json"))
    }

    /// Read the config file and merge the command line over it.
    ///
    /// A missing default file is not an error; a missing `--config` file is.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let (file, source) = match &cli.config {
            Some(path) => (read_file(path)?, Some(path.clone())),
            None => match Self::default_path() {
                Some(path) if path.exists() => (read_file(&path)?, Some(path)),
                _ => (ConfigFile::default(), None),
            },
        };

        let mut options = file.options;
        options.apply_cli(cli);
        options.validate()?;

        Ok(Self {
            options,
            rules: file.rules,
            source,
        })
    }

    /// Compile the rule list; any bad rule is a load-time error.
    pub fn rule_engine(&self) -> Result<RuleEngine, ConfigError> {
        RuleEngine::compile(&self.rules)
    }
}

fn read_file(path: &Path) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file: ConfigFile = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!(
        "Loaded {} with {} rules",
        path.display(),
        file.rules.len()
    );
    Ok(file)
}
