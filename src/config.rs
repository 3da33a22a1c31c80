//! Engine configuration.
//!
//! A [`Config`] is assembled once at startup from an optional TOML file and
//! the CLI flags (flags win), then snapshotted into every instance build.
//! It is never mutated while an instance is live; reload re-reads nothing,
//! it rebuilds from the same snapshot.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default listen address for the HTTP server.
pub const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

/// Default template file extension.
pub const DEFAULT_TEMPLATE_EXT: &str = ".html";

/// Immutable engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Address the HTTP server binds to, `host:port`.
    pub listen: String,

    /// Root directory scanned for templates and static files.
    pub template_dir: PathBuf,

    /// Optional second directory exposed to templates via the filesystem
    /// accessors (`ReadFile`, `ServeFile`, ...). Never routed.
    pub context_dir: Option<PathBuf>,

    /// Extension that marks a file as a template (leading dot included).
    pub template_ext: String,

    /// Left action delimiter.
    pub ldelim: String,

    /// Right action delimiter.
    pub rdelim: String,

    /// Minify template sources before parsing.
    pub minify: bool,

    /// Watch the template root and rebuild on changes.
    pub watch: bool,

    /// Optional SQLite database path backing the SQL accessors.
    pub db: Option<PathBuf>,

    /// Arbitrary user key/value entries, exposed as `{{.X.Config "key"}}`.
    pub user: BTreeMap<String, String>,

    /// Enable debug logging.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            template_dir: PathBuf::from("templates"),
            context_dir: None,
            template_ext: DEFAULT_TEMPLATE_EXT.to_string(),
            ldelim: "{{".to_string(),
            rdelim: "}}".to_string(),
            minify: false,
            watch: true,
            db: None,
            user: BTreeMap::new(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load a config from a TOML file. Missing file is not an error when
    /// `required` is false (the default path may simply not exist).
    pub fn from_file(path: &Path, required: bool) -> Result<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config {}", path.display()))
            }
        };
        toml::from_str(&text).with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Parse a repeatable `key=value` CLI entry.
    pub fn parse_user_entry(entry: &str) -> Result<(String, String)> {
        match entry.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => anyhow::bail!("invalid config entry '{}', expected key=value", entry),
        }
    }

    /// Normalize after merging: the template extension always carries its
    /// leading dot, and empty delimiters fall back to the defaults.
    pub fn normalize(mut self) -> Self {
        if !self.template_ext.is_empty() && !self.template_ext.starts_with('.') {
            self.template_ext = format!(".{}", self.template_ext);
        }
        if self.ldelim.is_empty() {
            self.ldelim = "{{".to_string();
        }
        if self.rdelim.is_empty() {
            self.rdelim = "}}".to_string();
        }
        self
    }
}
