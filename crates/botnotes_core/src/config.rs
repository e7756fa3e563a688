//! Store configuration.
//!
//! # Responsibility
//! - Resolve the data directory and optional path overrides.
//! - Load settings from an optional TOML file.
//!
//! Resolution order for the data directory: `BOTNOTES_HOME`, then the
//! `data_dir` of the file named by `BOTNOTES_CONFIG` (or
//! `<home>/.config/botnotes/config.toml`), then `~/.local/botnotes`.

use crate::store::StoreLayout;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

pub const HOME_ENV: &str = "BOTNOTES_HOME";
pub const CONFIG_ENV: &str = "BOTNOTES_CONFIG";

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse { path: PathBuf, source: toml::de::Error },
    /// No home directory could be determined for the defaults.
    NoHomeDir,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse { path, source } => {
                write!(f, "invalid config `{}`: {source}", path.display())
            }
            Self::NoHomeDir => write!(f, "cannot determine home directory; set {HOME_ENV}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { source, .. } => Some(source),
            Self::NoHomeDir => None,
        }
    }
}

/// Settings for one note store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Overrides `<data_dir>/notes`.
    pub notes_dir: Option<PathBuf>,
    /// Overrides `<data_dir>/index/index.sqlite3`.
    pub index_path: Option<PathBuf>,
    /// Log level for `init_logging`; build default when unset.
    pub log_level: Option<String>,
    /// Log directory; `<data_dir>/logs` when unset.
    pub log_dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parses a TOML document read from `path`; relative paths resolve against its folder.
    pub fn from_toml_str(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let Some(base_dir) = path.parent() {
            config.resolve_relative(base_dir);
        }
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Resolves configuration from the environment and the optional config file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let config_path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => home
                .as_ref()
                .map(|home| home.join(".config").join("botnotes").join("config.toml"))
                .filter(|path| path.is_file()),
        };

        let mut config = match config_path {
            Some(path) => Self::load_file(&path)?,
            None => Self::default(),
        };

        if let Some(data_dir) = std::env::var_os(HOME_ENV) {
            config.data_dir = PathBuf::from(data_dir);
        } else if config.data_dir.as_os_str().is_empty() {
            let home = home.ok_or(ConfigError::NoHomeDir)?;
            config.data_dir = home.join(".local").join("botnotes");
        }
        Ok(config)
    }

    pub fn layout(&self) -> StoreLayout {
        let mut layout = StoreLayout::new(&self.data_dir);
        if let Some(notes_dir) = &self.notes_dir {
            layout.notes_dir = notes_dir.clone();
        }
        if let Some(index_path) = &self.index_path {
            layout.index_path = index_path.clone();
        }
        layout
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    fn resolve_relative(&mut self, base_dir: &Path) {
        let resolve = |path: &mut PathBuf| {
            if !path.as_os_str().is_empty() && path.is_relative() {
                *path = base_dir.join(&*path);
            }
        };
        resolve(&mut self.data_dir);
        if let Some(path) = self.notes_dir.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.index_path.as_mut() {
            resolve(path);
        }
        if let Some(path) = self.log_dir.as_mut() {
            resolve(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StoreConfig;
    use std::path::Path;

    #[test]
    fn toml_overrides_resolve_against_config_dir() {
        let text = r#"
            data_dir = "data"
            index_path = "/var/cache/botnotes/index.sqlite3"
            log_level = "warn"
        "#;
        let config = StoreConfig::from_toml_str(text, Path::new("/etc/botnotes/config.toml")).unwrap();
        assert_eq!(config.data_dir, Path::new("/etc/botnotes/data"));
        assert_eq!(config.log_level.as_deref(), Some("warn"));

        let layout = config.layout();
        assert_eq!(layout.notes_dir, Path::new("/etc/botnotes/data/notes"));
        assert_eq!(
            layout.index_path,
            Path::new("/var/cache/botnotes/index.sqlite3")
        );
        assert_eq!(config.log_dir(), Path::new("/etc/botnotes/data/logs"));
    }

    #[test]
    fn mistyped_fields_are_parse_errors() {
        let err = StoreConfig::from_toml_str("data_dir = 3", Path::new("/x/config.toml"));
        assert!(err.is_err());
    }
}
