//! Engine configuration

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::expr::Dictionary;

pub const DEFAULT_EXTENSION: &str = "html";
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Directory views are loaded from
    pub root: PathBuf,
    /// Persistent cache directory; in-memory cache when unset
    pub cache_dir: Option<PathBuf>,
    pub extension: String,
    /// Source-mapped faults and per-unit spans
    pub debug: bool,
    pub max_depth: usize,
    /// Value of the reserved `context` key when the caller does not set one
    pub context: Dictionary,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("views"),
            cache_dir: None,
            extension: DEFAULT_EXTENSION.to_string(),
            debug: false,
            max_depth: DEFAULT_MAX_DEPTH,
            context: Dictionary::new(),
        }
    }
}

impl EngineConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Load a JSON config file. Relative paths resolve against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        if let Some(base) = path.parent() {
            if config.root.is_relative() {
                config.root = base.join(&config.root);
            }
            if let Some(dir) = config.cache_dir.as_mut().filter(|d| d.is_relative()) {
                *dir = base.join(&*dir);
            }
        }
        Ok(config)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_context(mut self, context: Dictionary) -> Self {
        self.context = context;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.extension, "html");
        assert_eq!(config.max_depth, 64);
        assert!(!config.debug);
        assert!(config.cache_dir.is_none());
    }

    #[test]
    fn test_load_camel_case_and_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("views.json");
        fs::write(
            &path,
            r#"{"root": "templates", "cacheDir": "cache", "debug": true, "maxDepth": 8, "context": {"site": "Demo"}}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.root, dir.path().join("templates"));
        assert_eq!(config.cache_dir, Some(dir.path().join("cache")));
        assert_eq!(config.extension, "html");
        assert!(config.debug);
        assert_eq!(config.max_depth, 8);
        assert_eq!(config.context.get("site"), Some(&json!("Demo")));
    }

    #[test]
    fn test_load_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            EngineConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));

        let path = dir.path().join("bad.json");
        fs::write(&path, "{\"maxDepth\": \"deep\"}").unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(ConfigError::Parse { .. })));
    }
}
