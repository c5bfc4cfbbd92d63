//! View Sources - raw template text and where it comes from

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type ViewId = String;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("View not found: {0}")]
    ViewNotFound(ViewId),

    #[error("Invalid view path: {0:?}")]
    InvalidPath(String),

    #[error("Failed to read view {view} at {}: {source}", .path.display())]
    Io {
        view: ViewId,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Immutable raw text of one template revision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSource {
    pub view: ViewId,
    #[serde(default)]
    pub path: Option<PathBuf>,
    pub text: String,
    #[serde(default)]
    pub modified: Option<DateTime<Utc>>,
}

impl TemplateSource {
    pub fn new(view: impl Into<ViewId>, text: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            path: None,
            text: text.into(),
            modified: None,
        }
    }
}

/// Normalize a view reference as written in a directive or passed by a host.
///
/// `"layouts/main"`, `'./layouts/main'` and `layouts\main` all name `layouts/main`.
pub fn normalize_view(raw: &str) -> Result<ViewId, SourceError> {
    let unquoted = unquote(raw.trim()).trim().replace('\\', "/");
    let mut parts = Vec::new();
    for part in unquoted.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(SourceError::InvalidPath(raw.to_string())),
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(SourceError::InvalidPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}

/// Strip one layer of matching single or double quotes
pub fn unquote(s: &str) -> &str {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Locates and loads template sources by view identity
pub trait ViewLoader: Send + Sync {
    fn load(&self, view: &str) -> Result<TemplateSource, SourceError>;

    /// Probe for a view without raising
    fn exists(&self, view: &str) -> bool;
}

/// Loads `<root>/<view>.<extension>` from disk
pub struct FileSystemLoader {
    root: PathBuf,
    extension: String,
}

impl FileSystemLoader {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into().trim_start_matches('.').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, view: &str) -> Result<PathBuf, SourceError> {
        let view = normalize_view(view)?;
        let mut path = self.root.join(&view);
        if !self.extension.is_empty() {
            let file = format!("{}.{}", view.rsplit('/').next().unwrap_or(&view), self.extension);
            path.set_file_name(file);
        }
        Ok(path)
    }
}

impl ViewLoader for FileSystemLoader {
    fn load(&self, view: &str) -> Result<TemplateSource, SourceError> {
        let id = normalize_view(view)?;
        let path = self.path_for(&id)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SourceError::ViewNotFound(id));
            }
            Err(source) => return Err(SourceError::Io { view: id, path, source }),
        };
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        Ok(TemplateSource {
            view: id,
            path: Some(path),
            text,
            modified,
        })
    }

    fn exists(&self, view: &str) -> bool {
        self.path_for(view).map_or(false, |p| p.is_file())
    }
}

/// Template registry - in-memory view sources
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<ViewId, TemplateSource>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self { templates: HashMap::new() }
    }

    /// Snapshot every `*.<extension>` file below `dir`
    pub fn load_from_dir(dir: &Path, extension: &str) -> Result<Self, io::Error> {
        let mut registry = Self::new();
        if dir.exists() {
            let loader = FileSystemLoader::new(dir, extension);
            registry.collect(&loader, dir, dir)?;
        }
        Ok(registry)
    }

    fn collect(&mut self, loader: &FileSystemLoader, root: &Path, dir: &Path) -> Result<(), io::Error> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(loader, root, &path)?;
                continue;
            }
            if path.extension().map_or(false, |e| e == loader.extension.as_str()) {
                let Ok(relative) = path.with_extension("").strip_prefix(root).map(Path::to_path_buf) else {
                    continue;
                };
                let view = relative.to_string_lossy().replace('\\', "/");
                if let Ok(source) = loader.load(&view) {
                    self.templates.insert(source.view.clone(), source);
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, view: &str) -> Option<&TemplateSource> {
        self.templates.get(view)
    }

    pub fn list(&self) -> Vec<&TemplateSource> {
        let mut sources: Vec<_> = self.templates.values().collect();
        sources.sort_by(|a, b| a.view.cmp(&b.view));
        sources
    }

    pub fn register(&mut self, view: &str, text: impl Into<String>) {
        self.register_source(TemplateSource::new(view, text));
    }

    /// Register with an explicit modification stamp
    pub fn register_at(&mut self, view: &str, text: impl Into<String>, modified: DateTime<Utc>) {
        let mut source = TemplateSource::new(view, text);
        source.modified = Some(modified);
        self.register_source(source);
    }

    pub fn register_source(&mut self, mut source: TemplateSource) {
        if let Ok(id) = normalize_view(&source.view) {
            source.view = id;
        }
        self.templates.insert(source.view.clone(), source);
    }
}

impl ViewLoader for TemplateRegistry {
    fn load(&self, view: &str) -> Result<TemplateSource, SourceError> {
        let id = normalize_view(view)?;
        self.templates
            .get(&id)
            .cloned()
            .ok_or(SourceError::ViewNotFound(id))
    }

    fn exists(&self, view: &str) -> bool {
        normalize_view(view).map_or(false, |id| self.templates.contains_key(&id))
    }
}

/// Shares one registry between an engine and the test or host that edits it
impl<L: ViewLoader + ?Sized> ViewLoader for std::sync::Arc<L> {
    fn load(&self, view: &str) -> Result<TemplateSource, SourceError> {
        (**self).load(view)
    }

    fn exists(&self, view: &str) -> bool {
        (**self).exists(view)
    }
}

impl<L: ViewLoader> ViewLoader for std::sync::RwLock<L> {
    fn load(&self, view: &str) -> Result<TemplateSource, SourceError> {
        match self.read() {
            Ok(inner) => inner.load(view),
            Err(poisoned) => poisoned.into_inner().load(view),
        }
    }

    fn exists(&self, view: &str) -> bool {
        match self.read() {
            Ok(inner) => inner.exists(view),
            Err(poisoned) => poisoned.into_inner().exists(view),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_view() {
        assert_eq!(normalize_view("\"layouts/main\"").unwrap(), "layouts/main");
        assert_eq!(normalize_view(" './widget' ").unwrap(), "widget");
        assert_eq!(normalize_view("partials\\nav").unwrap(), "partials/nav");
        assert!(matches!(normalize_view("../secret"), Err(SourceError::InvalidPath(_))));
        assert!(matches!(normalize_view("\"\""), Err(SourceError::InvalidPath(_))));
    }

    #[test]
    fn test_registry_load_and_exists() {
        let mut registry = TemplateRegistry::new();
        registry.register("page", "Hello");
        assert!(registry.exists("page"));
        assert!(registry.exists("'page'"));
        assert!(!registry.exists("missing"));
        assert!(!registry.exists("../page"));
        assert_eq!(registry.load("page").unwrap().text, "Hello");
        assert!(matches!(registry.load("missing"), Err(SourceError::ViewNotFound(v)) if v == "missing"));
    }

    #[test]
    fn test_file_loader_reads_text_and_mtime() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("layouts")).unwrap();
        fs::write(dir.path().join("layouts/main.html"), "Header").unwrap();

        let loader = FileSystemLoader::new(dir.path(), ".html");
        let source = loader.load("layouts/main").unwrap();
        assert_eq!(source.view, "layouts/main");
        assert_eq!(source.text, "Header");
        assert!(source.modified.is_some());
        assert!(loader.exists("layouts/main"));
        assert!(!loader.exists("layouts/missing"));
        assert!(matches!(loader.load("nope"), Err(SourceError::ViewNotFound(_))));
    }

    #[test]
    fn test_registry_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("partials")).unwrap();
        fs::write(dir.path().join("home.html"), "Home").unwrap();
        fs::write(dir.path().join("partials/nav.html"), "Nav").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = TemplateRegistry::load_from_dir(dir.path(), "html").unwrap();
        let views: Vec<_> = registry.list().iter().map(|s| s.view.clone()).collect();
        assert_eq!(views, vec!["home".to_string(), "partials/nav".to_string()]);
    }
}
