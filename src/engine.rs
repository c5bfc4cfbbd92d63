//! View Engine - single entry point for hosts
//!
//! Wires the loader, cache, resolver and renderer together from an
//! [`EngineConfig`]. Hosts talk to it through [`Engine`] or the
//! [`ViewEngine`] trait when the engine is substitutable.

use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::cache::{CacheError, CacheStats, CacheStore, FileStore, FragmentCache, MemoryStore};
use crate::compiler::{CompileError, CompiledFragment};
use crate::config::{ConfigError, EngineConfig};
use crate::debug::{Fault, ViewException};
use crate::expr::{Dictionary, Functions};
use crate::render::Renderer;
use crate::resolver::Resolver;
use crate::templates::{FileSystemLoader, SourceError, ViewLoader};

#[derive(Debug, Error)]
pub enum ViewError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Compile(CompileError),

    #[error("Circular extends: {0}")]
    CircularExtends(String),

    #[error("Circular content: {0}")]
    CircularContent(String),

    #[error("Render depth exceeded at {view} (limit {limit})")]
    RenderDepthExceeded { view: String, limit: usize },

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error(transparent)]
    View(Box<ViewException>),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// Reference errors surface unwrapped, whichever pass hit them
impl From<CompileError> for ViewError {
    fn from(err: CompileError) -> Self {
        match err {
            CompileError::Source(source) => ViewError::Source(source),
            other => ViewError::Compile(other),
        }
    }
}

impl ViewError {
    /// Source-mapped exception, present in debug mode only
    pub fn exception(&self) -> Option<&ViewException> {
        match self {
            ViewError::View(exception) => Some(exception.as_ref()),
            _ => None,
        }
    }

    /// Faults raised while executing a template, as opposed to lookup errors
    pub fn is_execution_fault(&self) -> bool {
        matches!(self, ViewError::Fault(_) | ViewError::View(_))
    }
}

/// The contract a host relies on; alternate engines implement it too
pub trait ViewEngine: Send + Sync {
    fn render(&self, view: &str, data: Dictionary) -> Result<String, ViewError>;

    fn view_exists(&self, view: &str) -> bool;
}

pub struct Engine {
    config: EngineConfig,
    resolver: Resolver,
    functions: Functions,
}

impl Engine {
    /// Filesystem views under `config.root`; file cache when `cache_dir` is set
    pub fn new(config: EngineConfig) -> Result<Self, ViewError> {
        let loader = FileSystemLoader::new(&config.root, &config.extension);
        let store: Box<dyn CacheStore> = match &config.cache_dir {
            Some(dir) => Box::new(FileStore::new(dir)?),
            None => Box::new(MemoryStore::new()),
        };
        Ok(Self::with_loader(config, loader, store))
    }

    pub fn with_loader(config: EngineConfig, loader: impl ViewLoader + 'static, store: Box<dyn CacheStore>) -> Self {
        let resolver = Resolver::new(Box::new(loader), FragmentCache::new(store), config.debug);
        Self {
            config,
            resolver,
            functions: Functions::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Make a host function callable from templates
    pub fn register_function<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.functions.register(name, f);
    }

    pub fn render(&self, view: &str, data: Dictionary) -> Result<String, ViewError> {
        let span = tracing::info_span!("render", view, render_id = %Uuid::new_v4());
        let _guard = span.enter();

        let result = Renderer::new(&self.resolver, &self.functions, &self.config).render(view, data);
        if let Err(e) = &result {
            tracing::debug!(error = %e, "render failed");
        }
        result
    }

    pub fn view_exists(&self, view: &str) -> bool {
        self.resolver.exists(view)
    }

    /// Compile `view` and its ancestors into the cache without rendering
    pub fn compile(&self, view: &str) -> Result<Vec<Arc<CompiledFragment>>, ViewError> {
        self.resolver.resolve_chain(view)
    }

    /// Remove cache entries of earlier revisions of `view`
    pub fn prune_cache(&self, view: &str) -> Result<usize, ViewError> {
        self.resolver.prune(view)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.resolver.cache_stats()
    }
}

impl ViewEngine for Engine {
    fn render(&self, view: &str, data: Dictionary) -> Result<String, ViewError> {
        Engine::render(self, view, data)
    }

    fn view_exists(&self, view: &str) -> bool {
        Engine::view_exists(self, view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateRegistry;
    use serde_json::json;
    use std::fs;

    #[test]
    fn test_host_functions_are_callable() {
        let mut registry = TemplateRegistry::new();
        registry.register("page", "{{ shout($name) }}");
        let mut engine = Engine::with_loader(EngineConfig::default(), registry, Box::new(MemoryStore::new()));
        engine.register_function("shout", |args| {
            let text = args.first().and_then(Value::as_str).ok_or("shout() expects a string")?;
            Ok(Value::String(format!("{}!", text.to_uppercase())))
        });

        let mut data = Dictionary::new();
        data.insert("name".into(), json!("hey"));
        assert_eq!(engine.render("page", data).unwrap(), "HEY!");
    }

    #[test]
    fn test_filesystem_engine() {
        let dir = tempfile::tempdir().unwrap();
        let views = dir.path().join("views");
        fs::create_dir_all(views.join("layouts")).unwrap();
        fs::write(views.join("layouts/main.html"), "[{% content body %}]").unwrap();
        fs::write(views.join("home.html"), "{% extends layouts/main %}{% block body %}home{% end block %}").unwrap();

        let config = EngineConfig::new(&views).with_cache_dir(dir.path().join("cache"));
        let engine = Engine::new(config).unwrap();
        assert!(engine.view_exists("home"));
        assert!(!engine.view_exists("away"));
        assert_eq!(engine.render("home", Dictionary::new()).unwrap(), "[home]");
        assert!(fs::read_dir(dir.path().join("cache")).unwrap().count() >= 3);
    }

    #[test]
    fn test_engine_behind_trait_object() {
        let mut registry = TemplateRegistry::new();
        registry.register("hello", "Hello {{ $who }}");
        let engine: Box<dyn ViewEngine> = Box::new(Engine::with_loader(
            EngineConfig::default(),
            registry,
            Box::new(MemoryStore::new()),
        ));

        let mut data = Dictionary::new();
        data.insert("who".into(), json!("world"));
        assert_eq!(engine.render("hello", data).unwrap(), "Hello world");
        assert!(engine.view_exists("hello"));
    }

    #[test]
    fn test_compile_error_flattens_reference_errors() {
        let err = ViewError::from(CompileError::Source(SourceError::ViewNotFound("x".into())));
        assert!(matches!(err, ViewError::Source(SourceError::ViewNotFound(_))));
        assert!(!err.is_execution_fault());
    }
}
