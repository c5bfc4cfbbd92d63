//! Template Resolver - loads, fingerprints and compiles views and their
//! `extends` chains

use std::sync::Arc;

use crate::cache::{CacheStats, FragmentCache};
use crate::compiler::{compile, splice_includes, CompiledFragment, Spliced};
use crate::engine::ViewError;
use crate::hashing::compute_fingerprint;
use crate::templates::{normalize_view, TemplateSource, ViewId, ViewLoader};
use crate::ENGINE_VERSION;

pub struct Resolver {
    loader: Box<dyn ViewLoader>,
    cache: FragmentCache,
    debug: bool,
}

struct Revision {
    source: TemplateSource,
    spliced: Spliced,
    fingerprint: String,
}

impl Resolver {
    pub fn new(loader: Box<dyn ViewLoader>, cache: FragmentCache, debug: bool) -> Self {
        Self { loader, cache, debug }
    }

    fn revision(&self, view: &ViewId) -> Result<Revision, ViewError> {
        let source = self.loader.load(view)?;
        let spliced = splice_includes(self.loader.as_ref(), &source)?;
        let fingerprint = compute_fingerprint(&spliced.text, &spliced.stamps, self.debug, ENGINE_VERSION);
        Ok(Revision { source, spliced, fingerprint })
    }

    /// Compiled fragment for the current revision of `view`, from cache when possible
    pub fn resolve(&self, view: &str) -> Result<Arc<CompiledFragment>, ViewError> {
        let id = normalize_view(view)?;
        let Revision { source, spliced, fingerprint } = self.revision(&id)?;

        if let Some(fragment) = self.cache.load(&id, &fingerprint)? {
            return Ok(fragment);
        }

        let fragment = Arc::new(compile(Arc::new(source), &spliced.text, fingerprint, self.debug)?);
        tracing::info!(
            view = %id,
            blocks = fragment.block_names.len(),
            parent = ?fragment.parent,
            "compiled view"
        );
        self.cache.store(&fragment)?;
        Ok(fragment)
    }

    /// Leaf-to-root chain of fragments linked by `extends`
    pub fn resolve_chain(&self, view: &str) -> Result<Vec<Arc<CompiledFragment>>, ViewError> {
        let mut chain: Vec<Arc<CompiledFragment>> = Vec::new();
        let mut next = Some(normalize_view(view)?);

        while let Some(id) = next {
            if chain.iter().any(|fragment| fragment.view == id) {
                let mut path: Vec<&str> = chain.iter().map(|f| f.view.as_str()).collect();
                path.push(&id);
                return Err(ViewError::CircularExtends(path.join(" -> ")));
            }
            let fragment = self.resolve(&id)?;
            next = fragment.parent.clone();
            chain.push(fragment);
        }

        Ok(chain)
    }

    pub fn exists(&self, view: &str) -> bool {
        self.loader.exists(view)
    }

    /// Drop cache entries of `view` left behind by earlier revisions
    pub fn prune(&self, view: &str) -> Result<usize, ViewError> {
        let id = normalize_view(view)?;
        let revision = self.revision(&id)?;
        Ok(self.cache.prune(&id, &revision.fingerprint)?)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::templates::{SourceError, TemplateRegistry};

    fn resolver_for(views: &[(&str, &str)]) -> Resolver {
        let mut registry = TemplateRegistry::new();
        for (view, text) in views {
            registry.register(view, *text);
        }
        Resolver::new(Box::new(registry), FragmentCache::new(Box::new(MemoryStore::new())), false)
    }

    #[test]
    fn test_chain_is_leaf_to_root() {
        let resolver = resolver_for(&[
            ("page", "{% extends 'layouts/base' %}"),
            ("layouts/base", "{% extends layouts/root %}"),
            ("layouts/root", "<html>{% content main %}</html>"),
        ]);
        let chain = resolver.resolve_chain("page").unwrap();
        let views: Vec<_> = chain.iter().map(|f| f.view.as_str()).collect();
        assert_eq!(views, vec!["page", "layouts/base", "layouts/root"]);
    }

    #[test]
    fn test_circular_extends_fails_fast() {
        let resolver = resolver_for(&[("a", "{% extends b %}"), ("b", "{% extends a %}")]);
        let err = resolver.resolve_chain("a").unwrap_err();
        assert!(matches!(err, ViewError::CircularExtends(chain) if chain == "a -> b -> a"));

        let resolver = resolver_for(&[("self", "{% extends self %}")]);
        assert!(matches!(resolver.resolve_chain("self"), Err(ViewError::CircularExtends(_))));
    }

    #[test]
    fn test_missing_parent_and_include_are_reference_errors() {
        let resolver = resolver_for(&[("a", "{% extends ghost %}"), ("b", "{% include ghost %}")]);
        assert!(matches!(
            resolver.resolve_chain("a"),
            Err(ViewError::Source(SourceError::ViewNotFound(v))) if v == "ghost"
        ));
        assert!(matches!(
            resolver.resolve("b"),
            Err(ViewError::Source(SourceError::ViewNotFound(_)))
        ));
    }

    #[test]
    fn test_second_resolve_hits_cache() {
        let resolver = resolver_for(&[("page", "Hello")]);
        let first = resolver.resolve("page").unwrap();
        let second = resolver.resolve("'page'").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.cache_stats().hits, 1);
        assert_eq!(resolver.cache_stats().misses, 1);
    }

    #[test]
    fn test_exists_never_raises() {
        let resolver = resolver_for(&[("page", "Hello")]);
        assert!(resolver.exists("page"));
        assert!(!resolver.exists("nope"));
        assert!(!resolver.exists("../page"));
    }
}
