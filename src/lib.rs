//! ForgeViews Core - View Compiler
//!
//! Template inheritance and rendering for the ForgeViews theme layer.
//!
//! # Guarantees
//! 1. Compilation Is Deterministic
//! 2. Text Without Directives Passes Through Unchanged
//! 3. The Nearest Descendant's Block Wins
//! 4. Cache Entries Never Go Stale In Place
//! 5. Debug Faults Point At The Line That Caused Them

pub mod args;
pub mod cache;
pub mod compiler;
pub mod config;
pub mod debug;
pub mod engine;
pub mod expr;
pub mod hashing;
pub mod render;
pub mod resolver;
pub mod templates;

pub use args::{parse_arguments, Binding};
pub use cache::{CacheError, CacheStats, CacheStore, FileStore, FragmentCache, MemoryStore};
pub use compiler::{Block, CompileError, CompiledFragment, Node};
pub use config::{ConfigError, EngineConfig};
pub use debug::{Fault, ViewException};
pub use engine::{Engine, ViewEngine, ViewError};
pub use expr::{Dictionary, EvalError, Functions};
pub use templates::{FileSystemLoader, SourceError, TemplateRegistry, TemplateSource, ViewId, ViewLoader};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
