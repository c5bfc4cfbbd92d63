//! Renderer - executes an inheritance chain against a data dictionary
//!
//! Block overrides are merged down the chain so the nearest descendant wins,
//! then only the root fragment is executed. `content` pulls merged blocks in,
//! `render` recurses into a fresh render of another view.

use serde_json::Value;
use std::sync::Arc;

use crate::args::Binding;
use crate::compiler::{BlockMap, CompiledFragment, Node};
use crate::config::EngineConfig;
use crate::debug::{intercept, Fault, Unit};
use crate::engine::ViewError;
use crate::expr::{is_truthy, iterate, to_output, Dictionary, EvalError, Evaluator, Expr, Functions, Scope};
use crate::resolver::Resolver;
use crate::templates::SourceError;

/// Reserved key holding the identity of the view being rendered
pub const VIEW_KEY: &str = "view";
/// Reserved key holding the ambient host context
pub const CONTEXT_KEY: &str = "context";

/// Per-call execution state, discarded when the render returns
struct RenderContext {
    scope: Scope,
    blocks: BlockMap,
    /// Names of the blocks currently executing, outermost first
    active: Vec<String>,
    depth: usize,
}

pub struct Renderer<'e> {
    resolver: &'e Resolver,
    functions: &'e Functions,
    config: &'e EngineConfig,
}

impl<'e> Renderer<'e> {
    pub fn new(resolver: &'e Resolver, functions: &'e Functions, config: &'e EngineConfig) -> Self {
        Self { resolver, functions, config }
    }

    pub fn render(&self, view: &str, data: Dictionary) -> Result<String, ViewError> {
        self.render_at(view, data, 0)
    }

    fn render_at(&self, view: &str, mut data: Dictionary, depth: usize) -> Result<String, ViewError> {
        if depth > self.config.max_depth {
            return Err(ViewError::RenderDepthExceeded {
                view: view.to_string(),
                limit: self.config.max_depth,
            });
        }

        let chain = self.resolver.resolve_chain(view)?;
        let (Some(leaf), Some(root)) = (chain.first(), chain.last()) else {
            return Err(SourceError::ViewNotFound(view.to_string()).into());
        };

        data.insert(VIEW_KEY.to_string(), Value::String(leaf.view.clone()));
        if !data.contains_key(CONTEXT_KEY) {
            data.insert(CONTEXT_KEY.to_string(), Value::Object(self.config.context.clone()));
        }

        let mut ctx = RenderContext {
            scope: Scope::new(data),
            blocks: merge_blocks(&chain),
            active: Vec::new(),
            depth,
        };
        let mut out = String::new();
        intercept(self.config.debug, Unit::Root(root), || {
            self.exec(&root.nodes, &mut ctx, &mut out)
        })?;
        Ok(out)
    }

    fn exec(&self, nodes: &[Node], ctx: &mut RenderContext, out: &mut String) -> Result<(), ViewError> {
        for node in nodes {
            match node {
                Node::Text { text } => out.push_str(text),
                Node::Output { expr, line } => {
                    let value = self.eval(expr, ctx, *line)?;
                    let text = to_output(&value).map_err(|e| self.fault(e, *line, ctx))?;
                    out.push_str(&text);
                }
                Node::Content { name, .. } => {
                    // Undefined blocks render as nothing
                    if let Some(block) = ctx.blocks.get(name).cloned() {
                        if ctx.active.contains(name) {
                            let mut path = ctx.active.clone();
                            path.push(name.clone());
                            return Err(ViewError::CircularContent(path.join(" -> ")));
                        }
                        ctx.active.push(name.clone());
                        let executed = intercept(self.config.debug, Unit::Block(&block), || {
                            self.exec(&block.body, ctx, out)
                        });
                        ctx.active.pop();
                        executed?;
                    }
                }
                Node::Render { view, bindings, line } => {
                    let html = self.render_subview(view, bindings, ctx, *line)?;
                    out.push_str(&html);
                }
                Node::If { branches, line } => {
                    for branch in branches {
                        let taken = match &branch.condition {
                            Some(condition) => is_truthy(&self.eval(condition, ctx, *line)?),
                            None => true,
                        };
                        if taken {
                            self.exec(&branch.body, ctx, out)?;
                            break;
                        }
                    }
                }
                Node::Foreach { source, key, value, body, line } => {
                    let iterable = self.eval(source, ctx, *line)?;
                    let entries = iterate(&iterable).map_err(|e| self.fault(e, *line, ctx))?;
                    ctx.scope.push();
                    let looped = self.exec_loop(entries, key.as_deref(), value, body, ctx, out);
                    ctx.scope.pop();
                    looped?;
                }
                Node::Fault { message, line } => {
                    return Err(ViewError::Fault(Fault {
                        message: message.clone(),
                        line: *line,
                        data: self.captured(ctx),
                    }));
                }
            }
        }
        Ok(())
    }

    fn exec_loop(
        &self,
        entries: Vec<(Value, Value)>,
        key: Option<&str>,
        value: &str,
        body: &[Node],
        ctx: &mut RenderContext,
        out: &mut String,
    ) -> Result<(), ViewError> {
        for (k, v) in entries {
            if let Some(key) = key {
                ctx.scope.set(key, k);
            }
            ctx.scope.set(value, v);
            self.exec(body, ctx, out)?;
        }
        Ok(())
    }

    /// Caller entries plus bindings; bindings are evaluated in the caller scope
    fn render_subview(
        &self,
        view: &str,
        bindings: &[Binding],
        ctx: &RenderContext,
        line: u32,
    ) -> Result<String, ViewError> {
        let mut bound = Vec::with_capacity(bindings.len());
        for binding in bindings {
            bound.push((binding.name.clone(), self.eval(&binding.value, ctx, line)?));
        }

        let mut data = ctx.scope.flatten();
        data.remove(VIEW_KEY);
        for (name, value) in bound {
            data.insert(name, value);
        }
        self.render_at(view, data, ctx.depth + 1)
    }

    fn eval(&self, expr: &Expr, ctx: &RenderContext, line: u32) -> Result<Value, ViewError> {
        Evaluator::new(&ctx.scope, self.functions)
            .eval(expr)
            .map_err(|e| self.fault(e, line, ctx))
    }

    fn fault(&self, error: EvalError, line: u32, ctx: &RenderContext) -> ViewError {
        ViewError::Fault(Fault {
            message: error.to_string(),
            line,
            data: self.captured(ctx),
        })
    }

    // Variables never leave the engine outside debug mode
    fn captured(&self, ctx: &RenderContext) -> Option<Dictionary> {
        self.config.debug.then(|| ctx.scope.flatten())
    }
}

/// Root first, so blocks of nearer descendants overwrite their ancestors'
fn merge_blocks(chain: &[Arc<CompiledFragment>]) -> BlockMap {
    let mut merged = BlockMap::new();
    for fragment in chain.iter().rev() {
        for (name, block) in &fragment.blocks {
            merged.insert(name.clone(), Arc::clone(block));
        }
    }
    merged
}
