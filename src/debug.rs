//! Debug Error Mapper - source-mapped view exceptions
//!
//! Execution happens on compiled units (a root fragment or an extracted
//! block), so a raw fault line is relative to that unit. In debug mode each
//! unit runs inside [`intercept`], which translates the line back into the
//! unit's own template file and attaches the source and the data in scope.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::compiler::{Block, CompiledFragment};
use crate::engine::ViewError;
use crate::expr::Dictionary;
use crate::templates::{TemplateSource, ViewId};

/// Raw execution fault, line relative to the executing unit
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} on line {line}")]
pub struct Fault {
    pub message: String,
    pub line: u32,
    /// Variables in scope; only captured in debug mode
    pub data: Option<Dictionary>,
}

/// A fault mapped back to the template file it came from
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{message} (View: {view}, line {line})")]
pub struct ViewException {
    pub message: String,
    pub line: u32,
    pub view: ViewId,
    pub file: Option<PathBuf>,
    /// Uncompiled template text
    pub original: String,
    pub data: Dictionary,
}

/// An independently executed compiled unit
#[derive(Debug, Clone, Copy)]
pub enum Unit<'a> {
    Root(&'a CompiledFragment),
    Block(&'a Block),
}

impl Unit<'_> {
    pub fn view(&self) -> &str {
        match self {
            Unit::Root(fragment) => &fragment.view,
            Unit::Block(block) => &block.view,
        }
    }

    fn label(&self) -> &str {
        match self {
            Unit::Root(_) => "root",
            Unit::Block(block) => &block.name,
        }
    }

    fn source(&self) -> &TemplateSource {
        match self {
            Unit::Root(fragment) => &fragment.source,
            Unit::Block(block) => &block.source,
        }
    }

    /// Unit-relative line -> line in the unit's template file
    pub fn source_line(&self, raw: u32) -> u32 {
        match self {
            Unit::Root(_) => raw,
            Unit::Block(block) => match block.offset {
                Some(offset) => (raw + offset).saturating_sub(1),
                None => raw,
            },
        }
    }

    fn map(&self, fault: Fault) -> ViewException {
        let source = self.source();
        ViewException {
            line: self.source_line(fault.line),
            message: fault.message,
            view: self.view().to_string(),
            file: source.path.clone(),
            original: source.text.clone(),
            data: fault.data.unwrap_or_default(),
        }
    }
}

/// Run one unit, mapping raw faults to [`ViewException`]s in debug mode.
///
/// Already-mapped exceptions from nested units and reference errors pass
/// through untouched.
pub fn intercept<T>(
    debug: bool,
    unit: Unit<'_>,
    run: impl FnOnce() -> Result<T, ViewError>,
) -> Result<T, ViewError> {
    if !debug {
        return run();
    }

    let span = tracing::debug_span!("unit", view = unit.view(), unit = unit.label());
    let _guard = span.enter();

    run().map_err(|err| match err {
        ViewError::Fault(fault) => {
            let exception = unit.map(fault);
            tracing::debug!(view = %exception.view, line = exception.line, "mapped view fault");
            ViewError::View(Box::new(exception))
        }
        other => other,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::templates::SourceError;
    use serde_json::json;
    use std::sync::Arc;

    fn fragment(text: &str, debug: bool) -> CompiledFragment {
        let mut source = TemplateSource::new("child", text);
        source.path = Some(PathBuf::from("views/child.html"));
        compile(Arc::new(source), text, "fp".into(), debug).unwrap()
    }

    fn fault(line: u32) -> ViewError {
        let mut data = Dictionary::new();
        data.insert("title".into(), json!("Hi"));
        ViewError::Fault(Fault {
            message: "Undefined variable $nope".into(),
            line,
            data: Some(data),
        })
    }

    #[test]
    fn test_block_fault_is_offset() {
        let compiled = fragment("a\nb\n{% block main %}\nx\n{{ $nope }}{% end block %}", true);
        let block = &compiled.blocks["main"];
        let err = intercept(true, Unit::Block(block), || Err::<(), _>(fault(3))).unwrap_err();

        match err {
            ViewError::View(exception) => {
                assert_eq!(exception.line, 5);
                assert_eq!(exception.view, "child");
                assert_eq!(exception.file, Some(PathBuf::from("views/child.html")));
                assert!(exception.original.contains("{% block main %}"));
                assert_eq!(exception.data.get("title"), Some(&json!("Hi")));
            }
            other => panic!("expected mapped exception, got {:?}", other),
        }
    }

    #[test]
    fn test_root_fault_keeps_raw_line() {
        let compiled = fragment("a\n{{ $nope }}", true);
        let err = intercept(true, Unit::Root(&compiled), || Err::<(), _>(fault(2))).unwrap_err();
        assert!(matches!(err, ViewError::View(e) if e.line == 2));
    }

    #[test]
    fn test_mapped_and_reference_errors_pass_through() {
        let outer = fragment("outer", true);
        let inner = fragment("{% block b %}\n{% end block %}", true);
        let mapped = intercept(true, Unit::Block(&inner.blocks["b"]), || Err::<(), _>(fault(1))).unwrap_err();
        let again = intercept(true, Unit::Root(&outer), || Err::<(), _>(mapped)).unwrap_err();
        assert!(matches!(again, ViewError::View(e) if e.line == 1 && e.view == "child"));

        let missing = intercept(true, Unit::Root(&outer), || {
            Err::<(), _>(ViewError::Source(SourceError::ViewNotFound("gone".into())))
        })
        .unwrap_err();
        assert!(matches!(missing, ViewError::Source(SourceError::ViewNotFound(_))));
    }

    #[test]
    fn test_production_leaves_faults_unmapped() {
        let compiled = fragment("{{ $nope }}", false);
        let err = intercept(false, Unit::Root(&compiled), || Err::<(), _>(fault(1))).unwrap_err();
        assert!(matches!(err, ViewError::Fault(f) if f.line == 1));
    }
}
