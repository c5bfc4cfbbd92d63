//! Fragment Compiler - template text to executable node trees
//!
//! Directives are applied in a fixed order, each pass only seeing what the
//! previous ones left behind:
//!
//! 1. `include` splices other files in, textually
//! 2. `extends` is recorded as the parent reference and removed
//! 3. `content` and `render` become placeholder / subview nodes
//! 4. `block ... end block` bodies are compiled as standalone units and
//!    captured out-of-band
//! 5. `foreach`, `if` and `{{ }}` map onto control and output nodes
//!
//! The compiler is permissive: unknown tags stay literal text, and structural
//! mistakes compile to [`Node::Fault`] nodes that raise when executed.

use chrono::{DateTime, Utc};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

use crate::args::{parse_arguments, Binding};
use crate::expr::{self, Expr};
use crate::templates::{normalize_view, unquote, SourceError, TemplateSource, ViewId, ViewLoader};
use crate::ENGINE_VERSION;

static INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{%\s*include\s+(.+?)\s*%\}").expect("valid include pattern"));

static EXTENDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{%\s*extends\s+(.+?)\s*%\}").expect("valid extends pattern"));

#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Circular include: {0}")]
    CircularInclude(String),
}

pub type BlockMap = BTreeMap<String, Arc<Block>>;

/// One node of a compiled template.
///
/// `line` is relative to the unit the node belongs to: the fragment itself,
/// or the block body it was extracted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Text { text: String },
    Output { expr: Expr, line: u32 },
    Content { name: String, line: u32 },
    Render { view: String, bindings: Vec<Binding>, line: u32 },
    If { branches: Vec<Branch>, line: u32 },
    Foreach {
        source: Expr,
        key: Option<String>,
        value: String,
        body: Vec<Node>,
        line: u32,
    },
    /// Deferred syntax fault, raised when execution reaches it
    Fault { message: String, line: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    /// `None` for the `else` branch
    pub condition: Option<Expr>,
    pub body: Vec<Node>,
}

/// A named override region captured from `block ... end block`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub name: String,
    pub view: ViewId,
    pub body: Vec<Node>,
    /// Source line where the body starts; only recorded in debug mode
    pub offset: Option<u32>,
    pub source: Arc<TemplateSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledFragment {
    pub view: ViewId,
    pub fingerprint: String,
    pub parent: Option<ViewId>,
    pub nodes: Vec<Node>,
    pub block_names: Vec<String>,
    /// Persisted separately, one cache entry per block
    #[serde(skip)]
    pub blocks: BlockMap,
    pub source: Arc<TemplateSource>,
    pub engine_version: String,
}

/// Template text after `include` splicing
#[derive(Debug, Clone)]
pub struct Spliced {
    pub text: String,
    /// Modification stamps of the view and every file spliced into it
    pub stamps: Vec<Option<DateTime<Utc>>>,
}

/// Pass 1: splice included files into the view text, recursively
pub fn splice_includes(loader: &dyn ViewLoader, source: &TemplateSource) -> Result<Spliced, CompileError> {
    let mut stamps = vec![source.modified];
    let mut stack = vec![source.view.clone()];
    let text = splice(loader, &source.text, &mut stack, &mut stamps)?;
    Ok(Spliced { text, stamps })
}

fn splice(
    loader: &dyn ViewLoader,
    text: &str,
    stack: &mut Vec<ViewId>,
    stamps: &mut Vec<Option<DateTime<Utc>>>,
) -> Result<String, CompileError> {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in INCLUDE_RE.captures_iter(text) {
        let (Some(whole), Some(target)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&text[last..whole.start()]);

        let view = normalize_view(target.as_str())?;
        if stack.contains(&view) {
            let mut chain = stack.clone();
            chain.push(view);
            return Err(CompileError::CircularInclude(chain.join(" -> ")));
        }
        let included = loader.load(&view)?;
        stamps.push(included.modified);
        stack.push(view);
        out.push_str(&splice(loader, &included.text, stack, stamps)?);
        stack.pop();

        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Pass 2: strip `extends` tags, returning the first target
fn extract_extends(text: &str) -> Result<(String, Option<ViewId>), CompileError> {
    let mut targets = Vec::new();
    let stripped = EXTENDS_RE.replace_all(text, |caps: &Captures| {
        targets.push(caps[1].to_string());
        ""
    });
    let stripped = stripped.into_owned();
    if targets.len() > 1 {
        tracing::warn!(extends = ?targets, "multiple extends tags, using the first");
    }
    let parent = match targets.first() {
        Some(target) => Some(normalize_view(target)?),
        None => None,
    };
    Ok((stripped, parent))
}

/// Compile spliced template text into a fragment.
///
/// A pure function of its inputs: the same text always yields the same fragment.
pub fn compile(
    source: Arc<TemplateSource>,
    spliced: &str,
    fingerprint: String,
    debug: bool,
) -> Result<CompiledFragment, CompileError> {
    let (text, parent) = extract_extends(spliced)?;
    let tokens = tokenize(&text);

    let mut sink = BlockSink {
        view: &source.view,
        source: &source,
        debug,
        blocks: BlockMap::new(),
    };
    let mut cursor = Cursor { tokens: &tokens, pos: 0, base_line: 1 };
    let (nodes, _) = parse_nodes(&mut cursor, &mut sink, &[]);
    let blocks = sink.blocks;

    Ok(CompiledFragment {
        view: source.view.clone(),
        fingerprint,
        parent,
        nodes,
        block_names: blocks.keys().cloned().collect(),
        blocks,
        source,
        engine_version: ENGINE_VERSION.to_string(),
    })
}

// --- Tokenizer ---

#[derive(Debug, Clone, Copy)]
enum Token<'s> {
    Text(&'s str),
    Output { expr: &'s str, line: u32 },
    Tag { body: &'s str, raw: &'s str, line: u32, end_line: u32 },
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut line = 1u32;
    let mut i = 0;

    while i < text.len() {
        let next = text[i..]
            .match_indices('{')
            .map(|(p, _)| i + p)
            .find(|&p| matches!(text.as_bytes().get(p + 1), Some(b'{') | Some(b'%')));
        let Some(open) = next else {
            break;
        };
        let is_output = text.as_bytes()[open + 1] == b'{';
        let close_delim = if is_output { "}}" } else { "%}" };
        let Some(close) = text[open + 2..].find(close_delim).map(|p| open + 2 + p) else {
            break;
        };

        if open > i {
            let literal = &text[i..open];
            tokens.push(Token::Text(literal));
            line += count_lines(literal);
        }

        let raw = &text[open..close + 2];
        let body = &text[open + 2..close];
        let end_line = line + count_lines(raw);
        tokens.push(if is_output {
            Token::Output { expr: body, line }
        } else {
            Token::Tag { body, raw, line, end_line }
        });
        line = end_line;
        i = close + 2;
    }

    if i < text.len() {
        tokens.push(Token::Text(&text[i..]));
    }
    tokens
}

fn count_lines(s: &str) -> u32 {
    s.bytes().filter(|&b| b == b'\n').count() as u32
}

// --- Directives ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Directive<'s> {
    Content(&'s str),
    Render(&'s str),
    BlockOpen(&'s str),
    BlockClose,
    Foreach(&'s str),
    EndForeach,
    If(&'s str),
    ElseIf(&'s str),
    Else,
    EndIf,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Terminator {
    ElseIf,
    Else,
    EndIf,
    EndForeach,
}

impl Directive<'_> {
    fn terminator(&self) -> Option<Terminator> {
        match self {
            Directive::ElseIf(_) => Some(Terminator::ElseIf),
            Directive::Else => Some(Terminator::Else),
            Directive::EndIf => Some(Terminator::EndIf),
            Directive::EndForeach => Some(Terminator::EndForeach),
            _ => None,
        }
    }
}

fn classify(body: &str) -> Directive<'_> {
    let body = body.trim();
    let split = body
        .find(|c: char| !(c.is_ascii_alphabetic() || c == '_'))
        .unwrap_or(body.len());
    let (keyword, rest) = body.split_at(split);
    let rest = rest.trim();

    match keyword {
        "content" if !rest.is_empty() => Directive::Content(rest),
        "render" if !rest.is_empty() => Directive::Render(rest),
        "block" if !rest.is_empty() => Directive::BlockOpen(rest),
        "end" if rest == "block" => Directive::BlockClose,
        "endblock" if rest.is_empty() => Directive::BlockClose,
        "foreach" => Directive::Foreach(strip_parens(rest)),
        "endforeach" if rest.is_empty() => Directive::EndForeach,
        "if" => Directive::If(strip_parens(rest)),
        "elseif" => Directive::ElseIf(strip_parens(rest)),
        "else" if rest.is_empty() => Directive::Else,
        "else" if rest.starts_with("if") => Directive::ElseIf(strip_parens(rest[2..].trim())),
        "endif" if rest.is_empty() => Directive::EndIf,
        _ => Directive::Unknown,
    }
}

/// `(expr)` -> `expr`, leaving `($a) && ($b)` alone
fn strip_parens(s: &str) -> &str {
    if !(s.starts_with('(') && s.ends_with(')')) {
        return s;
    }
    let mut depth = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && i != s.len() - 1 {
                    return s;
                }
            }
            _ => {}
        }
    }
    s[1..s.len() - 1].trim()
}

/// `"widget" $x => 5` -> (`"widget"`, `$x => 5`)
fn split_view_path(rest: &str) -> (&str, &str) {
    let rest = rest.trim();
    if let Some(quote) = rest.chars().next().filter(|c| *c == '"' || *c == '\'') {
        if let Some(close) = rest[1..].find(quote) {
            return rest.split_at(close + 2);
        }
    }
    match rest.find(char::is_whitespace) {
        Some(p) => rest.split_at(p),
        None => (rest, ""),
    }
}

// --- Parser ---

struct Cursor<'t, 's> {
    tokens: &'t [Token<'s>],
    pos: usize,
    /// Absolute line that maps to line 1 of the unit being parsed
    base_line: u32,
}

impl Cursor<'_, '_> {
    fn relative(&self, line: u32) -> u32 {
        line.saturating_sub(self.base_line) + 1
    }
}

struct BlockSink<'a> {
    view: &'a str,
    source: &'a Arc<TemplateSource>,
    debug: bool,
    blocks: BlockMap,
}

impl BlockSink<'_> {
    fn capture(&mut self, name: &str, tokens: &[Token<'_>], body_line: u32) {
        let mut cursor = Cursor { tokens, pos: 0, base_line: body_line };
        let (body, _) = parse_nodes(&mut cursor, self, &[]);
        let block = Block {
            name: name.to_string(),
            view: self.view.to_string(),
            body,
            offset: self.debug.then_some(body_line),
            source: Arc::clone(self.source),
        };
        if self.blocks.insert(name.to_string(), Arc::new(block)).is_some() {
            tracing::debug!(view = self.view, block = name, "duplicate block, last definition wins");
        }
    }
}

type Stopped<'s> = Option<(Directive<'s>, u32)>;

fn parse_nodes<'s>(
    cursor: &mut Cursor<'_, 's>,
    sink: &mut BlockSink<'_>,
    stops: &[Terminator],
) -> (Vec<Node>, Stopped<'s>) {
    let mut nodes = Vec::new();

    while let Some(token) = cursor.tokens.get(cursor.pos).copied() {
        cursor.pos += 1;
        let (body, raw, line, end_line) = match token {
            Token::Text(text) => {
                push_text(&mut nodes, text);
                continue;
            }
            Token::Output { expr, line } => {
                nodes.push(compile_output(expr, cursor.relative(line)));
                continue;
            }
            Token::Tag { body, raw, line, end_line } => (body, raw, line, end_line),
        };
        let line = cursor.relative(line);

        match classify(body) {
            Directive::Content(name) => nodes.push(Node::Content {
                name: unquote(name).trim().to_string(),
                line,
            }),
            Directive::Render(rest) => nodes.push(compile_render(rest, line)),
            Directive::BlockOpen(name) => match find_block_end(cursor.tokens, cursor.pos) {
                Some(end) => {
                    sink.capture(unquote(name).trim(), &cursor.tokens[cursor.pos..end], end_line);
                    cursor.pos = end + 1;
                }
                None => push_text(&mut nodes, raw),
            },
            Directive::Foreach(header) => nodes.push(parse_foreach(cursor, sink, header, line)),
            Directive::If(condition) => nodes.push(parse_if(cursor, sink, condition, line)),
            directive @ (Directive::ElseIf(_) | Directive::Else | Directive::EndIf | Directive::EndForeach) => {
                if directive.terminator().map_or(false, |t| stops.contains(&t)) {
                    return (nodes, Some((directive, line)));
                }
                nodes.push(Node::Fault {
                    message: format!("syntax error, unexpected '{}'", body.trim()),
                    line,
                });
            }
            Directive::BlockClose | Directive::Unknown => push_text(&mut nodes, raw),
        }
    }

    (nodes, None)
}

fn find_block_end(tokens: &[Token<'_>], from: usize) -> Option<usize> {
    let mut depth = 1usize;
    for (i, token) in tokens.iter().enumerate().skip(from) {
        if let Token::Tag { body, .. } = token {
            match classify(body) {
                Directive::BlockOpen(_) => depth += 1,
                Directive::BlockClose => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(Node::Text { text: last }) = nodes.last_mut() {
        last.push_str(text);
    } else {
        nodes.push(Node::Text { text: text.to_string() });
    }
}

fn compile_output(src: &str, line: u32) -> Node {
    match expr::parse(src.trim()) {
        Ok(expr) => Node::Output { expr, line },
        Err(e) => Node::Fault { message: e.to_string(), line },
    }
}

fn compile_render(rest: &str, line: u32) -> Node {
    let (path, args) = split_view_path(rest);
    let bindings = if args.trim().is_empty() {
        Vec::new()
    } else {
        match parse_arguments(args) {
            Ok(bindings) => bindings,
            Err(e) => return Node::Fault { message: e.to_string(), line },
        }
    };
    Node::Render {
        view: unquote(path).trim().to_string(),
        bindings,
        line,
    }
}

fn parse_foreach<'s>(cursor: &mut Cursor<'_, 's>, sink: &mut BlockSink<'_>, header: &str, line: u32) -> Node {
    let (body, end) = parse_nodes(cursor, sink, &[Terminator::EndForeach]);
    if end.is_none() {
        return Node::Fault {
            message: "syntax error, unexpected end of file, expecting \"endforeach\"".to_string(),
            line,
        };
    }
    match expr::parse_loop_header(header) {
        Ok(header) => Node::Foreach {
            source: header.source,
            key: header.key,
            value: header.value,
            body,
            line,
        },
        Err(e) => Node::Fault { message: e.to_string(), line },
    }
}

fn parse_if<'s>(cursor: &mut Cursor<'_, 's>, sink: &mut BlockSink<'_>, first: &'s str, line: u32) -> Node {
    let mut branches = Vec::new();
    let mut pending: Option<(&'s str, u32)> = Some((first, line));
    let mut fault = None;

    loop {
        let stops: &[Terminator] = if pending.is_some() {
            &[Terminator::ElseIf, Terminator::Else, Terminator::EndIf]
        } else {
            &[Terminator::EndIf]
        };
        let (body, end) = parse_nodes(cursor, sink, stops);

        let condition = match pending {
            Some((src, at)) => match expr::parse(src) {
                Ok(condition) => Some(condition),
                Err(e) => {
                    fault.get_or_insert(Node::Fault { message: e.to_string(), line: at });
                    None
                }
            },
            None => None,
        };
        branches.push(Branch { condition, body });

        match end {
            Some((Directive::ElseIf(src), at)) => pending = Some((src, at)),
            Some((Directive::Else, _)) => pending = None,
            Some((Directive::EndIf, _)) => break,
            _ => {
                return Node::Fault {
                    message: "syntax error, unexpected end of file, expecting \"endif\"".to_string(),
                    line,
                };
            }
        }
    }

    fault.unwrap_or(Node::If { branches, line })
}
