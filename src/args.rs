//! Subview argument parsing
//!
//! `{% render path $a => 1, $user->name as $title, $items %}` yields the
//! ordered bindings `a`, `title`, `items`. Later bindings of the same name win
//! when merged into the subview dictionary.

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Parser, SyntaxError, Tok};
use crate::templates::unquote;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub name: String,
    pub value: Expr,
}

/// Parse the argument list that follows the view path
pub fn parse_arguments(src: &str) -> Result<Vec<Binding>, SyntaxError> {
    let mut bindings = Vec::new();
    for token in split_arguments(src) {
        let token = unquote_argument(token.trim());
        if token.is_empty() {
            continue;
        }
        match parse_argument(token)? {
            Some(binding) => bindings.push(binding),
            None => tracing::warn!(argument = token, "ignoring subview argument without a binding"),
        }
    }
    Ok(bindings)
}

fn parse_argument(token: &str) -> Result<Option<Binding>, SyntaxError> {
    let mut parser = Parser::new(token)?;

    // $name => expr
    if let (Some(Tok::Var(name)), Some(Tok::Punct("=>"))) = (parser.peek_nth(0), parser.peek_nth(1)) {
        let name = name.clone();
        parser.bump();
        parser.bump();
        let value = parser.expr()?;
        parser.finish()?;
        return Ok(Some(Binding { name, value }));
    }

    let value = parser.expr()?;

    // expr as $name
    if parser.eat_keyword("as") {
        let name = parser.expect_var()?;
        parser.finish()?;
        return Ok(Some(Binding { name, value }));
    }

    parser.finish()?;

    // $name
    match &value {
        Expr::Var { name } => Ok(Some(Binding { name: name.clone(), value })),
        _ => Ok(None),
    }
}

/// A token wrapped whole in quotes loses them; `'a' . 'b'` keeps its quotes
fn unquote_argument(token: &str) -> &str {
    let inner = unquote(token);
    let quote = token.chars().next().unwrap_or('"');
    if inner.len() != token.len() && !inner.contains(quote) {
        inner.trim()
    } else {
        token
    }
}

/// Split on commas that are not nested in quotes, brackets or parentheses
pub fn split_arguments(src: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in src.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&src[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&src[start..]);
    parts
}
