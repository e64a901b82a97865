//! Named-parameter rewriting.
//!
//! Queries are written with `:name` placeholders and a name → value map. Before a
//! statement is sent, [`rewrite`] turns every placeholder into a `?` marker and
//! collects the values in marker order, then [`adapt_placeholders`] converts the
//! markers to the syntax of the target dialect (`$1, $2, ...` for PostgreSQL).
//!
//! Placeholders inside string literals, quoted identifiers, comments and
//! PostgreSQL dollar-quoted bodies are left alone. `::` is kept verbatim so
//! PostgreSQL casts (`:id::bigint`) work.

use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Params, Value};
use std::borrow::Cow;
use std::collections::HashSet;

/// Rewrite `:name` placeholders to `?` markers and collect positional arguments.
///
/// Fails when the text references a name missing from `params`, when `params`
/// holds a name the text never references, when the text already contains a bare
/// `?` marker, or when a placeholder, literal or comment is malformed.
pub fn rewrite(query: &str, params: &Params) -> DbResult<(String, Vec<Value>)> {
    let bytes = query.as_bytes();
    let mut scanner = Scanner::new(query);
    let mut out = String::with_capacity(query.len());
    let mut args = Vec::new();
    let mut used: HashSet<&str> = HashSet::new();
    let mut copied = 0;

    while let Some(pos) = scanner.next_code_byte()? {
        match bytes[pos] {
            b'?' => {
                return Err(DbError::rewrite(format!(
                    "positional placeholder '?' at offset {}; use :name placeholders",
                    pos
                )));
            }
            b':' => match bytes.get(pos + 1).copied() {
                Some(b':') => scanner.skip_to(pos + 2),
                Some(c) if is_ident_start(c) => {
                    let end = ident_end(bytes, pos + 1);
                    let name = &query[pos + 1..end];
                    let value = params.get(name).ok_or_else(|| {
                        DbError::rewrite(format!("missing value for parameter :{}", name))
                    })?;
                    out.push_str(&query[copied..pos]);
                    out.push('?');
                    copied = end;
                    args.push(value.clone());
                    used.insert(name);
                    scanner.skip_to(end);
                }
                Some(c) if c.is_ascii_digit() => {
                    return Err(DbError::rewrite(format!(
                        "malformed placeholder at offset {}: names must start with a letter or '_'",
                        pos
                    )));
                }
                // `:=`, `a : b` and trailing colons are plain text
                _ => {}
            },
            _ => {}
        }
    }
    out.push_str(&query[copied..]);

    let mut unused: Vec<&str> = params
        .keys()
        .map(String::as_str)
        .filter(|k| !used.contains(k))
        .collect();
    if !unused.is_empty() {
        unused.sort_unstable();
        return Err(DbError::rewrite(format!(
            "parameter(s) not referenced by the query: {}",
            unused
                .iter()
                .map(|k| format!(":{}", k))
                .collect::<Vec<_>>()
                .join(", ")
        )));
    }

    Ok((out, args))
}

/// Convert `?` markers to the placeholder syntax of `dialect`.
///
/// MySQL and SQLite take `?` as is; PostgreSQL gets `$1, $2, ...` in order.
pub fn adapt_placeholders(query: &str, dialect: DatabaseType) -> Cow<'_, str> {
    if dialect != DatabaseType::PostgreSQL {
        return Cow::Borrowed(query);
    }

    let bytes = query.as_bytes();
    let mut scanner = Scanner::new(query);
    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut n = 0;

    // Unterminated input cannot come out of `rewrite`; leave the tail untouched.
    while let Ok(Some(pos)) = scanner.next_code_byte() {
        if bytes[pos] == b'?' {
            n += 1;
            let buf = out.get_or_insert_with(|| String::with_capacity(query.len() + 8));
            buf.push_str(&query[copied..pos]);
            buf.push('$');
            buf.push_str(&n.to_string());
            copied = pos + 1;
        }
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&query[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(query),
    }
}

/// Rewrite and adapt in one step, as every executor call does.
pub(crate) fn prepare(
    query: &str,
    params: &Params,
    dialect: DatabaseType,
) -> DbResult<(String, Vec<Value>)> {
    let (positional, args) = rewrite(query, params)?;
    let adapted = match adapt_placeholders(&positional, dialect) {
        Cow::Owned(adapted) => Some(adapted),
        Cow::Borrowed(_) => None,
    };
    Ok((adapted.unwrap_or(positional), args))
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn ident_end(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    while idx < bytes.len() && (bytes[idx].is_ascii_alphanumeric() || bytes[idx] == b'_') {
        idx += 1;
    }
    idx
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuoted,
    DoubleQuoted,
    Backtick,
    LineComment,
    BlockComment(u32),
    /// Holds the full delimiter, e.g. `$body$`.
    DollarQuoted(String),
}

impl State {
    fn describe(&self) -> &'static str {
        match self {
            State::Normal | State::LineComment => "text",
            State::SingleQuoted => "string literal",
            State::DoubleQuoted => "quoted identifier",
            State::Backtick => "backtick identifier",
            State::BlockComment(_) => "block comment",
            State::DollarQuoted(_) => "dollar-quoted string",
        }
    }
}

/// Walks SQL text and yields the offsets of bytes that are live code.
struct Scanner<'a> {
    query: &'a str,
    idx: usize,
    state: State,
}

impl<'a> Scanner<'a> {
    fn new(query: &'a str) -> Self {
        Self {
            query,
            idx: 0,
            state: State::Normal,
        }
    }

    fn skip_to(&mut self, idx: usize) {
        self.idx = idx;
    }

    /// Offset of the next byte outside literals and comments, or `None` at end of input.
    fn next_code_byte(&mut self) -> DbResult<Option<usize>> {
        let query = self.query;
        let bytes = query.as_bytes();

        while self.idx < bytes.len() {
            let idx = self.idx;
            let b = bytes[idx];
            let next = bytes.get(idx + 1).copied();
            self.idx += 1;

            match &self.state {
                State::Normal => match b {
                    b'\'' => self.state = State::SingleQuoted,
                    b'"' => self.state = State::DoubleQuoted,
                    b'`' => self.state = State::Backtick,
                    b'-' if next == Some(b'-') => {
                        self.state = State::LineComment;
                        self.idx += 1;
                    }
                    b'/' if next == Some(b'*') => {
                        self.state = State::BlockComment(1);
                        self.idx += 1;
                    }
                    b'$' => match dollar_tag(bytes, idx) {
                        Some(tag) => {
                            self.idx = idx + tag.len();
                            self.state = State::DollarQuoted(tag);
                        }
                        None => return Ok(Some(idx)),
                    },
                    _ => return Ok(Some(idx)),
                },
                State::SingleQuoted | State::DoubleQuoted | State::Backtick => {
                    let quote = match self.state {
                        State::SingleQuoted => b'\'',
                        State::DoubleQuoted => b'"',
                        _ => b'`',
                    };
                    if b == quote {
                        if next == Some(quote) {
                            self.idx += 1; // doubled quote is an escaped quote
                        } else {
                            self.state = State::Normal;
                        }
                    }
                }
                State::LineComment => {
                    if b == b'\n' {
                        self.state = State::Normal;
                    }
                }
                State::BlockComment(depth) => {
                    let depth = *depth;
                    if b == b'/' && next == Some(b'*') {
                        self.state = State::BlockComment(depth + 1);
                        self.idx += 1;
                    } else if b == b'*' && next == Some(b'/') {
                        self.state = if depth == 1 {
                            State::Normal
                        } else {
                            State::BlockComment(depth - 1)
                        };
                        self.idx += 1;
                    }
                }
                State::DollarQuoted(tag) => {
                    if b == b'$' && query[idx..].starts_with(tag.as_str()) {
                        self.idx = idx + tag.len();
                        self.state = State::Normal;
                    }
                }
            }
        }

        match self.state {
            State::Normal | State::LineComment => Ok(None),
            ref open => Err(DbError::rewrite(format!(
                "unterminated {} in query",
                open.describe()
            ))),
        }
    }
}

/// Recognise a dollar-quote opener (`$$` or `$tag$`) starting at `start`.
fn dollar_tag(bytes: &[u8], start: usize) -> Option<String> {
    let mut idx = start + 1;
    if idx < bytes.len() && bytes[idx].is_ascii_digit() {
        return None; // `$1` is a positional parameter, not a tag
    }
    while idx < bytes.len() && bytes[idx] != b'$' {
        let b = bytes[idx];
        if !(b.is_ascii_alphanumeric() || b == b'_') {
            return None;
        }
        idx += 1;
    }
    if idx < bytes.len() {
        std::str::from_utf8(&bytes[start..=idx])
            .ok()
            .map(String::from)
    } else {
        None
    }
}
