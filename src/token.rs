//! # Calculation Script Token Scanner
//!
//! A small word-boundary-aware scanner over calculation script source. This
//! deliberately stops short of full parsing: the validation passes only need
//! deterministic identifier extraction with positions, so the scanner returns
//! a flat list of (token, position) pairs and leaves structure to the
//! compiler backend.
//!
//! String literals (`"..."`) and line comments (`'` to end of line) are
//! skipped, so a calculation name inside a quoted message never counts as a
//! reference.

/// Aggregate functions recognised in calculation scripts.
pub const AGGREGATE_FUNCTIONS: &[&str] = &["Sum", "Avg", "Min", "Max"];

/// One identifier token with its 0-based source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Identifier text, including any dotted path (`Datasets.Census.Pupils`).
    pub text: String,
    pub line: usize,
    pub column: usize,
    /// Byte offset of the first character.
    pub start: usize,
}

impl Token {
    fn end(&self) -> usize {
        self.start + self.text.len()
    }

    /// Final segment of a dotted token (`Pupils` for `Datasets.Census.Pupils`).
    pub fn last_segment(&self) -> &str {
        self.text.rsplit('.').next().unwrap_or(&self.text)
    }
}

/// An aggregate-function call found in a script body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateCall {
    /// Canonical function name (`Sum`, `Avg`, `Min`, `Max`).
    pub function: String,
    /// Raw argument token, dotted path preserved.
    pub argument: String,
    /// 0-based line of the call.
    pub line: usize,
}

impl AggregateCall {
    /// Final segment of the argument, used for allow-list matching.
    pub fn argument_name(&self) -> &str {
        self.argument.rsplit('.').next().unwrap_or(&self.argument)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Scan a source body into identifier tokens, skipping strings and comments.
pub fn tokens(source: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut chars = source.char_indices().peekable();
    let mut line = 0usize;
    let mut line_start = 0usize;

    while let Some((offset, c)) = chars.next() {
        match c {
            '\n' => {
                line += 1;
                line_start = offset + 1;
            }
            // Line comment: consume to end of line without emitting tokens.
            '\'' => {
                while let Some(&(_, nc)) = chars.peek() {
                    if nc == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            // String literal: consume to the closing quote.
            '"' => {
                while let Some((_, nc)) = chars.next() {
                    if nc == '"' {
                        break;
                    }
                    if nc == '\n' {
                        line += 1;
                    }
                }
            }
            c if is_ident_start(c) => {
                let start = offset;
                let mut text = String::new();
                text.push(c);
                while let Some(&(_, nc)) = chars.peek() {
                    if is_ident_continue(nc) {
                        text.push(nc);
                        chars.next();
                    } else {
                        break;
                    }
                }
                // A trailing dot belongs to the surrounding syntax, not the path.
                while text.ends_with('.') {
                    text.pop();
                }
                out.push(Token {
                    column: start - line_start,
                    text,
                    line,
                    start,
                });
            }
            _ => {}
        }
    }

    out
}

/// Whether `name` occurs in `source` as a standalone identifier token,
/// case-insensitively. `HoraceX` does not match `Horace`.
pub fn contains_identifier(source: &str, name: &str) -> bool {
    tokens(source)
        .iter()
        .any(|t| t.text.eq_ignore_ascii_case(name) || t.last_segment().eq_ignore_ascii_case(name))
}

/// Extract every aggregate-function call with its argument token.
///
/// A call is a recognised function name immediately followed (modulo
/// whitespace) by `(` and a single identifier argument.
pub fn aggregate_calls(source: &str) -> Vec<AggregateCall> {
    let toks = tokens(source);
    let bytes = source.as_bytes();
    let mut calls = Vec::new();

    for window in toks.windows(2) {
        let (func, arg) = (&window[0], &window[1]);
        let canonical = match AGGREGATE_FUNCTIONS
            .iter()
            .find(|f| f.eq_ignore_ascii_case(&func.text))
        {
            Some(f) => *f,
            None => continue,
        };

        // The gap between function name and argument must be exactly "(".
        let gap: String = bytes[func.end()..arg.start]
            .iter()
            .map(|&b| b as char)
            .filter(|c| !c.is_whitespace())
            .collect();
        if gap != "(" {
            continue;
        }

        calls.push(AggregateCall {
            function: canonical.to_string(),
            argument: arg.text.clone(),
            line: func.line,
        });
    }

    calls
}
