//! Tokenizer for query program text.
//!
//! The scanner is a small state machine that can be fed input in pieces and
//! resumes in whatever mode the previous piece left it in. Unterminated
//! strings or comments are not errors: the scanner just isn't idle yet.
//!
//! ```text
//! [ "/component/completed" !bf @e ] select   // line comment
//! # also a comment
//! /* block */ '''
//!     multi-line text, indent trimmed
//!     relative to the opening marker
//! '''
//! ```

use std::mem;

use serde_json::Value;

use crate::value::StackValue;

/// How a token was written.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    /// A bare value or word.
    Bare,
    /// `"..."` or `'''...'''`. Never literal-parsed.
    Quoted,
    /// One of `{ } [ ] : ,`.
    Structural,
}

/// A scanned token with its source position.
#[derive(Clone, Debug, PartialEq)]
pub struct Token {
    pub value: Value,
    pub kind: TokenKind,
    /// Character offset of the token start.
    pub offset: usize,
    /// 1-based line of the token start.
    pub line: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Idle,
    LineComment,
    BlockComment { star: bool },
    Quoted { escape: bool },
    /// Accumulating a bare value. While the buffer is `/` or `''` the next
    /// character may still turn it into a comment or a triple-quoted block.
    Bare,
    TripleQuoted,
}

/// Restartable incremental scanner.
#[derive(Debug)]
pub struct Tokenizer {
    mode: Mode,
    buf: String,
    offset: usize,
    line: usize,
    column: usize,
    start_offset: usize,
    start_line: usize,
    start_column: usize,
    tokens: Vec<Token>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: Mode::Idle,
            buf: String::new(),
            offset: 0,
            line: 1,
            column: 0,
            start_offset: 0,
            start_line: 1,
            start_column: 0,
            tokens: Vec::new(),
        }
    }

    /// Scan more input, returning every token completed so far.
    ///
    /// A bare value at the very end of `text` stays pending, since the next
    /// piece may continue it.
    pub fn feed(&mut self, text: &str) -> Vec<Token> {
        for c in text.chars() {
            self.step(c);
            self.offset += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 0;
            } else {
                self.column += 1;
            }
        }
        mem::take(&mut self.tokens)
    }

    /// End of input: flush a pending bare value.
    pub fn finish(&mut self) -> Vec<Token> {
        if self.mode == Mode::Bare {
            self.emit(TokenKind::Bare);
            self.mode = Mode::Idle;
        }
        mem::take(&mut self.tokens)
    }

    /// True when no string, comment or value is in progress.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.mode == Mode::Idle
    }

    fn step(&mut self, c: char) {
        match self.mode {
            Mode::Idle => self.idle(c),
            Mode::LineComment => {
                if c == '\n' {
                    self.mode = Mode::Idle;
                }
            }
            Mode::BlockComment { star } => {
                self.mode = if star && c == '/' {
                    Mode::Idle
                } else {
                    Mode::BlockComment { star: c == '*' }
                };
            }
            Mode::Quoted { escape: true } => {
                self.buf.push(match c {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    other => other,
                });
                self.mode = Mode::Quoted { escape: false };
            }
            Mode::Quoted { escape: false } => match c {
                '\\' => self.mode = Mode::Quoted { escape: true },
                '"' => {
                    self.emit(TokenKind::Quoted);
                    self.mode = Mode::Idle;
                }
                _ => self.buf.push(c),
            },
            Mode::Bare => self.bare(c),
            Mode::TripleQuoted => {
                self.buf.push(c);
                if self.buf.ends_with("'''") {
                    let len = self.buf.len() - 3;
                    self.buf.truncate(len);
                    self.buf = trim_block(&self.buf, self.start_column);
                    self.emit(TokenKind::Quoted);
                    self.mode = Mode::Idle;
                }
            }
        }
    }

    fn idle(&mut self, c: char) {
        if c.is_whitespace() {
            return;
        }
        self.start_offset = self.offset;
        self.start_line = self.line;
        self.start_column = self.column;

        if is_structural(c) {
            self.buf.push(c);
            self.emit(TokenKind::Structural);
            return;
        }
        match c {
            '"' => self.mode = Mode::Quoted { escape: false },
            '#' => self.mode = Mode::LineComment,
            _ => {
                self.buf.push(c);
                self.mode = Mode::Bare;
            }
        }
    }

    fn bare(&mut self, c: char) {
        match (self.buf.as_str(), c) {
            ("/", '/') => {
                self.buf.clear();
                self.mode = Mode::LineComment;
            }
            ("/", '*') => {
                self.buf.clear();
                self.mode = Mode::BlockComment { star: false };
            }
            ("''", '\'') => {
                self.buf.clear();
                self.mode = Mode::TripleQuoted;
            }
            _ if c.is_whitespace() => {
                self.emit(TokenKind::Bare);
                self.mode = Mode::Idle;
            }
            _ if is_structural(c) => {
                self.emit(TokenKind::Bare);
                self.mode = Mode::Idle;
                self.idle(c);
            }
            _ => self.buf.push(c),
        }
    }

    fn emit(&mut self, kind: TokenKind) {
        let text = mem::take(&mut self.buf);
        let value = match kind {
            TokenKind::Bare => parse_literal(text),
            TokenKind::Quoted | TokenKind::Structural => Value::String(text),
        };
        self.tokens.push(Token {
            value,
            kind,
            offset: self.start_offset,
            line: self.start_line,
        });
    }
}

const fn is_structural(c: char) -> bool {
    matches!(c, '{' | '}' | '[' | ']' | ':' | ',')
}

fn is_bracket(text: &str) -> bool {
    matches!(text, "[" | "]" | "{" | "}")
}

/// Numbers, booleans and null become typed values; anything else stays text.
fn parse_literal(text: String) -> Value {
    match serde_json::from_str::<Value>(&text) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => v,
        _ => Value::String(text),
    }
}

/// Drop blank first/last lines and strip up to `column` leading blanks from
/// every following line.
fn trim_block(text: &str, column: usize) -> String {
    let mut lines = text.split('\n');
    let mut out = Vec::new();

    if let Some(first) = lines.next() {
        if !first.trim().is_empty() {
            out.push(first.to_string());
        }
    }
    for line in lines {
        let mut stripped = 0;
        out.push(
            line.chars()
                .skip_while(|c| {
                    let skip = stripped < column && matches!(c, ' ' | '\t');
                    stripped += usize::from(skip);
                    skip
                })
                .collect::<String>(),
        );
    }
    if out.last().is_some_and(|l| l.trim().is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// Scan a complete program.
#[must_use]
pub fn tokenize(text: &str) -> Vec<Token> {
    let mut tokenizer = Tokenizer::new();
    let mut tokens = tokenizer.feed(text);
    tokens.extend(tokenizer.finish());
    tokens
}

/// Scan a complete program into stack values, dropping `:` and `,`
/// separators. A quoted bracket becomes [`StackValue::Quoted`] so it stays
/// text.
#[must_use]
pub fn parse_program(text: &str) -> Vec<StackValue> {
    tokenize(text)
        .into_iter()
        .filter(|t| {
            !(t.kind == TokenKind::Structural && matches!(t.value.as_str(), Some(":" | ",")))
        })
        .map(|t| match (t.kind, t.value) {
            (TokenKind::Quoted, Value::String(s)) if is_bracket(&s) => StackValue::Quoted(s),
            (_, value) => StackValue::Value(value),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn values(text: &str) -> Vec<Value> {
        tokenize(text).into_iter().map(|t| t.value).collect()
    }

    #[test]
    fn test_bare_values_and_literals() {
        assert_eq!(
            values("102 @e -3.5 true null word"),
            vec![json!(102), json!("@e"), json!(-3.5), json!(true), json!(null), json!("word")]
        );
    }

    #[test]
    fn test_structural_chars_split_values() {
        assert_eq!(
            values("[102 @e]select"),
            vec![json!("["), json!(102), json!("@e"), json!("]"), json!("select")]
        );
        assert_eq!(
            values("{name:\"bob\",age:3}"),
            vec![
                json!("{"),
                json!("name"),
                json!(":"),
                json!("bob"),
                json!(","),
                json!("age"),
                json!(":"),
                json!(3),
                json!("}")
            ]
        );
    }

    #[test]
    fn test_comments() {
        let text = "1 // rest of line\n2 # hash comment\n3 /* block\n comment */ 4";
        assert_eq!(values(text), vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn test_slash_values_are_not_comments() {
        assert_eq!(
            values("/component/title !bf / 2"),
            vec![json!("/component/title"), json!("!bf"), json!("/"), json!(2)]
        );
        assert_eq!(values("/component/title#/text"), vec![json!("/component/title#/text")]);
    }

    #[test]
    fn test_quoted_strings_are_not_parsed() {
        let tokens = tokenize(r#""42" "a \"b\"\n" "#);
        assert_eq!(tokens[0].value, json!("42"));
        assert_eq!(tokens[0].kind, TokenKind::Quoted);
        assert_eq!(tokens[1].value, json!("a \"b\"\n"));
    }

    #[test]
    fn test_triple_quoted_block_trims_indent() {
        let text = "x\n    '''\n    hello\n      world\n    ''' y";
        assert_eq!(values(text), vec![json!("x"), json!("hello\n  world"), json!("y")]);
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("a\n  bb [");
        assert_eq!((tokens[0].offset, tokens[0].line), (0, 1));
        assert_eq!((tokens[1].offset, tokens[1].line), (4, 2));
        assert_eq!((tokens[2].offset, tokens[2].line), (7, 2));
    }

    #[test]
    fn test_restartable_across_chunks() {
        let mut t = Tokenizer::new();
        let mut out = t.feed("12");
        assert!(out.is_empty());
        assert!(!t.is_idle());

        out.extend(t.feed("3 \"open"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, json!(123));

        out.extend(t.feed(" string\" /* unclosed"));
        assert_eq!(out[1].value, json!("open string"));
        assert!(!t.is_idle());

        out.extend(t.feed(" */ done"));
        out.extend(t.finish());
        assert!(t.is_idle());
        assert_eq!(out[2].value, json!("done"));
    }

    #[test]
    fn test_parse_program_marks_quoted_brackets() {
        let program = parse_program(r#"[ "]" "{" "+" ]"#);
        assert_eq!(
            program,
            vec![
                StackValue::string("["),
                StackValue::Quoted("]".into()),
                StackValue::Quoted("{".into()),
                StackValue::string("+"),
                StackValue::string("]"),
            ]
        );
    }

    #[test]
    fn test_parse_program_drops_separators() {
        let program = parse_program("{ a: 1, b: 2 }");
        let raw: Vec<_> = program.iter().map(StackValue::to_json).collect();
        assert_eq!(raw, vec![json!("{"), json!("a"), json!(1), json!("b"), json!(2), json!("}")]);
    }
}
