//! Tokenizer for contract source.
//!
//! Produces an indentation-aware token stream: `Indent`/`Dedent` mark block
//! structure, `Newline` ends a logical line, and line breaks inside
//! brackets are ignored.

use super::SandboxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Name(String),
    Int(i64),
    Str(String),
    /// Interpolated string literal; kept only so the checker can reject it.
    FString(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

const THREE_CHAR_OPS: &[&str] = &["//="];
const TWO_CHAR_OPS: &[&str] = &[
    "==", "!=", "<=", ">=", "//", "**", "+=", "-=", "*=", "%=",
];
const ONE_CHAR_OPS: &[&str] = &[
    "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
];

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Spanned>,
}

/// Splits `source` into tokens.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, SandboxError> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn error(&self, message: impl Into<String>) -> SandboxError {
        SandboxError::Syntax {
            line: self.line,
            message: message.into(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned {
            token,
            line: self.line,
        });
    }

    fn ends_logical_line(&self) -> bool {
        matches!(
            self.tokens.last().map(|t| &t.token),
            None | Some(Token::Newline) | Some(Token::Indent) | Some(Token::Dedent)
        )
    }

    fn run(&mut self) -> Result<(), SandboxError> {
        let mut at_line_start = true;

        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                if !self.indentation()? {
                    continue;
                }
                at_line_start = false;
            }

            let c = match self.peek(0) {
                Some(c) => c,
                None => break,
            };

            match c {
                '\n' => {
                    if self.depth == 0 {
                        if !self.ends_logical_line() {
                            self.push(Token::Newline);
                        }
                        at_line_start = true;
                    }
                    self.line += 1;
                    self.pos += 1;
                }
                ' ' | '\t' | '\r' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '0'..='9' => self.number()?,
                '\'' | '"' => {
                    let text = self.string(false)?;
                    self.push(Token::Str(text));
                }
                c if c.is_alphabetic() || c == '_' => self.word()?,
                _ => self.operator()?,
            }
        }

        if !self.ends_logical_line() {
            self.push(Token::Newline);
        }
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Token::Dedent);
        }
        self.push(Token::Eof);
        Ok(())
    }

    /// Measures leading whitespace and emits indentation tokens. Returns
    /// `false` when the line was blank or a comment and has been consumed.
    fn indentation(&mut self) -> Result<bool, SandboxError> {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width += 8 - width % 8,
                '\r' => {}
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek(0) {
            None => return Ok(false),
            Some('\n') => {
                self.pos += 1;
                self.line += 1;
                return Ok(false);
            }
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            self.indents.push(width);
            self.push(Token::Indent);
        } else {
            while width < self.indents.last().copied().unwrap_or(0) {
                self.indents.pop();
                self.push(Token::Dedent);
            }
            if width != self.indents.last().copied().unwrap_or(0) {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(true)
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn number(&mut self) -> Result<(), SandboxError> {
        let mut digits = String::new();
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() {
                digits.push(c);
            } else if c != '_' {
                break;
            }
            self.pos += 1;
        }

        if matches!(self.peek(0), Some(c) if c.is_alphanumeric() || c == '.') {
            return Err(self.error("only integer literals are supported"));
        }

        let value = digits
            .parse::<i64>()
            .map_err(|_| self.error(format!("integer literal out of range: {}", digits)))?;
        self.push(Token::Int(value));
        Ok(())
    }

    fn word(&mut self) -> Result<(), SandboxError> {
        let mut word = String::new();
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }

        let is_prefix = word.len() <= 2
            && word
                .chars()
                .all(|c| matches!(c.to_ascii_lowercase(), 'f' | 'r' | 'b' | 'u'));
        if is_prefix && matches!(self.peek(0), Some('\'') | Some('"')) {
            let lower = word.to_ascii_lowercase();
            let text = self.string(lower.contains('r'))?;
            if lower.contains('f') {
                self.push(Token::FString(text));
            } else {
                self.push(Token::Str(text));
            }
            return Ok(());
        }

        self.push(Token::Name(word));
        Ok(())
    }

    fn string(&mut self, raw: bool) -> Result<String, SandboxError> {
        let quote = match self.peek(0) {
            Some(q) => q,
            None => return Err(self.error("expected string")),
        };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut text = String::new();
        loop {
            let c = self
                .peek(0)
                .ok_or_else(|| self.error("unterminated string literal"))?;

            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(text);
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(text);
                }
            }

            if c == '\n' {
                if !triple {
                    return Err(self.error("unterminated string literal"));
                }
                self.line += 1;
            }

            if c == '\\' && !raw {
                let escaped = self
                    .peek(1)
                    .ok_or_else(|| self.error("unterminated string literal"))?;
                self.pos += 2;
                match escaped {
                    'n' => text.push('\n'),
                    't' => text.push('\t'),
                    'r' => text.push('\r'),
                    '0' => text.push('\0'),
                    '\\' => text.push('\\'),
                    '\'' => text.push('\''),
                    '"' => text.push('"'),
                    '\n' => self.line += 1,
                    other => {
                        text.push('\\');
                        text.push(other);
                    }
                }
                continue;
            }

            text.push(c);
            self.pos += 1;
        }
    }

    fn operator(&mut self) -> Result<(), SandboxError> {
        let rest: String = self.chars[self.pos..].iter().take(3).collect();

        let op = THREE_CHAR_OPS
            .iter()
            .chain(TWO_CHAR_OPS)
            .chain(ONE_CHAR_OPS)
            .find(|op| rest.starts_with(**op))
            .copied()
            .ok_or_else(|| self.error(format!("unexpected character {:?}", self.chars[self.pos])))?;

        match op {
            "(" | "[" | "{" => self.depth += 1,
            ")" | "]" | "}" => {
                self.depth = self
                    .depth
                    .checked_sub(1)
                    .ok_or_else(|| self.error(format!("unmatched '{}'", op)))?;
            }
            _ => {}
        }

        self.pos += op.chars().count();
        self.push(Token::Op(op));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_simple_statement() {
        assert_eq!(
            kinds("x = 1 + 2"),
            vec![
                Token::Name("x".into()),
                Token::Op("="),
                Token::Int(1),
                Token::Op("+"),
                Token::Int(2),
                Token::Newline,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_indentation_blocks() {
        let tokens = kinds("if x:\n    y = 1\n\n    # note\nz = 2\n");
        assert!(tokens.contains(&Token::Indent));
        assert!(tokens.contains(&Token::Dedent));
        assert_eq!(tokens.iter().filter(|t| **t == Token::Newline).count(), 3);
    }

    #[test]
    fn test_brackets_join_lines() {
        let tokens = kinds("x = [1,\n     2]\n");
        assert!(!tokens.contains(&Token::Indent));
        assert_eq!(tokens.iter().filter(|t| **t == Token::Newline).count(), 1);
    }

    #[test]
    fn test_strings_and_prefixes() {
        assert_eq!(kinds("'a\\nb'")[0], Token::Str("a\nb".into()));
        assert_eq!(kinds("r'a\\nb'")[0], Token::Str("a\\nb".into()));
        assert_eq!(kinds("f'{x}'")[0], Token::FString("{x}".into()));
        assert_eq!(kinds("\"\"\"two\nlines\"\"\"")[0], Token::Str("two\nlines".into()));
    }

    #[test]
    fn test_errors() {
        assert!(tokenize("x = 'open").is_err());
        assert!(tokenize("x = 1.5").is_err());
        assert!(tokenize("x = 99999999999999999999").is_err());
        assert!(tokenize("x = )").is_err());
        assert!(tokenize("if x:\n    y\n  z\n").is_err());
        assert!(tokenize("x = $").is_err());
    }
}
