//! Tokenizer for the expression language.
use crate::errors::ExpressionSyntaxError;

/// A lexed token with its 1-based source line.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

/// Token kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    // keywords
    If,
    Then,
    Else,
    And,
    Or,
    Not,
    Return,
    // punctuation
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
    Comma,
    Assign,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Newline,
}

/// An error found while tokenizing.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
}

impl LexError {
    pub fn into_syntax_error(self, source: &str) -> ExpressionSyntaxError {
        ExpressionSyntaxError {
            expression: source.to_string(),
            message: self.message,
            line: self.line,
        }
    }
}

/// Tokenize `source`, tracking line numbers and stripping `#` comments.
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut line = 1usize;
    let mut chars = source.chars().peekable();

    macro_rules! push {
        ($kind:expr) => {
            tokens.push(Token { kind: $kind, line })
        };
    }

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                chars.next();
                push!(TokenKind::Newline);
                line += 1;
            }
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '#' => {
                // comment to end of line
                while chars.peek().is_some_and(|&c| c != '\n') {
                    chars.next();
                }
            }
            '0'..='9' | '.' => {
                let mut text = String::new();
                while chars
                    .peek()
                    .is_some_and(|&c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E')
                {
                    let c = chars.next().unwrap();
                    text.push(c);
                    // allow a sign immediately after an exponent marker
                    if (c == 'e' || c == 'E') && chars.peek().is_some_and(|&n| n == '+' || n == '-')
                    {
                        text.push(chars.next().unwrap());
                    }
                }
                let number = text
                    .parse()
                    .map_err(|_| LexError {
                        message: format!("'{text}' is not a valid number"),
                        line,
                    })?;
                push!(TokenKind::Number(number));
            }
            '"' | '\'' => {
                let quote = chars.next().unwrap();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some('\n') | None => {
                            return Err(LexError {
                                message: "unterminated string literal".to_string(),
                                line,
                            });
                        }
                        Some(c) => text.push(c),
                    }
                }
                push!(TokenKind::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while chars
                    .peek()
                    .is_some_and(|&c| c.is_ascii_alphanumeric() || c == '_')
                {
                    name.push(chars.next().unwrap());
                }
                let kind = match name.as_str() {
                    "if" => TokenKind::If,
                    "then" => TokenKind::Then,
                    "else" => TokenKind::Else,
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "return" => TokenKind::Return,
                    _ => TokenKind::Ident(name),
                };
                push!(kind);
            }
            '+' => {
                chars.next();
                push!(TokenKind::Plus);
            }
            '-' => {
                chars.next();
                push!(TokenKind::Minus);
            }
            '*' => {
                chars.next();
                push!(TokenKind::Star);
            }
            '/' => {
                chars.next();
                push!(TokenKind::Slash);
            }
            '%' => {
                chars.next();
                push!(TokenKind::Percent);
            }
            '^' => {
                chars.next();
                push!(TokenKind::Caret);
            }
            '(' => {
                chars.next();
                push!(TokenKind::LParen);
            }
            ')' => {
                chars.next();
                push!(TokenKind::RParen);
            }
            ',' => {
                chars.next();
                push!(TokenKind::Comma);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Eq);
                } else {
                    push!(TokenKind::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Neq);
                } else {
                    return Err(LexError {
                        message: "unexpected '!'".to_string(),
                        line,
                    });
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Lte);
                } else {
                    push!(TokenKind::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    push!(TokenKind::Gte);
                } else {
                    push!(TokenKind::Gt);
                }
            }
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{other}'"),
                    line,
                });
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_numbers_and_ops() {
        assert_eq!(
            kinds("1 + 2.5e-3"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Plus,
                TokenKind::Number(2.5e-3)
            ]
        );
    }

    #[test]
    fn test_keywords_vs_idents() {
        assert_eq!(
            kinds("if x then y else z"),
            vec![
                TokenKind::If,
                TokenKind::Ident("x".to_string()),
                TokenKind::Then,
                TokenKind::Ident("y".to_string()),
                TokenKind::Else,
                TokenKind::Ident("z".to_string()),
            ]
        );
    }

    #[test]
    fn test_strings_both_quotes() {
        assert_eq!(
            kinds("\"node/1/2\" 'x'"),
            vec![
                TokenKind::Str("node/1/2".to_string()),
                TokenKind::Str("x".to_string())
            ]
        );
    }

    #[test]
    fn test_comments_are_stripped() {
        assert_eq!(
            kinds("1 # one\n2"),
            vec![
                TokenKind::Number(1.0),
                TokenKind::Newline,
                TokenKind::Number(2.0)
            ]
        );
    }

    #[test]
    fn test_line_tracking() {
        let tokens = tokenize("1\n\n2").unwrap();
        assert_eq!(tokens.last().unwrap().line, 3);
    }

    #[test]
    fn test_comparison_operators() {
        assert_eq!(
            kinds("== != <= >= < > ="),
            vec![
                TokenKind::Eq,
                TokenKind::Neq,
                TokenKind::Lte,
                TokenKind::Gte,
                TokenKind::Lt,
                TokenKind::Gt,
                TokenKind::Assign,
            ]
        );
    }

    #[test]
    fn test_unterminated_string_errors() {
        assert!(tokenize("'oops").is_err());
    }
}
