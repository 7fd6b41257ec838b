//! Lexer: preprocessed source text to a token sequence
//!
//! Numeric literals accept decimal, hex (`0x`), octal (`0o`) and binary
//! (`0b`) with `_` digit separators, plus floats with optional `f`/`d`
//! suffix. Decimal integers lex as signed, radix-prefixed ones as
//! unsigned. String and character literals use C-style escapes.
//! Multi-character operators are matched greedily. Any unrecognized
//! character or unterminated literal aborts with a line-tagged error.

use crate::error::{PatternLanguageError, Result};
use crate::token::{
    IntegerLiteral, Keyword, Operator, Separator, Token, TokenKind, ValueType,
};

pub struct Lexer;

impl Lexer {
    pub fn new() -> Self {
        Lexer
    }

    pub fn lex(&self, source: &str) -> Result<Vec<Token>> {
        let bytes = source.as_bytes();
        let mut tokens = Vec::new();
        let mut offset = 0usize;
        let mut line = 1u32;

        while offset < bytes.len() {
            let c = bytes[offset];

            if c == b'\n' {
                line += 1;
                offset += 1;
                continue;
            }
            if c.is_ascii_whitespace() {
                offset += 1;
                continue;
            }

            if c.is_ascii_alphabetic() || c == b'_' {
                let start = offset;
                while offset < bytes.len()
                    && (bytes[offset].is_ascii_alphanumeric() || bytes[offset] == b'_')
                {
                    offset += 1;
                }
                let word = &source[start..offset];
                let kind = if let Some(keyword) = Keyword::from_str(word) {
                    TokenKind::Keyword(keyword)
                } else if let Some(ty) = ValueType::from_str(word) {
                    TokenKind::TypeKeyword(ty)
                } else if word == "true" {
                    TokenKind::BoolLiteral(true)
                } else if word == "false" {
                    TokenKind::BoolLiteral(false)
                } else {
                    TokenKind::Identifier(word.to_string())
                };
                tokens.push(Token::new(kind, line));
                continue;
            }

            if c.is_ascii_digit() {
                let (kind, consumed) = lex_number(&source[offset..], line)?;
                tokens.push(Token::new(kind, line));
                offset += consumed;
                continue;
            }

            if c == b'"' {
                let (value, consumed) = lex_string(&source[offset..], line)?;
                tokens.push(Token::new(TokenKind::StringLiteral(value), line));
                offset += consumed;
                continue;
            }

            if c == b'\'' {
                let (value, consumed) = lex_char(&source[offset..], line)?;
                tokens.push(Token::new(TokenKind::CharLiteral(value), line));
                offset += consumed;
                continue;
            }

            if let Some((kind, consumed)) = lex_symbol(&bytes[offset..]) {
                tokens.push(Token::new(kind, line));
                offset += consumed;
                continue;
            }

            return Err(PatternLanguageError::new(
                line,
                format!(
                    "Lexer: unknown token '{}'",
                    (c as char).escape_default()
                ),
            ));
        }

        tokens.push(Token::new(TokenKind::EndOfFile, line));
        Ok(tokens)
    }
}

impl Default for Lexer {
    fn default() -> Self {
        Lexer::new()
    }
}

/// Lex a numeric literal at the start of `text`. Returns the token kind
/// and the number of bytes consumed.
fn lex_number(text: &str, line: u32) -> Result<(TokenKind, usize)> {
    let bytes = text.as_bytes();
    let mut end = 0usize;
    let mut seen_dot = false;

    let radix_prefixed = bytes.len() >= 2
        && bytes[0] == b'0'
        && matches!(bytes[1], b'x' | b'X' | b'o' | b'O' | b'b' | b'B');

    while end < bytes.len() {
        let c = bytes[end];
        if c.is_ascii_alphanumeric() || c == b'_' {
            end += 1;
        } else if c == b'.'
            && !seen_dot
            && !radix_prefixed
            && bytes.get(end + 1).is_some_and(|n| n.is_ascii_digit())
        {
            // A dot only continues the literal when a digit follows, so
            // enum ranges like `1...5` stop after the integer part.
            seen_dot = true;
            end += 1;
        } else {
            break;
        }
    }

    let raw: String = text[..end].chars().filter(|&c| c != '_').collect();
    let invalid =
        || PatternLanguageError::new(line, format!("Lexer: invalid number literal '{}'", &text[..end]));

    if radix_prefixed {
        let radix = match raw.as_bytes()[1] {
            b'x' | b'X' => 16,
            b'o' | b'O' => 8,
            _ => 2,
        };
        let value = u128::from_str_radix(&raw[2..], radix).map_err(|_| invalid())?;
        return Ok((
            TokenKind::Integer(IntegerLiteral::new(value, false)),
            end,
        ));
    }

    let float_suffix = matches!(raw.as_bytes().last(), Some(b'f' | b'F' | b'd' | b'D'));
    if seen_dot || float_suffix {
        let digits = if float_suffix {
            &raw[..raw.len() - 1]
        } else {
            &raw[..]
        };
        let value: f64 = digits.parse().map_err(|_| invalid())?;
        return Ok((TokenKind::Float(value), end));
    }

    let value: u128 = raw.parse().map_err(|_| invalid())?;
    let signed = value <= i128::MAX as u128;
    Ok((TokenKind::Integer(IntegerLiteral::new(value, signed)), end))
}

/// Decode one escape sequence after a backslash. Returns the character
/// and the bytes consumed including the backslash.
fn lex_escape(text: &str, line: u32) -> Result<(char, usize)> {
    let bytes = text.as_bytes();
    let Some(&escaped) = bytes.get(1) else {
        return Err(PatternLanguageError::new(
            line,
            "Lexer: unterminated escape sequence",
        ));
    };
    Ok(match escaped {
        b'n' => ('\n', 2),
        b'r' => ('\r', 2),
        b't' => ('\t', 2),
        b'0' => ('\0', 2),
        b'\\' => ('\\', 2),
        b'\'' => ('\'', 2),
        b'"' => ('"', 2),
        b'x' => {
            let hex = text.get(2..4).ok_or_else(|| {
                PatternLanguageError::new(line, "Lexer: unterminated escape sequence")
            })?;
            let code = u8::from_str_radix(hex, 16).map_err(|_| {
                PatternLanguageError::new(
                    line,
                    format!("Lexer: invalid hex escape '\\x{}'", hex),
                )
            })?;
            (code as char, 4)
        }
        other => {
            return Err(PatternLanguageError::new(
                line,
                format!("Lexer: unknown escape sequence '\\{}'", other as char),
            ));
        }
    })
}

fn lex_string(text: &str, line: u32) -> Result<(String, usize)> {
    let bytes = text.as_bytes();
    let mut result = String::new();
    let mut offset = 1usize;

    while offset < bytes.len() {
        match bytes[offset] {
            b'"' => return Ok((result, offset + 1)),
            b'\n' => break,
            b'\\' => {
                let (c, consumed) = lex_escape(&text[offset..], line)?;
                result.push(c);
                offset += consumed;
            }
            _ => {
                // Copy the whole UTF-8 scalar so multi-byte characters
                // survive intact.
                let c = text[offset..].chars().next().unwrap();
                result.push(c);
                offset += c.len_utf8();
            }
        }
    }

    Err(PatternLanguageError::new(
        line,
        "Lexer: unterminated string literal",
    ))
}

fn lex_char(text: &str, line: u32) -> Result<(char, usize)> {
    let bytes = text.as_bytes();
    let unterminated =
        || PatternLanguageError::new(line, "Lexer: unterminated character literal");

    let (value, after) = match bytes.get(1) {
        None | Some(b'\n') | Some(b'\'') => return Err(unterminated()),
        Some(b'\\') => {
            let (c, consumed) = lex_escape(&text[1..], line)?;
            (c, 1 + consumed)
        }
        Some(_) => {
            let c = text[1..].chars().next().unwrap();
            (c, 1 + c.len_utf8())
        }
    };

    if bytes.get(after) != Some(&b'\'') {
        return Err(unterminated());
    }
    Ok((value, after + 1))
}

/// Greedy operator / separator match. Longest symbols first.
fn lex_symbol(bytes: &[u8]) -> Option<(TokenKind, usize)> {
    use Operator::*;
    use Separator::*;

    let three = bytes.get(..3);
    match three {
        Some(b"<<=") => return Some((TokenKind::Operator(ShiftLeftAssign), 3)),
        Some(b">>=") => return Some((TokenKind::Operator(ShiftRightAssign), 3)),
        Some(b"...") => return Some((TokenKind::Operator(Dots), 3)),
        _ => {}
    }

    let two = bytes.get(..2);
    let two_char = match two {
        Some(b"::") => Some(ScopeResolution),
        Some(b"<<") => Some(ShiftLeft),
        Some(b">>") => Some(ShiftRight),
        Some(b"<=") => Some(LessEqual),
        Some(b">=") => Some(GreaterEqual),
        Some(b"==") => Some(Equal),
        Some(b"!=") => Some(NotEqual),
        Some(b"&&") => Some(BoolAnd),
        Some(b"||") => Some(BoolOr),
        Some(b"^^") => Some(BoolXor),
        Some(b"+=") => Some(PlusAssign),
        Some(b"-=") => Some(MinusAssign),
        Some(b"*=") => Some(StarAssign),
        Some(b"/=") => Some(SlashAssign),
        Some(b"%=") => Some(PercentAssign),
        Some(b"&=") => Some(AndAssign),
        Some(b"|=") => Some(OrAssign),
        Some(b"^=") => Some(XorAssign),
        _ => None,
    };
    if let Some(op) = two_char {
        return Some((TokenKind::Operator(op), 2));
    }

    let kind = match bytes.first()? {
        b'+' => TokenKind::Operator(Plus),
        b'-' => TokenKind::Operator(Minus),
        b'*' => TokenKind::Operator(Star),
        b'/' => TokenKind::Operator(Slash),
        b'%' => TokenKind::Operator(Percent),
        b'&' => TokenKind::Operator(BitAnd),
        b'|' => TokenKind::Operator(BitOr),
        b'^' => TokenKind::Operator(BitXor),
        b'~' => TokenKind::Operator(BitNot),
        b'!' => TokenKind::Operator(BoolNot),
        b'<' => TokenKind::Operator(Less),
        b'>' => TokenKind::Operator(Greater),
        b'=' => TokenKind::Operator(Assign),
        b'@' => TokenKind::Operator(At),
        b'?' => TokenKind::Operator(Question),
        b':' => TokenKind::Operator(Colon),
        b'$' => TokenKind::Operator(Dollar),
        b'(' => TokenKind::Separator(OpenParen),
        b')' => TokenKind::Separator(CloseParen),
        b'{' => TokenKind::Separator(OpenBrace),
        b'}' => TokenKind::Separator(CloseBrace),
        b'[' => TokenKind::Separator(OpenBracket),
        b']' => TokenKind::Separator(CloseBracket),
        b',' => TokenKind::Separator(Comma),
        b'.' => TokenKind::Separator(Dot),
        b';' => TokenKind::Separator(Semicolon),
        _ => return None,
    };
    Some((kind, 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new()
            .lex(source)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_placement_declaration() {
        let tokens = kinds("u32 value @ 0x00;");
        assert_eq!(
            tokens,
            vec![
                TokenKind::TypeKeyword(ValueType::Unsigned32),
                TokenKind::Identifier("value".to_string()),
                TokenKind::Operator(Operator::At),
                TokenKind::Integer(IntegerLiteral::new(0, false)),
                TokenKind::Separator(Separator::Semicolon),
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn test_number_radixes() {
        let tokens = kinds("0xFF 0o17 0b1010 1_000_000 3.5 2f 7d");
        assert_eq!(
            tokens[0],
            TokenKind::Integer(IntegerLiteral::new(0xFF, false))
        );
        assert_eq!(
            tokens[1],
            TokenKind::Integer(IntegerLiteral::new(0o17, false))
        );
        assert_eq!(
            tokens[2],
            TokenKind::Integer(IntegerLiteral::new(0b1010, false))
        );
        assert_eq!(
            tokens[3],
            TokenKind::Integer(IntegerLiteral::new(1_000_000, true))
        );
        assert_eq!(tokens[4], TokenKind::Float(3.5));
        assert_eq!(tokens[5], TokenKind::Float(2.0));
        assert_eq!(tokens[6], TokenKind::Float(7.0));
    }

    #[test]
    fn test_enum_range_dots() {
        let tokens = kinds("1...5");
        assert_eq!(tokens[0], TokenKind::Integer(IntegerLiteral::new(1, true)));
        assert_eq!(tokens[1], TokenKind::Operator(Operator::Dots));
        assert_eq!(tokens[2], TokenKind::Integer(IntegerLiteral::new(5, true)));
    }

    #[test]
    fn test_greedy_operators() {
        let tokens = kinds("a <<= b >> c :: d");
        assert_eq!(tokens[1], TokenKind::Operator(Operator::ShiftLeftAssign));
        assert_eq!(tokens[3], TokenKind::Operator(Operator::ShiftRight));
        assert_eq!(tokens[5], TokenKind::Operator(Operator::ScopeResolution));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = kinds(r#""a\n\x41\"b""#);
        assert_eq!(
            tokens[0],
            TokenKind::StringLiteral("a\nA\"b".to_string())
        );
    }

    #[test]
    fn test_char_literal() {
        assert_eq!(kinds("'Z'")[0], TokenKind::CharLiteral('Z'));
        assert_eq!(kinds(r"'\0'")[0], TokenKind::CharLiteral('\0'));
    }

    #[test]
    fn test_keywords_and_bools() {
        let tokens = kinds("bitfield be true parent");
        assert_eq!(tokens[0], TokenKind::Keyword(Keyword::Bitfield));
        assert_eq!(tokens[1], TokenKind::Keyword(Keyword::BigEndian));
        assert_eq!(tokens[2], TokenKind::BoolLiteral(true));
        assert_eq!(tokens[3], TokenKind::Keyword(Keyword::Parent));
    }

    #[test]
    fn test_line_numbers() {
        let tokens = Lexer::new().lex("u8 a;\nu8 b;").unwrap();
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[3].line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new().lex("\"abc").unwrap_err();
        assert!(err.message.contains("unterminated string"));
        assert_eq!(err.line, 1);
    }

    #[test]
    fn test_unknown_character() {
        let err = Lexer::new().lex("u8 a ` b;").unwrap_err();
        assert!(err.message.contains("unknown token"));
    }
}
