use crate::errors::{EngineError, EngineResult};
use crate::mbl::token::{
    is_keyword, is_named_key, is_single_key_component, Token, TokenType,
};

/// Converts MBL source text into a token stream.
///
/// The lexer is line-oriented: blank and comment-only lines produce no
/// tokens at all, every other line contributes its tokens followed by a
/// single `Newline`. Leading indentation (space = 1, tab = 4) becomes an
/// `Indent` token carrying the decimal width.
pub fn tokenize(source: &str) -> EngineResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut last_line = 0;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = idx + 1;
        last_line = line_no;
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);

        if line.trim().is_empty() {
            continue;
        }

        let chars: Vec<char> = line.chars().collect();
        let mut pos = 0;
        let mut indent = 0usize;
        while pos < chars.len() {
            match chars[pos] {
                ' ' => indent += 1,
                '\t' => indent += 4,
                _ => break,
            }
            pos += 1;
        }

        if chars[pos] == '#' {
            continue;
        }
        if indent > 0 {
            tokens.push(Token::new(TokenType::Indent, indent.to_string(), line_no));
        }

        tokenize_line(&chars, pos, line_no, &mut tokens)?;
        tokens.push(Token::new(TokenType::Newline, "\n", line_no));
    }

    tokens.push(Token::new(TokenType::Eof, "", last_line + 1));
    Ok(tokens)
}

fn tokenize_line(
    chars: &[char],
    start: usize,
    line: usize,
    tokens: &mut Vec<Token>,
) -> EngineResult<()> {
    let mut pos = start;

    while pos < chars.len() {
        let c = chars[pos];

        if c.is_whitespace() {
            pos += 1;
            continue;
        }

        // Inline comment terminates the line.
        if c == '#' {
            break;
        }

        if c == '"' {
            pos += 1;
            let content_start = pos;
            while pos < chars.len() && chars[pos] != '"' {
                pos += 1;
            }
            if pos >= chars.len() {
                return Err(lex_error(line, "unterminated string literal"));
            }
            let content: String = chars[content_start..pos].iter().collect();
            tokens.push(Token::new(TokenType::StringLiteral, content, line));
            pos += 1;
            continue;
        }

        if c == ',' {
            tokens.push(Token::new(TokenType::Comma, ",", line));
            pos += 1;
            continue;
        }

        if c.is_ascii_digit() {
            let run_start = pos;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
            let run: String = chars[run_start..pos].iter().collect();

            // A lone digit directly followed by `+` starts a key combo (`1+2`).
            if run.len() == 1 && pos < chars.len() && chars[pos] == '+' {
                pos = consume_combo_tail(chars, pos, line, run, tokens)?;
                continue;
            }
            if pos < chars.len() && is_ident_start(chars[pos]) {
                return Err(lex_error(
                    line,
                    format!("malformed number '{}{}'", run, chars[pos]),
                ));
            }
            tokens.push(Token::new(TokenType::Integer, run, line));
            continue;
        }

        if is_ident_start(c) {
            // `double-click` / `right-click` span a `-` that identifier
            // scanning would reject, so they are matched as whole words first.
            if let Some(end) = match_compound_keyword(chars, pos) {
                let word: String = chars[pos..end].iter().collect();
                tokens.push(Token::new(
                    TokenType::Keyword,
                    word.to_ascii_lowercase(),
                    line,
                ));
                pos = end;
                continue;
            }

            let word_start = pos;
            while pos < chars.len() && is_ident_continue(chars[pos]) {
                pos += 1;
            }
            let word: String = chars[word_start..pos].iter().collect();
            let followed_by_plus = pos < chars.len() && chars[pos] == '+';

            if is_named_key(&word) || (is_single_key_component(&word) && followed_by_plus) {
                pos = consume_combo_tail(chars, pos, line, word, tokens)?;
                continue;
            }
            if is_keyword(&word) {
                tokens.push(Token::new(
                    TokenType::Keyword,
                    word.to_ascii_lowercase(),
                    line,
                ));
            } else {
                tokens.push(Token::new(TokenType::Identifier, word, line));
            }
            continue;
        }

        return Err(lex_error(line, format!("unexpected character '{c}'")));
    }

    Ok(())
}

/// Greedily consumes `+segment` parts after an initial key component and
/// pushes the finished `KeyCombo` token. Returns the new scan position.
fn consume_combo_tail(
    chars: &[char],
    mut pos: usize,
    line: usize,
    head: String,
    tokens: &mut Vec<Token>,
) -> EngineResult<usize> {
    let mut combo = head;
    while pos < chars.len() && chars[pos] == '+' {
        pos += 1;
        let seg_start = pos;
        while pos < chars.len() && is_ident_continue(chars[pos]) {
            pos += 1;
        }
        if pos == seg_start {
            return Err(lex_error(line, format!("empty segment in key combo '{combo}+'")));
        }
        combo.push('+');
        combo.extend(chars[seg_start..pos].iter());
    }
    tokens.push(Token::new(TokenType::KeyCombo, combo, line));
    Ok(pos)
}

fn match_compound_keyword(chars: &[char], pos: usize) -> Option<usize> {
    for kw in ["double-click", "right-click"] {
        let end = pos + kw.len();
        if end > chars.len() {
            continue;
        }
        let candidate: String = chars[pos..end].iter().collect();
        if !candidate.eq_ignore_ascii_case(kw) {
            continue;
        }
        // Only a whole word: the next character must not continue an identifier.
        if end == chars.len() || !is_ident_continue(chars[end]) {
            return Some(end);
        }
    }
    None
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn lex_error(line: usize, message: impl Into<String>) -> EngineError {
    EngineError::Parse {
        line,
        message: message.into(),
    }
}
