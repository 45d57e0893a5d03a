#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Keyword,
    StringLiteral,
    Identifier,
    Integer,
    Comma,
    KeyCombo,
    Newline,
    Eof,
    Indent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub token_type: TokenType,
    pub value: String,
    pub line: usize,
}

impl Token {
    pub fn new(token_type: TokenType, value: impl Into<String>, line: usize) -> Self {
        Self {
            token_type,
            value: value.into(),
            line,
        }
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.token_type == TokenType::Keyword && self.value == word
    }
}

pub const KEYWORDS: &[&str] = &[
    "task",
    "input",
    "step",
    "expect",
    "click",
    "double-click",
    "right-click",
    "type",
    "into",
    "append",
    "select",
    "in",
    "key",
    "extract",
    "from",
    "output",
    "screenshot",
    "abort",
    "if",
    "screen",
    "shows",
    "else",
    "end",
    "on",
    "timeout",
    "error",
];

/// Canonical named keys. Matched case-sensitively so that the block
/// terminator `end` never collides with the `End` key.
pub const NAMED_KEYS: &[&str] = &[
    "Tab", "Enter", "Escape", "Space", "F1", "F2", "F3", "F4", "F5", "F6", "F7", "F8", "F9",
    "F10", "F11", "F12", "Ctrl", "Alt", "Shift", "Up", "Down", "Left", "Right", "Home", "End",
    "PageUp", "PageDown", "Backspace", "Delete",
];

pub fn is_keyword(word: &str) -> bool {
    let lower = word.to_ascii_lowercase();
    KEYWORDS.contains(&lower.as_str())
}

pub fn is_named_key(word: &str) -> bool {
    NAMED_KEYS.contains(&word)
}

/// Single uppercase letters and digits act as key components, but only
/// when directly followed by `+` (e.g. the `S` in `Ctrl+S`).
pub fn is_single_key_component(word: &str) -> bool {
    let mut chars = word.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => c.is_ascii_uppercase() || c.is_ascii_digit(),
        _ => false,
    }
}
