//! Parsers for the fixed reply mini-language the vision model is
//! instructed to produce. All keyword comparisons are case-insensitive
//! and tolerate surrounding whitespace.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectOutcome {
    Match,
    NoMatch,
    Uncertain,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CoordinateReply {
    Found { x: u32, y: u32 },
    NotFound { detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExtractReply {
    Value { value: String },
    Empty,
    NotFound,
}

/// `MATCH` / `NO_MATCH` / `UNCERTAIN`; anything else reads as uncertain.
pub fn parse_expect(text: &str) -> ExpectOutcome {
    let first = first_line(text);
    if first.eq_ignore_ascii_case("MATCH") {
        ExpectOutcome::Match
    } else if first.eq_ignore_ascii_case("NO_MATCH") {
        ExpectOutcome::NoMatch
    } else {
        ExpectOutcome::Uncertain
    }
}

/// `x,y` on the first line, or `NOT_FOUND` with an optional reason.
pub fn parse_coordinate(text: &str) -> CoordinateReply {
    if text.trim().is_empty() {
        return CoordinateReply::NotFound {
            detail: "Empty response".to_string(),
        };
    }

    let first = first_line(text);
    if let Some(rest) = strip_prefix_ci(first, "NOT_FOUND") {
        let inline = rest.trim_start_matches(':').trim();
        let detail = if !inline.is_empty() {
            inline.to_string()
        } else {
            let following = text
                .lines()
                .skip(1)
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string();
            if following.is_empty() {
                "Element not found".to_string()
            } else {
                following
            }
        };
        return CoordinateReply::NotFound { detail };
    }

    if let Some((x_part, y_part)) = first.split_once(',') {
        if let (Ok(x), Ok(y)) = (x_part.trim().parse::<u32>(), y_part.trim().parse::<u32>()) {
            return CoordinateReply::Found { x, y };
        }
    }

    CoordinateReply::NotFound {
        detail: format!("Could not parse coordinates from: {first}"),
    }
}

/// A literal value, `EMPTY` for a present-but-blank element, or `NOT_FOUND`.
pub fn parse_extract(text: &str) -> ExtractReply {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ExtractReply::NotFound;
    }
    if trimmed.eq_ignore_ascii_case("EMPTY") {
        return ExtractReply::Empty;
    }
    if strip_prefix_ci(trimmed, "NOT_FOUND").is_some() {
        return ExtractReply::NotFound;
    }
    ExtractReply::Value {
        value: trimmed.to_string(),
    }
}

/// `YES` on the first line means true; everything else means false.
pub fn parse_boolean(text: &str) -> bool {
    first_line(text).eq_ignore_ascii_case("YES")
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("").trim()
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}
