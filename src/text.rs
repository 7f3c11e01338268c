//! Label and number normalization for spreadsheet text.
//!
//! Spreadsheet labels arrive with full-width characters, padding spaces
//! ("売 上 高"), unit annotations ("（千円）") and enumerators ("1.", "(2)").
//! Everything here works on NFKC-folded text so full-width and half-width
//! forms compare equal.

use crate::error::UnitError;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use unicode_normalization::UnicodeNormalization;

/// Bracket pairs left after NFKC folding. NFKC maps `（）［］＜＞` to ASCII
/// but keeps the CJK lenticular and tortoise-shell brackets.
const BRACKETS: &[(char, char)] = &[
    ('(', ')'),
    ('[', ']'),
    ('<', '>'),
    ('【', '】'),
    ('〔', '〕'),
    ('〈', '〉'),
    ('《', '》'),
    ('「', '」'),
];

const NEGATIVE_MARKERS: &[char] = &['-', '−', '△', '▲', '▵'];

const CURRENCY_SYMBOLS: &[char] = &['¥', '\\', '$'];

static LEADING_ENUMERATOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[0-9]+[.)、]|\([0-9]+\)|[a-z][.)]|[ivx]+[.)、]|[・※*●○■□◆◇\-])+")
        .unwrap()
});

static UNIT_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^単位[:]?").unwrap());

/// Fold a label into its comparison key: NFKC, lowercase, no whitespace.
///
/// # Examples
///
/// ```
/// use line_item_normalizer::text::normalize_label;
///
/// assert_eq!(normalize_label("売 上 高"), "売上高");
/// assert_eq!(normalize_label("ＥＢＩＴＤＡ"), "ebitda");
/// assert_eq!(normalize_label("売上高（千円）"), "売上高(千円)");
/// ```
pub fn normalize_label(s: &str) -> String {
    s.nfkc()
        .flat_map(char::to_lowercase)
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Removes bracketed annotations, leading enumerators and trailing
/// separators from an already-normalized label.
pub fn strip_noise(normalized: &str) -> String {
    let mut out = String::with_capacity(normalized.len());
    let mut depth: Vec<char> = Vec::new();

    for c in normalized.chars() {
        if let Some(&(_, close)) = BRACKETS.iter().find(|(open, _)| *open == c) {
            depth.push(close);
            continue;
        }
        if depth.last() == Some(&c) {
            depth.pop();
            continue;
        }
        if depth.is_empty() {
            out.push(c);
        }
    }

    let without_enumerator = LEADING_ENUMERATOR.replace(&out, "");
    without_enumerator
        .trim_end_matches([':', '・', '.', '-', '='])
        .to_string()
}

/// Returns the text inside a trailing bracketed annotation, without any
/// "単位:" prefix. `"売上高(単位:千円)"` yields `Some("千円")`.
pub fn extract_unit_hint(label: &str) -> Option<String> {
    let normalized = normalize_label(label);
    let (open, close) = BRACKETS
        .iter()
        .copied()
        .find(|(_, close)| normalized.ends_with(*close))?;

    let body = &normalized[..normalized.len() - close.len_utf8()];
    let start = body.rfind(open)?;
    let inner = &body[start + open.len_utf8()..];
    let inner = UNIT_PREFIX.replace(inner, "");

    if inner.is_empty() {
        None
    } else {
        Some(inner.into_owned())
    }
}

/// Normalizes a free-form unit token such as `"(単位：千円)"` down to `"千円"`.
pub fn normalize_unit_token(token: &str) -> String {
    let normalized = normalize_label(token);
    let trimmed: String = normalized
        .chars()
        .filter(|c| !BRACKETS.iter().any(|(o, cl)| o == c || cl == c))
        .collect();
    UNIT_PREFIX.replace(&trimmed, "").into_owned()
}

/// A number read from cell text, plus any unit word written after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAmount {
    pub value: Decimal,
    pub embedded_unit: Option<String>,
}

/// Parses spreadsheet number text.
///
/// Accepts thousands separators, full-width digits, currency symbols,
/// negatives written as `-`, `−`, `△`, `▲` or `(123)`, and a trailing unit
/// word (`"1,234千円"`, `"(1,234)千円"`).
pub fn parse_amount(raw: &str) -> std::result::Result<ParsedAmount, UnitError> {
    let unparseable = || UnitError::Unparseable(raw.to_string());

    let folded: String = raw
        .nfkc()
        .filter(|c| !c.is_whitespace() && *c != ',' && !CURRENCY_SYMBOLS.contains(c))
        .collect();

    let mut body = folded.as_str();
    let mut negative = false;
    let mut unit_after_paren = "";

    if let Some((inner, after)) = body.strip_prefix('(').and_then(|b| b.split_once(')')) {
        negative = true;
        body = inner;
        unit_after_paren = after;
    }
    if let Some(first) = body.chars().next() {
        if NEGATIVE_MARKERS.contains(&first) {
            negative = !negative;
            body = &body[first.len_utf8()..];
        } else if first == '+' {
            body = &body[1..];
        }
    }

    let split = body
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    let (digits, rest) = body.split_at(split);
    let rest = match (rest.is_empty(), unit_after_paren.is_empty()) {
        (_, true) => rest,
        (true, false) => unit_after_paren,
        (false, false) => return Err(unparseable()),
    };

    if !digits.chars().any(|c| c.is_ascii_digit()) {
        return Err(unparseable());
    }

    let mut value = Decimal::from_str(digits).map_err(|_| unparseable())?;
    if negative {
        value = -value;
    }

    let embedded_unit = if rest.is_empty() {
        None
    } else if rest.chars().any(|c| c.is_ascii_digit()) {
        return Err(unparseable());
    } else {
        Some(rest.to_string())
    };

    Ok(ParsedAmount {
        value,
        embedded_unit,
    })
}
