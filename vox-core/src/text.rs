//! Text helpers shared by the phrase matcher and services.
//!
//! Recognisers produce free-form text with arbitrary casing, punctuation and
//! spacing. Everything that compares utterances against configured phrases
//! goes through [`normalize`] first so both sides are folded identically.

/// Fold text into the canonical comparison form.
///
/// - lower-cased
/// - alphanumerics and apostrophes are kept
/// - every other character (punctuation, tabs, newlines) becomes a separator
/// - runs of separators collapse to one space, ends trimmed
///
/// ```
/// assert_eq!(vox_core::text::normalize("  Hey,  Computer!  "), "hey computer");
/// ```
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_alphanumeric() || c == '\'' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Keep only ASCII letters.
pub fn to_letters(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_alphabetic()).collect()
}

/// Keep only ASCII letters and digits.
pub fn to_alphanumeric(text: &str) -> String {
    text.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
}

/// Position of the first occurrence of `sublist` in `list` at or after
/// `start`. An empty `sublist` is never found.
///
/// ```
/// let words: Vec<&str> = "what is a fish".split(' ').collect();
/// assert_eq!(vox_core::text::list_index(&words, &["a", "fish"], 0), Some(2));
/// ```
pub fn list_index<T: PartialEq>(list: &[T], sublist: &[T], start: usize) -> Option<usize> {
    if sublist.is_empty() || start > list.len() {
        return None;
    }
    list[start..]
        .windows(sublist.len())
        .position(|w| w == sublist)
        .map(|i| i + start)
}

const ONES: [&str; 20] = [
    "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
    "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
    "nineteen",
];

const TENS: [&str; 10] = [
    "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
];

const GROUPS: [(&str, u64); 4] = [
    ("trillion", 1_000_000_000_000),
    ("billion", 1_000_000_000),
    ("million", 1_000_000),
    ("thousand", 1_000),
];

fn word_value(word: &str) -> Option<u64> {
    if let Some(i) = ONES.iter().position(|w| *w == word) {
        return Some(i as u64);
    }
    TENS.iter()
        .position(|w| !w.is_empty() && *w == word)
        .map(|i| i as u64 * 10)
}

/// Parse whole-number words such as "one thousand four hundred and eleven".
fn parse_integer_words(words: &[&str]) -> Option<u64> {
    let mut total = 0u64;
    let mut current = 0u64;
    let mut seen_number = false;

    for word in words {
        match *word {
            "and" => continue,
            "hundred" => {
                current = current.max(1).checked_mul(100)?;
                seen_number = true;
            }
            w => {
                if let Some((_, mult)) = GROUPS.iter().find(|(name, _)| *name == w) {
                    total = total.checked_add(current.max(1).checked_mul(*mult)?)?;
                    current = 0;
                    seen_number = true;
                } else {
                    current = current.checked_add(word_value(w)?)?;
                    seen_number = true;
                }
            }
        }
    }

    seen_number.then(|| total + current)
}

/// Turn spoken number words (or plain digits) into a value.
///
/// Handles "seven", "twenty seven", "minus six", "one point eight" and
/// "one thousand four hundred and eleven". Returns `None` when the input
/// contains anything that is not a number word.
pub fn parse_number(words: &str) -> Option<f64> {
    let words = words.trim();
    if words.is_empty() {
        return None;
    }

    if !words.contains(char::is_whitespace) {
        if let Ok(v) = words.parse::<i64>() {
            return Some(v as f64);
        }
        if let Ok(v) = words.parse::<f64>() {
            return Some(v);
        }
    }

    let cleaned: Vec<String> = words
        .split_whitespace()
        .map(|w| to_letters(w).to_ascii_lowercase())
        .filter(|w| !w.is_empty())
        .collect();
    let mut tokens: Vec<&str> = cleaned.iter().map(String::as_str).collect();
    if tokens.is_empty() {
        return None;
    }

    let mut sign = 1.0;
    if matches!(tokens.first(), Some(&"minus") | Some(&"negative")) {
        sign = -1.0;
        tokens.remove(0);
    }

    match tokens.iter().position(|w| *w == "point") {
        Some(idx) => {
            let whole = parse_integer_words(&tokens[..idx])?;
            let decimals = &tokens[idx + 1..];
            if decimals.is_empty() {
                return None;
            }
            let mut digits = String::with_capacity(decimals.len());
            for word in decimals {
                match word_value(word) {
                    Some(d) if d <= 9 => digits.push(char::from(b'0' + d as u8)),
                    _ => {
                        tracing::debug!(input = %words, "not a valid decimal");
                        return None;
                    }
                }
            }
            format!("{whole}.{digits}")
                .parse::<f64>()
                .ok()
                .map(|v| sign * v)
        }
        None => parse_integer_words(&tokens).map(|v| sign * v as f64),
    }
}

fn integer_to_words(value: u64) -> String {
    if value < 20 {
        return ONES[value as usize].to_string();
    }
    if value < 100 {
        let tens = TENS[(value / 10) as usize];
        return match value % 10 {
            0 => tens.to_string(),
            ones => format!("{tens} {}", ONES[ones as usize]),
        };
    }

    let (name, unit) = GROUPS
        .iter()
        .copied()
        .chain(std::iter::once(("hundred", 100)))
        .filter(|(_, unit)| value >= *unit)
        .max_by_key(|(_, unit)| *unit)
        .unwrap_or(("hundred", 100));

    let head = format!("{} {name}", integer_to_words(value / unit));
    match value % unit {
        0 => head,
        rest => format!("{head} {}", integer_to_words(rest)),
    }
}

/// Render a value as spoken words: `42.01` → "forty two point zero one".
pub fn number_to_words(value: f64) -> String {
    let mut out = String::new();
    if value < 0.0 {
        out.push_str("minus ");
    }
    let magnitude = value.abs();
    out.push_str(&integer_to_words(magnitude.trunc() as u64));

    // Display for f64 is the shortest round-tripping form, so the fraction
    // digits are exactly what a person would read out.
    let rendered = magnitude.to_string();
    if let Some((_, fraction)) = rendered.split_once('.') {
        out.push_str(" point");
        for digit in fraction.chars().filter_map(|c| c.to_digit(10)) {
            out.push(' ');
            out.push_str(ONES[digit as usize]);
        }
    }
    out
}
