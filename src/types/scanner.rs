//! Delimited scanner shared by the composite codecs.
//!
//! Splits the textual form of arrays, tuples and maps (`[1, 2]`, `('a', 3)`,
//! `{'k': [1]}`) into top-level elements. Separators inside quoted strings or
//! nested brackets never end an element.

/// Strips a matching pair of outer delimiters, returning the trimmed inner text.
pub(crate) fn strip_delimiters(text: &str, open: char, close: char) -> Option<&str> {
    let text = text.trim();
    if text.len() >= 2 && text.starts_with(open) && text.ends_with(close) {
        Some(text[open.len_utf8()..text.len() - close.len_utf8()].trim())
    } else {
        None
    }
}

/// Splits `inner` on `separator` at nesting depth zero, outside quotes.
///
/// Returns `None` when brackets are unbalanced or a quote is left open.
/// Empty input yields no elements.
pub(crate) fn split_top_level(inner: &str, separator: char) -> Option<Vec<&str>> {
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }

    let mut parts = Vec::new();
    let mut depth: usize = 0;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in inner.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '[' | '(' | '{' => depth += 1,
            ']' | ')' | '}' => depth = depth.checked_sub(1)?,
            c if c == separator && depth == 0 => {
                parts.push(inner[start..i].trim());
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }

    if depth != 0 || quote.is_some() {
        return None;
    }
    parts.push(inner[start..].trim());
    Some(parts)
}

/// Decodes a single-quoted literal (`'it\'s'`), resolving backslash escapes.
///
/// Returns `None` if `token` is not a complete quoted literal.
pub(crate) fn unquote(token: &str) -> Option<String> {
    let token = token.trim();
    let quote = token.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    if token.len() < 2 || !token.ends_with(quote) {
        return None;
    }
    let body = &token[1..token.len() - 1];

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            '0' => out.push('\0'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'a' => out.push('\u{7}'),
            'v' => out.push('\u{b}'),
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16).ok()?;
                out.push(char::from(byte));
            }
            other => out.push(other),
        }
    }
    Some(out)
}

/// Renders `value` as a single-quoted SQL string literal.
pub(crate) fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Returns `true` for the textual NULL sentinels.
pub(crate) fn is_null_token(token: &str) -> bool {
    matches!(token.trim(), "NULL" | "null" | "\\N")
}
