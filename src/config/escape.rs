//! Value escaping for the DRBD configuration grammar

use std::borrow::Cow;

/// Quote a scalar value when it would not survive as a bare word.
///
/// Values containing whitespace or a double quote, and the empty string,
/// are wrapped in double quotes with embedded quotes backslash-escaped.
/// Anything else is returned unchanged.
pub fn escape_config(value: &str) -> Cow<'_, str> {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == ';' || c == '{' || c == '}' || c == '#');
    if !needs_quotes {
        return Cow::Borrowed(value);
    }

    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    Cow::Owned(quoted)
}
