//! Escaping for tab-separated, line-oriented record files.
//!
//! Paths may legally contain tabs, line breaks and backslashes. These are
//! written as `\t`, `\n`, `\r` and `\\` so each record stays on one line
//! and survives line splitting, which drops a trailing carriage return.

/// Escape a field for a tab-separated line
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for c in field.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse `escape_field`. Returns `None` on a dangling or unknown escape.
pub fn unescape_field(field: &str) -> Option<String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next()? {
            '\\' => out.push('\\'),
            't' => out.push('\t'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            _ => return None,
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_field_untouched() {
        assert_eq!(escape_field("/etc/passwd"), "/etc/passwd");
        assert_eq!(unescape_field("/etc/passwd").as_deref(), Some("/etc/passwd"));
    }

    #[test]
    fn test_special_characters() {
        let raw = "/tmp/odd\tname\nwith\\slash";
        let escaped = escape_field(raw);
        assert!(!escaped.contains('\t'));
        assert!(!escaped.contains('\n'));
        assert_eq!(unescape_field(&escaped).as_deref(), Some(raw));
    }

    #[test]
    fn test_carriage_return_escaped() {
        assert_eq!(escape_field("/tmp/name\r"), "/tmp/name\\r");
        assert_eq!(unescape_field("/tmp/name\\r").as_deref(), Some("/tmp/name\r"));
    }

    #[test]
    fn test_bad_escape_rejected() {
        assert_eq!(unescape_field("abc\\"), None);
        assert_eq!(unescape_field("abc\\x"), None);
    }
}
