//! Logging utilities for device-supplied strings (node names, firmware text) so
//! logs stay single-line. Escapes control characters that otherwise break log readability.

const MAX_PREVIEW: usize = 64;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Node names are short on the wire; anything past `MAX_PREVIEW` chars is cut with an ellipsis.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Hex label used when a node has no name yet, e.g. `!a1b2c3d4`.
pub fn node_label(num: u32) -> String {
    format!("!{:08x}", num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_controls() {
        assert_eq!(escape_log("Base\nCamp\r\t\u{7}"), "Base\\nCamp\\r\\t\\x07");
    }

    #[test]
    fn truncates_long_names() {
        let long = "x".repeat(100);
        let esc = escape_log(&long);
        assert_eq!(esc.chars().count(), MAX_PREVIEW + 1);
        assert!(esc.ends_with('…'));
    }

    #[test]
    fn node_label_is_zero_padded_hex() {
        assert_eq!(node_label(0xbeef), "!0000beef");
    }
}
