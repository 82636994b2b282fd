/// Longest prefix of `value` that fits in `max_bytes` without splitting a
/// character.
pub fn truncate_utf8_prefix(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

pub fn truncate_utf8_suffix(value: &str, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value.to_string();
    }
    let mut start = value.len() - max_bytes;
    while start < value.len() && !value.is_char_boundary(start) {
        start += 1;
    }
    value[start..].to_string()
}

/// Last `max_bytes` of a byte buffer, lossily decoded.
pub fn tail_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let start = bytes.len().saturating_sub(max_bytes);
    let text = String::from_utf8_lossy(&bytes[start..]);
    text.trim_start_matches('\u{FFFD}').to_string()
}

#[cfg(test)]
mod tests {
    use super::{tail_lossy, truncate_utf8_prefix, truncate_utf8_suffix};

    #[test]
    fn prefix_respects_char_boundaries() {
        assert_eq!(truncate_utf8_prefix("banner text", 6), "banner");
        assert_eq!(truncate_utf8_prefix("h\u{e9}llo", 2), "h");
        assert_eq!(truncate_utf8_prefix("short", 64), "short");
    }

    #[test]
    fn suffix_respects_char_boundaries() {
        assert_eq!(truncate_utf8_suffix("Exception in thread", 6), "thread");
        assert_eq!(truncate_utf8_suffix("ab\u{e9}", 1), "");
    }

    #[test]
    fn tail_drops_split_leading_char() {
        let bytes = "x\u{e9}end".as_bytes();
        assert_eq!(tail_lossy(bytes, 4), "end");
        assert_eq!(tail_lossy(b"abc", 10), "abc");
    }
}
