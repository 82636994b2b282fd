//! Quoting for the POSIX shell commands sent to remote hosts.

/// Wraps `value` in single quotes; the shell performs no expansion inside.
pub fn single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Wraps `value` in double quotes, escaping the characters the shell still
/// interprets there.
pub fn double_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

/// Joins a parent directory and a file name with exactly one separator.
pub fn remote_join(dir: &str, name: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() && dir.starts_with('/') {
        return format!("/{}", name);
    }
    format!("{}/{}", trimmed, name)
}
