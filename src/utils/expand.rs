use std::path::{Path, PathBuf};

/// Resolves a leading `~` against `$HOME`. Other paths pass through.
pub fn expand_home_path(path: impl AsRef<Path>) -> PathBuf {
    let path = path.as_ref();
    let Some(text) = path.to_str() else {
        return path.to_path_buf();
    };
    let home = || std::env::var("HOME").ok().map(PathBuf::from);
    if text == "~" {
        return home().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = text.strip_prefix("~/") {
        if let Some(home) = home() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Merges environment layers; later layers override earlier ones key by key.
pub fn merge_env(layers: &[&[(String, String)]]) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = Vec::new();
    for layer in layers {
        for (key, value) in layer.iter() {
            match merged.iter_mut().find(|(existing, _)| existing == key) {
                Some(slot) => slot.1 = value.clone(),
                None => merged.push((key.clone(), value.clone())),
            }
        }
    }
    merged
}

pub fn lookup_env<'a>(env: &'a [(String, String)], key: &str) -> Option<&'a str> {
    env.iter()
        .find(|(name, _)| name == key)
        .map(|(_, value)| value.as_str())
}

/// Substitutes `${NAME}` and `$NAME` references from `env`. Unknown names are
/// left untouched so the remote shell can still expand them.
pub fn expand_env_refs(input: &str, env: &[(String, String)]) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '$' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        let braced = chars.get(i + 1) == Some(&'{');
        let start = if braced { i + 2 } else { i + 1 };
        let mut end = start;
        while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_') {
            end += 1;
        }
        let closed = !braced || chars.get(end) == Some(&'}');
        if end == start || !closed {
            out.push('$');
            i += 1;
            continue;
        }
        let name: String = chars[start..end].iter().collect();
        let consumed = if braced { end + 1 } else { end };
        match lookup_env(env, &name) {
            Some(value) => out.push_str(value),
            None => out.extend(chars[i..consumed].iter()),
        }
        i = consumed;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{expand_env_refs, merge_env};

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn node_values_override_global_values() {
        let global = env(&[("JAVA_HOME", "/opt/jdk8"), ("LANG", "C")]);
        let node = env(&[("JAVA_HOME", "/opt/jdk17")]);
        let merged = merge_env(&[&global, &node]);
        assert_eq!(merged, env(&[("JAVA_HOME", "/opt/jdk17"), ("LANG", "C")]));
    }

    #[test]
    fn expands_braced_and_bare_references() {
        let vars = env(&[("JAVA_HOME", "/opt/jdk17")]);
        assert_eq!(
            expand_env_refs("${JAVA_HOME}/bin/java", &vars),
            "/opt/jdk17/bin/java"
        );
        assert_eq!(expand_env_refs("$JAVA_HOME/bin/java", &vars), "/opt/jdk17/bin/java");
    }

    #[test]
    fn unknown_and_malformed_references_pass_through() {
        let vars = env(&[]);
        assert_eq!(expand_env_refs("$MISSING/java", &vars), "$MISSING/java");
        assert_eq!(expand_env_refs("${OPEN/java", &vars), "${OPEN/java");
        assert_eq!(expand_env_refs("cost $5", &vars), "cost $5");
    }
}
