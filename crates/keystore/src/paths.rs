//! Path helpers

use std::path::{Path, PathBuf};

/// `~/.sharecraft`, or `./.sharecraft` without a home directory
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sharecraft")
}

/// Default pipeline data directory (proofs, manifests, journals, history)
pub fn default_data_dir() -> PathBuf {
    default_config_dir().join("data")
}

/// Expand a leading `~` and `$VAR` / `${VAR}` references.
///
/// Unset variables are left as written.
pub fn expand_path(path: impl AsRef<Path>) -> PathBuf {
    let raw = path.as_ref().to_string_lossy();

    let home_expanded = match raw.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => match dirs::home_dir() {
            Some(home) => format!("{}{}", home.display(), rest),
            None => raw.to_string(),
        },
        _ => raw.to_string(),
    };

    PathBuf::from(expand_vars(&home_expanded))
}

fn expand_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}
