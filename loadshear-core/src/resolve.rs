//! Path resolution for packet and WASM handler paths named in a script (§4.8 rules 3/4,
//! `original_source/src/resolver/resolver.cpp`). Expansion of `$ENV` segments and `~/`
//! is opt-in via `--expand-envs`; canonicalization (and thus existence checking) always
//! runs.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ResolveError;

/// Mirrors the original's `ResolverOptions`: whether `$VAR/` segments expand against
/// the process environment before canonicalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    pub expand_envs: bool,
}

fn expand_env_variables(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut finding_env = false;
    let mut current_env = String::new();

    for c in input.chars() {
        if c == '$' {
            finding_env = true;
            current_env.clear();
            continue;
        }
        if c == '/' && finding_env {
            finding_env = false;
            if let Ok(value) = std::env::var(&current_env) {
                out.push_str(&value);
            }
        }
        if finding_env {
            current_env.push(c);
        } else {
            out.push(c);
        }
    }
    out
}

fn expand_tilde(input: &str) -> String {
    if let Some(rest) = input.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}/{}", home, rest);
        }
    }
    input.to_string()
}

/// Resolves `raw_path` to an existing, canonical file path, applying `~/` expansion
/// unconditionally and `$ENV/` expansion only when `options.expand_envs` is set.
pub fn resolve_file(raw_path: &str, options: ResolveOptions) -> Result<PathBuf, ResolveError> {
    let mut expanded = raw_path.to_string();
    if options.expand_envs {
        expanded = expand_env_variables(&expanded);
    }
    expanded = expand_tilde(&expanded);

    fs::canonicalize(&expanded).map_err(|_| ResolveError::NotFound(raw_path.to_string()))
}

/// Resolves `raw_path` relative to `base_dir` (the script's own directory) first,
/// falling back to resolving it as given — packet paths in a script are typically
/// written relative to the script file, not the process's working directory.
pub fn resolve_relative(
    raw_path: &str,
    base_dir: &Path,
    options: ResolveOptions,
) -> Result<PathBuf, ResolveError> {
    let joined = base_dir.join(raw_path);
    if let Some(joined_str) = joined.to_str() {
        if let Ok(path) = resolve_file(joined_str, options) {
            return Ok(path);
        }
    }
    resolve_file(raw_path, options)
}

pub fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

pub fn read_binary_file(path: &Path) -> Result<Vec<u8>, ResolveError> {
    let size = file_size(path);
    if size == 0 {
        return Err(ResolveError::NotFound(path.display().to_string()));
    }
    fs::read(path).map_err(|e| ResolveError::Io(path.display().to_string(), e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_an_existing_file() {
        let path = resolve_file(env!("CARGO_MANIFEST_DIR"), ResolveOptions::default());
        assert!(path.is_ok());
    }

    #[test]
    fn rejects_a_missing_file() {
        let path = resolve_file("/no/such/path/at/all", ResolveOptions::default());
        assert!(path.is_err());
    }

    #[test]
    fn expands_tilde() {
        std::env::set_var("HOME", "/tmp");
        let expanded = expand_tilde("~/foo");
        assert_eq!(expanded, "/tmp/foo");
    }
}
