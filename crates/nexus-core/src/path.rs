//! Virtual path validation and glob conversion.

use crate::{NexusError, Result};

/// Validate and normalize a virtual path.
///
/// Paths are UTF-8, absolute, `/`-separated. `.` and `..` segments are
/// rejected outright, empty segments collapse, trailing slashes drop
/// (except root).
pub fn validate_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(NexusError::invalid("path must not be empty"));
    }
    if !path.starts_with('/') {
        return Err(NexusError::invalid(format!("path must start with '/': {path}")));
    }
    if path.contains('\0') {
        return Err(NexusError::invalid("path must not contain NUL"));
    }

    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(NexusError::invalid(format!(
                    "path must not contain '.' or '..' segments: {path}"
                )))
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{}", segments.join("/")))
}

/// Parent path, or `None` at the root.
pub fn parent_of(path: &str) -> Option<String> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/".to_string()),
        Some(idx) => Some(path[..idx].to_string()),
        None => None,
    }
}

/// Ancestor directories from immediate parent up to the root.
pub fn ancestors_of(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = path.to_string();
    while let Some(parent) = parent_of(&current) {
        out.push(parent.clone());
        current = parent;
    }
    out
}

/// Convert a glob to an anchored regex. `**` crosses separators, `*` and
/// `?` stay within one segment.
pub fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // swallow a following slash so "a/**/b" matches "a/b"
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '[' | ']' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            other => out.push(other),
        }
    }
    out.push('$');

    regex::Regex::new(&out)
        .map_err(|e| NexusError::invalid(format!("bad glob pattern {pattern}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes() {
        assert_eq!(validate_path("/a/b.txt").unwrap(), "/a/b.txt");
        assert_eq!(validate_path("//a//b/").unwrap(), "/a/b");
        assert_eq!(validate_path("/").unwrap(), "/");
    }

    #[test]
    fn rejects_bad_paths() {
        assert!(validate_path("relative/path").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_path("/a/../b").is_err());
        assert!(validate_path("/a/./b").is_err());
        assert!(validate_path("/a\0b").is_err());
    }

    #[test]
    fn parents_and_ancestors() {
        assert_eq!(parent_of("/a/b/c.txt").as_deref(), Some("/a/b"));
        assert_eq!(parent_of("/a").as_deref(), Some("/"));
        assert_eq!(parent_of("/"), None);
        assert_eq!(
            ancestors_of("/a/b/c.txt"),
            vec!["/a/b".to_string(), "/a".to_string(), "/".to_string()]
        );
    }

    #[test]
    fn glob_conversion() {
        let re = glob_to_regex("/logs/*.txt").unwrap();
        assert!(re.is_match("/logs/a.txt"));
        assert!(!re.is_match("/logs/sub/a.txt"));

        let re = glob_to_regex("/logs/**/*.txt").unwrap();
        assert!(re.is_match("/logs/a.txt"));
        assert!(re.is_match("/logs/deep/nested/a.txt"));

        let re = glob_to_regex("/r-?.csv").unwrap();
        assert!(re.is_match("/r-1.csv"));
        assert!(!re.is_match("/r-10.csv"));
    }
}
