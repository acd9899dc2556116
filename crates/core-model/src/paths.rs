use std::path::{Component, Path};

/// Lexically normalizes a tool or cache path: unifies separators, drops `.`
/// segments and folds `..` into its parent where one exists. The filesystem is
/// never consulted.
pub fn normalize_path(raw: &str) -> String {
    let unified = raw.trim().replace('\\', "/");
    if unified.is_empty() {
        return String::new();
    }
    let absolute = unified.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ if absolute => {}
                _ => parts.push(".."),
            },
            Component::Normal(seg) => {
                if let Some(s) = seg.to_str() {
                    parts.push(s);
                }
            }
            Component::Prefix(prefix) => {
                if let Some(s) = prefix.as_os_str().to_str() {
                    parts.push(s);
                }
            }
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_dot_segments() {
        assert_eq!(normalize_path("./src/./main.rs"), "src/main.rs");
    }

    #[test]
    fn folds_parent_segments() {
        assert_eq!(normalize_path("src/bin/../lib.rs"), "src/lib.rs");
        assert_eq!(normalize_path("../outside.rs"), "../outside.rs");
        assert_eq!(normalize_path("/a/../../b"), "/b");
    }

    #[test]
    fn unifies_separators_and_trims() {
        assert_eq!(normalize_path("  src\\lib.rs "), "src/lib.rs");
        assert_eq!(normalize_path("a//b"), "a/b");
    }

    #[test]
    fn empty_and_dot() {
        assert_eq!(normalize_path(""), "");
        assert_eq!(normalize_path("./"), ".");
    }
}
