//! Path algebra for the VFS namespace
//!
//! VFS paths are `/`-separated strings, always absolute once normalized. `.`
//! segments vanish, `..` pops a segment and stops at the root, so a normalized
//! path can never climb out of the namespace it addresses.

/// Normalize `path` into canonical absolute form (`/`, `/a`, `/a/b`, ...)
#[must_use]
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Resolve `child` relative to `base`
///
/// An absolute `child` still resolves under `base`; use [`normalize`] to
/// address from the root.
#[must_use]
pub fn combine(base: &str, child: &str) -> String {
    normalize(&format!("{base}/{child}"))
}

/// Last segment of `path`, empty for the root
#[must_use]
pub fn basename(path: &str) -> String {
    normalize(path)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Parent of `path`; the root is its own parent
#[must_use]
pub fn parent(path: &str) -> String {
    let normalized = normalize(path);
    match normalized.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(index) => normalized[..index].to_string(),
    }
}

/// `path` re-expressed relative to `base`, or `None` when it lies outside it
#[must_use]
pub fn strip_base(path: &str, base: &str) -> Option<String> {
    let path = normalize(path);
    let base = normalize(base);
    if base == "/" {
        return Some(path);
    }
    if path == base {
        return Some("/".to_string());
    }
    path.strip_prefix(&base)
        .filter(|rest| rest.starts_with('/'))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", "/")]
    #[case("/", "/")]
    #[case("a/b", "/a/b")]
    #[case("/a//b/", "/a/b")]
    #[case("/a/./b", "/a/b")]
    #[case("/a/../b", "/b")]
    #[case("/../../etc", "/etc")]
    #[case("a\\b", "/a/b")]
    fn test_normalize(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize(input), expected);
    }

    #[test]
    fn test_combine_stays_under_base() {
        assert_eq!(combine("/dir", "file.txt"), "/dir/file.txt");
        assert_eq!(combine("/dir", "/abs"), "/dir/abs");
        assert_eq!(combine("/dir", "../up"), "/up");
        assert_eq!(combine("/", ".."), "/");
    }

    #[test]
    fn test_basename_and_parent() {
        assert_eq!(basename("/a/b.txt"), "b.txt");
        assert_eq!(basename("/"), "");
        assert_eq!(parent("/a/b.txt"), "/a");
        assert_eq!(parent("/a"), "/");
        assert_eq!(parent("/"), "/");
    }

    #[test]
    fn test_strip_base() {
        assert_eq!(strip_base("/jail/a/b", "/jail").as_deref(), Some("/a/b"));
        assert_eq!(strip_base("/jail", "/jail").as_deref(), Some("/"));
        assert_eq!(strip_base("/jailbreak/x", "/jail"), None);
        assert_eq!(strip_base("/other", "/jail"), None);
        assert_eq!(strip_base("/x", "/").as_deref(), Some("/x"));
    }
}
