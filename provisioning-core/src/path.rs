//! Relative path helpers shared by adapters, planner and validation.
//!
//! Repository paths are always `/`-separated and relative. A trailing `/`
//! marks a directory.

use crate::error::PathError;

pub const MAX_PATH_LEN: usize = 1024;

/// Reject empty, absolute, traversing or otherwise unsafe relative paths.
pub fn validate(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong {
            len: path.len(),
            max: MAX_PATH_LEN,
        });
    }
    if path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path) {
        return Err(PathError::Absolute(path.to_owned()));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(PathError::InvalidSegment(path.to_owned()));
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    for segment in trimmed.split('/') {
        match segment {
            ".." => return Err(PathError::Traversal(path.to_owned())),
            "" | "." => return Err(PathError::InvalidSegment(path.to_owned())),
            _ => {}
        }
    }
    Ok(())
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

pub fn is_dir(path: &str) -> bool {
    path.ends_with('/')
}

/// Parent directory with trailing slash; `""` for top-level entries.
///
/// `a/b/c.json` → `a/b/`, `a/b/` → `a/`, `c.json` → `""`.
pub fn dir(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    }
}

/// Last segment without trailing slash.
pub fn base(path: &str) -> &str {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Number of directory levels above the entry.
pub fn depth(path: &str) -> usize {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.matches('/').count()
}

/// Join `dir` (with or without trailing slash) and `name`.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_owned();
    }
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Normalise a directory path to carry exactly one trailing slash.
pub fn as_dir(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}

/// `true` when `path` is `dir` itself or lives anywhere beneath it.
pub fn is_under(path: &str, dir: &str) -> bool {
    if dir.is_empty() {
        return true;
    }
    let dir = as_dir(dir);
    path == dir || path.starts_with(&dir)
}

/// Every ancestor directory, outermost first.
///
/// `a/b/c.json` → `["a/", "a/b/"]`.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = dir(path);
    while !current.is_empty() {
        out.push(current.to_owned());
        current = dir(current);
    }
    out.reverse();
    out
}

/// File extension, lowercased, without the dot.
pub fn extension(path: &str) -> Option<String> {
    let name = base(path);
    let idx = name.rfind('.')?;
    if idx == 0 {
        return None;
    }
    Some(name[idx + 1..].to_ascii_lowercase())
}

/// Hidden entries (`.git`, `.keep`, ...) anywhere in the path.
pub fn is_hidden(path: &str) -> bool {
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    trimmed.split('/').any(|s| s.starts_with('.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("dashboard.json")]
    #[case("folder/")]
    #[case("a/b/c.yaml")]
    #[case("a/..b/c.json")]
    fn accepts_safe_paths(#[case] path: &str) {
        assert_eq!(validate(path), Ok(()));
    }

    #[rstest]
    #[case("", PathError::Empty)]
    #[case("/etc/passwd", PathError::Absolute("/etc/passwd".into()))]
    #[case("C:/x.json", PathError::Absolute("C:/x.json".into()))]
    #[case("../x.json", PathError::Traversal("../x.json".into()))]
    #[case("a/../../x.json", PathError::Traversal("a/../../x.json".into()))]
    #[case("a//b.json", PathError::InvalidSegment("a//b.json".into()))]
    #[case("./b.json", PathError::InvalidSegment("./b.json".into()))]
    #[case("a\\b.json", PathError::InvalidSegment("a\\b.json".into()))]
    fn rejects_unsafe_paths(#[case] path: &str, #[case] expected: PathError) {
        assert_eq!(validate(path), Err(expected));
    }

    #[test]
    fn rejects_overlong_paths() {
        let long = "a".repeat(MAX_PATH_LEN + 1);
        assert!(matches!(validate(&long), Err(PathError::TooLong { .. })));
    }

    #[rstest]
    #[case("a/b/c.json", "a/b/", "c.json", 2)]
    #[case("a/b/", "a/", "b", 1)]
    #[case("c.json", "", "c.json", 0)]
    #[case("top/", "", "top", 0)]
    fn dir_base_depth(
        #[case] path: &str,
        #[case] d: &str,
        #[case] b: &str,
        #[case] level: usize,
    ) {
        assert_eq!(dir(path), d);
        assert_eq!(base(path), b);
        assert_eq!(depth(path), level);
    }

    #[test]
    fn ancestors_outermost_first() {
        assert_eq!(ancestors("a/b/c.json"), vec!["a/".to_owned(), "a/b/".to_owned()]);
        assert!(ancestors("c.json").is_empty());
        assert_eq!(ancestors("a/b/"), vec!["a/".to_owned()]);
    }

    #[test]
    fn is_under_matches_prefix_on_segment_boundary() {
        assert!(is_under("folder/x.json", "folder/"));
        assert!(is_under("folder/", "folder"));
        assert!(!is_under("folder2/x.json", "folder"));
        assert!(is_under("anything", ""));
    }

    #[test]
    fn extension_and_hidden() {
        assert_eq!(extension("a/b.JSON").as_deref(), Some("json"));
        assert_eq!(extension(".keep"), None);
        assert!(is_hidden(".git/config"));
        assert!(is_hidden("a/.keep"));
        assert!(!is_hidden("a/b.json"));
    }

    #[test]
    fn join_handles_trailing_slash() {
        assert_eq!(join("", "x.json"), "x.json");
        assert_eq!(join("a/", "x.json"), "a/x.json");
        assert_eq!(join("a", "x.json"), "a/x.json");
    }
}
