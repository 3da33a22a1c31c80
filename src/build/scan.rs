//! Template root scanner.
//!
//! Walks the template root in lexical order and yields relative file paths.
//! Ordering matters: identity files must be seen before their compressed
//! companions, which sort immediately after them in the same directory.

use anyhow::{Context, Result};
use jwalk::{Parallelism, WalkDir};
use std::path::Path;

/// Walk `root` recursively, returning relative paths of regular files in
/// lexical order, with `/` separators. Any walk error fails the build.
pub fn walk_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort(true)
        .parallelism(Parallelism::Serial)
        .skip_hidden(false);

    for entry in walker {
        let entry = entry.with_context(|| format!("error scanning {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("file {} outside root", path.display()))?;
        files.push(rel_to_slash(rel));
    }
    Ok(files)
}

/// Render a relative path with forward slashes regardless of platform.
fn rel_to_slash(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_lexical_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("b/z.txt"), "z").unwrap();
        fs::write(root.join("style.css"), "body{}").unwrap();
        fs::write(root.join("style.css.gz"), "x").unwrap();
        fs::write(root.join("a.html"), "a").unwrap();

        let files = walk_files(root).unwrap();
        assert_eq!(files, vec!["a.html", "b/z.txt", "style.css", "style.css.gz"]);
    }

    #[test]
    fn test_hidden_files_are_yielded() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".hidden.html"), "x").unwrap();
        let files = walk_files(dir.path()).unwrap();
        assert_eq!(files, vec![".hidden.html"]);
    }

    #[test]
    fn test_missing_root_fails() {
        assert!(walk_files(Path::new("/nonexistent/xtemplate-root")).is_err());
    }
}
