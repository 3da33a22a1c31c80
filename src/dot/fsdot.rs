//! Context filesystem provider (`ReadFile`, `ServeFile`, ...).
//!
//! Exposes the configured context directory to templates. Paths are cleaned
//! against traversal before touching the filesystem. `ServeFile` and
//! `ServeContent` raise the handler sentinel: the executor stops, commits
//! the transaction, and produces the response from the action.

use crate::build::assets::clean_url_path;
use crate::tmpl::{ExecError, HandlerAction, Map, Object, Value};
use std::path::{Path, PathBuf};

pub struct FsDot {
    root: PathBuf,
}

impl FsDot {
    pub fn new(root: PathBuf) -> Self {
        FsDot { root }
    }

    /// Resolve a template-supplied path inside the context root.
    fn resolve(&self, path: &str) -> PathBuf {
        let clean = clean_url_path(path);
        self.root.join(clean.trim_start_matches('/'))
    }

    fn arg_path(args: &[Value], method: &str) -> Result<String, ExecError> {
        args.first()
            .map(|v| v.to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ExecError::Failure(format!("{method}: missing path argument")))
    }
}

fn stat_map(path: &Path, meta: &std::fs::Metadata) -> Value {
    let mut m = Map::new();
    m.insert(
        "Name".to_string(),
        Value::str(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        ),
    );
    m.insert("Size".to_string(), Value::Int(meta.len() as i64));
    m.insert("IsDir".to_string(), Value::Bool(meta.is_dir()));
    if let Ok(modtime) = meta.modified() {
        m.insert(
            "ModTime".to_string(),
            Value::str(httpdate::fmt_http_date(modtime)),
        );
    }
    Value::map(m)
}

impl Object for FsDot {
    fn type_name(&self) -> &'static str {
        "fs"
    }

    fn call(&self, method: &str, args: &[Value]) -> Option<Result<Value, ExecError>> {
        match method {
            "ReadFile" => Some((|| {
                let path = Self::arg_path(args, method)?;
                let abs = self.resolve(&path);
                let bytes = std::fs::read(&abs)
                    .map_err(|e| ExecError::Failure(format!("ReadFile {path}: {e}")))?;
                Ok(Value::str(String::from_utf8_lossy(&bytes).into_owned()))
            })()),

            "ListFiles" => Some((|| {
                let path = Self::arg_path(args, method)?;
                let abs = self.resolve(&path);
                let mut names: Vec<String> = std::fs::read_dir(&abs)
                    .map_err(|e| ExecError::Failure(format!("ListFiles {path}: {e}")))?
                    .filter_map(|entry| entry.ok())
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                Ok(Value::list(names.into_iter().map(Value::Str).collect()))
            })()),

            "StatFile" => Some((|| {
                let path = Self::arg_path(args, method)?;
                let abs = self.resolve(&path);
                let meta = std::fs::metadata(&abs)
                    .map_err(|e| ExecError::Failure(format!("StatFile {path}: {e}")))?;
                Ok(stat_map(&abs, &meta))
            })()),

            "FileExists" => Some((|| {
                let path = Self::arg_path(args, method)?;
                Ok(Value::Bool(self.resolve(&path).is_file()))
            })()),

            "ServeFile" => Some((|| {
                let path = Self::arg_path(args, method)?;
                let abs = self.resolve(&path);
                if !abs.is_file() {
                    return Err(ExecError::Failure(format!(
                        "ServeFile: no such file '{path}'"
                    )));
                }
                Err(ExecError::Handler(HandlerAction::ServeFile(abs)))
            })()),

            "ServeContent" => Some((|| {
                let name = Self::arg_path(args, method)?;
                let body = args
                    .get(1)
                    .map(|v| v.to_string())
                    .ok_or_else(|| ExecError::Failure("ServeContent: missing body".to_string()))?;
                Err(ExecError::Handler(HandlerAction::ServeContent {
                    name,
                    modtime: None,
                    body: body.into_bytes(),
                }))
            })()),

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fs_dot() -> (tempfile::TempDir, FsDot) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.txt"), "beta").unwrap();
        let dot = FsDot::new(dir.path().to_path_buf());
        (dir, dot)
    }

    #[test]
    fn test_read_file() {
        let (_dir, dot) = fs_dot();
        let v = dot
            .call("ReadFile", &[Value::str("a.txt")])
            .unwrap()
            .unwrap();
        assert_eq!(v.to_string(), "alpha");
    }

    #[test]
    fn test_list_files_sorted() {
        let (_dir, dot) = fs_dot();
        let v = dot.call("ListFiles", &[Value::str("/")]).unwrap().unwrap();
        assert_eq!(v.to_string(), "[a.txt b.txt]");
    }

    #[test]
    fn test_file_exists() {
        let (_dir, dot) = fs_dot();
        assert!(dot
            .call("FileExists", &[Value::str("a.txt")])
            .unwrap()
            .unwrap()
            .truthy());
        assert!(!dot
            .call("FileExists", &[Value::str("zzz.txt")])
            .unwrap()
            .unwrap()
            .truthy());
    }

    #[test]
    fn test_traversal_is_contained() {
        let (_dir, dot) = fs_dot();
        // ../../etc/passwd cleans to /etc/passwd under the context root
        let v = dot
            .call("FileExists", &[Value::str("../../a.txt")])
            .unwrap()
            .unwrap();
        assert!(v.truthy(), "cleaned path stays inside the root");
    }

    #[test]
    fn test_serve_file_raises_handler() {
        let (_dir, dot) = fs_dot();
        let err = dot
            .call("ServeFile", &[Value::str("a.txt")])
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            ExecError::Handler(HandlerAction::ServeFile(_))
        ));
    }

    #[test]
    fn test_serve_missing_file_fails() {
        let (_dir, dot) = fs_dot();
        let err = dot
            .call("ServeFile", &[Value::str("gone.txt")])
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ExecError::Failure(_)));
    }

    #[test]
    fn test_stat_file() {
        let (_dir, dot) = fs_dot();
        let v = dot
            .call("StatFile", &[Value::str("a.txt")])
            .unwrap()
            .unwrap();
        let size = v.access_field("Size").unwrap();
        assert!(size.equals(&Value::Int(5)));
        assert!(!v.access_field("IsDir").unwrap().truthy());
    }
}
