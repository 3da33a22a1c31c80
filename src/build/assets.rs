//! Static file loader.
//!
//! Every non-template file becomes (or extends) a [`FileInfo`] keyed by its
//! identity path. Compressed companions (`.gz`, `.br`, `.zst`) are decoded
//! and verified byte-identical against the identity file's SRI hash at build
//! time so serve-time negotiation never has to look at file contents.

use crate::debug;
use anyhow::{bail, Context, Result};
use base64::Engine;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha384};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::SystemTime;

/// One representation of an identity file.
#[derive(Debug, Clone)]
pub struct EncodingVariant {
    /// Encoding name: `identity`, `gzip`, `br`, or `zstd`.
    pub encoding: &'static str,
    /// Source path relative to the template root.
    pub path: String,
    /// On-disk size in bytes.
    pub size: u64,
    /// Modification timestamp at build time.
    pub modtime: SystemTime,
}

/// A static entry: the identity file plus its alternate encodings.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub identity_path: String,
    /// SRI hash: `sha384-` + base64url of the SHA-384 of the identity bytes.
    pub hash: String,
    pub content_type: String,
    /// Sorted by ascending size; the negotiation preference order.
    pub encodings: Vec<EncodingVariant>,
}

/// The static file map accumulated during a build.
#[derive(Debug, Default)]
pub struct StaticSet {
    pub files: FxHashMap<String, FileInfo>,
}

/// Content types resolved by extension without sniffing.
fn extension_content_type(ext: &str) -> Option<&'static str> {
    match ext {
        ".css" => Some("text/css; charset=utf-8"),
        ".js" => Some("text/javascript; charset=utf-8"),
        ".csv" => Some("text/csv"),
        _ => None,
    }
}

/// Decoder wrapping for a recognized compression suffix.
fn encoding_for_suffix(ext: &str) -> Option<&'static str> {
    match ext {
        ".gz" => Some("gzip"),
        ".br" => Some("br"),
        ".zst" => Some("zstd"),
        _ => None,
    }
}

impl StaticSet {
    /// Load one static file. Returns the identity path when a new `GET`
    /// route should be registered (identity entries only; companions
    /// extend an existing entry).
    pub fn add_file(&mut self, root: &Path, rel: &str) -> Result<Option<String>> {
        let abs = root.join(rel);
        let meta = std::fs::metadata(&abs)
            .with_context(|| format!("failed to stat static file '{rel}'"))?;
        let size = meta.len();
        let modtime = meta
            .modified()
            .with_context(|| format!("failed to read modtime of '{rel}'"))?;

        let urlpath = clean_url_path(rel);
        let ext = url_extension(&urlpath);

        // A recognized compression suffix makes this a companion, but only
        // when its identity sibling was already scanned (lexical order
        // guarantees the identity comes first when it exists).
        let companion = encoding_for_suffix(&ext).and_then(|encoding| {
            let identity_path = urlpath[..urlpath.len() - ext.len()].to_string();
            if self.files.contains_key(&identity_path) {
                Some((encoding, identity_path))
            } else {
                None
            }
        });

        match companion {
            Some((encoding, identity_path)) => {
                let sri = hash_file(&abs, rel, Some(encoding))?;
                let file = self.files.get_mut(&identity_path).expect("checked above");
                if file.hash != sri {
                    bail!(
                        "encoded file contents did not match original file '{}': expected {}, got {}",
                        rel,
                        file.hash,
                        sri
                    );
                }
                file.encodings.push(EncodingVariant {
                    encoding,
                    path: rel.to_string(),
                    size,
                    modtime,
                });
                file.encodings.sort_by_key(|e| e.size);
                debug!("build"; "added static encoding {} for {} ({} bytes)", encoding, identity_path, size);
                Ok(None)
            }
            None => {
                let sri = hash_file(&abs, rel, None)?;
                let content_type = match extension_content_type(&ext) {
                    Some(t) => t.to_string(),
                    None => sniff_content_type(&abs, rel)?,
                };
                let info = FileInfo {
                    identity_path: urlpath.clone(),
                    hash: sri.clone(),
                    content_type,
                    encodings: vec![EncodingVariant {
                        encoding: "identity",
                        path: rel.to_string(),
                        size,
                        modtime,
                    }],
                };
                debug!("build"; "added static file {} ({} bytes, {})", urlpath, size, sri);
                self.files.insert(urlpath.clone(), info);
                Ok(Some(urlpath))
            }
        }
    }
}

/// Clean a root-relative path into a virtual URL path with a leading `/`.
pub fn clean_url_path(rel: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in rel.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Extension of the final path segment, including the dot. Empty when none.
fn url_extension(urlpath: &str) -> String {
    let base = urlpath.rsplit('/').next().unwrap_or("");
    match base.rfind('.') {
        Some(at) if at > 0 => base[at..].to_string(),
        _ => String::new(),
    }
}

/// Hash a file's (possibly decoded) contents into an SRI string.
fn hash_file(abs: &Path, rel: &str, encoding: Option<&str>) -> Result<String> {
    let file =
        File::open(abs).with_context(|| format!("failed to open static file '{rel}'"))?;
    let mut reader: Box<dyn Read> = match encoding {
        None => Box::new(file),
        Some("gzip") => Box::new(flate2::read::GzDecoder::new(file)),
        Some("br") => Box::new(brotli::Decompressor::new(file, 8192)),
        Some("zstd") => Box::new(
            zstd::stream::read::Decoder::new(file)
                .with_context(|| format!("failed to create decompressor for '{rel}'"))?,
        ),
        Some(other) => bail!("unknown encoding '{other}' for '{rel}'"),
    };

    let mut hasher = Sha384::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader
            .read(&mut buf)
            .with_context(|| format!("failed to hash file '{rel}'"))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!(
        "sha384-{}",
        base64::engine::general_purpose::URL_SAFE.encode(hasher.finalize())
    ))
}

/// Sniff a content type from the first 512 bytes, mirroring the common
/// signature set; falls back to text/plain for valid UTF-8 and
/// application/octet-stream otherwise.
fn sniff_content_type(abs: &Path, rel: &str) -> Result<String> {
    let mut file =
        File::open(abs).with_context(|| format!("failed to open static file '{rel}'"))?;
    let mut buf = [0u8; 512];
    let mut len = 0;
    while len < buf.len() {
        let n = file
            .read(&mut buf[len..])
            .with_context(|| format!("failed to read file to guess content type '{rel}'"))?;
        if n == 0 {
            break;
        }
        len += n;
    }
    Ok(sniff_bytes(&buf[..len]).to_string())
}

/// Signature table for the sniffer.
pub fn sniff_bytes(data: &[u8]) -> &'static str {
    let trimmed = trim_ascii_start(data);
    let lower: Vec<u8> = trimmed.iter().take(32).map(|b| b.to_ascii_lowercase()).collect();

    if lower.starts_with(b"<!doctype html") || lower.starts_with(b"<html") || lower.starts_with(b"<head") || lower.starts_with(b"<body") {
        return "text/html; charset=utf-8";
    }
    if lower.starts_with(b"<?xml") {
        return "text/xml; charset=utf-8";
    }
    if data.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return "image/png";
    }
    if data.starts_with(&[0xff, 0xd8, 0xff]) {
        return "image/jpeg";
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return "image/gif";
    }
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return "image/webp";
    }
    if data.starts_with(&[0x1f, 0x8b]) {
        return "application/x-gzip";
    }
    if data.starts_with(b"PK\x03\x04") {
        return "application/zip";
    }
    if data.starts_with(b"wOFF") {
        return "font/woff";
    }
    if data.starts_with(b"wOF2") {
        return "font/woff2";
    }
    if std::str::from_utf8(data).is_ok() {
        return "text/plain; charset=utf-8";
    }
    "application/octet-stream"
}

/// Content type for an arbitrary served path: the extension table first,
/// then signature sniffing of the leading bytes.
pub fn guess_content_type(path: &Path, head: &[u8]) -> String {
    let ext = path.extension().and_then(|e| e.to_str());
    match ext {
        Some("css") => "text/css; charset=utf-8".to_string(),
        Some("js") => "text/javascript; charset=utf-8".to_string(),
        Some("csv") => "text/csv".to_string(),
        Some("html") | Some("htm") => "text/html; charset=utf-8".to_string(),
        Some("json") => "application/json".to_string(),
        Some("svg") => "image/svg+xml".to_string(),
        Some("txt") => "text/plain; charset=utf-8".to_string(),
        _ => sniff_bytes(head).to_string(),
    }
}

fn trim_ascii_start(data: &[u8]) -> &[u8] {
    let mut i = 0;
    while i < data.len() && (data[i] == b' ' || data[i] == b'\t' || data[i] == b'\n' || data[i] == b'\r') {
        i += 1;
    }
    &data[i..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_identity_then_companion() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("style.css"), b"body { color: red }").unwrap();
        std::fs::write(root.join("style.css.gz"), gzip(b"body { color: red }")).unwrap();

        let mut set = StaticSet::default();
        assert_eq!(
            set.add_file(root, "style.css").unwrap(),
            Some("/style.css".to_string())
        );
        // companion extends the entry, no new route
        assert_eq!(set.add_file(root, "style.css.gz").unwrap(), None);

        let info = set.files.get("/style.css").unwrap();
        assert!(info.hash.starts_with("sha384-"));
        assert_eq!(info.content_type, "text/css; charset=utf-8");
        assert_eq!(info.encodings.len(), 2);
        // sorted ascending by size; both decode to the same identity bytes
        assert!(info.encodings[0].size <= info.encodings[1].size);
    }

    #[test]
    fn test_companion_hash_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::write(root.join("a.txt.gz"), gzip(b"tampered")).unwrap();

        let mut set = StaticSet::default();
        set.add_file(root, "a.txt").unwrap();
        let err = set.add_file(root, "a.txt.gz").unwrap_err();
        assert!(err.to_string().contains("did not match"));
    }

    #[test]
    fn test_companion_without_identity_is_own_identity() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("orphan.txt.gz"), gzip(b"data")).unwrap();

        let mut set = StaticSet::default();
        // no sibling: the .gz file is routed as-is, hashed raw
        assert_eq!(
            set.add_file(root, "orphan.txt.gz").unwrap(),
            Some("/orphan.txt.gz".to_string())
        );
        let info = set.files.get("/orphan.txt.gz").unwrap();
        assert_eq!(info.encodings[0].encoding, "identity");
    }

    #[test]
    fn test_unknown_suffix_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("a.txt"), b"hello").unwrap();
        std::fs::write(root.join("a.txt.xz"), b"not really xz").unwrap();

        let mut set = StaticSet::default();
        set.add_file(root, "a.txt").unwrap();
        assert_eq!(
            set.add_file(root, "a.txt.xz").unwrap(),
            Some("/a.txt.xz".to_string())
        );
    }

    #[test]
    fn test_sri_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("d.bin"), b"abc").unwrap();
        let mut set = StaticSet::default();
        set.add_file(root, "d.bin").unwrap();
        // SHA-384("abc"), base64url
        assert_eq!(
            set.files.get("/d.bin").unwrap().hash,
            "sha384-ywB1P0WjXou1oD1pmsZQBycsMqsO3tFjGotgWkP_W-2AhgcroefMI1i67KE0yCWn"
        );
    }

    #[test]
    fn test_sniffing() {
        assert_eq!(sniff_bytes(b"<!DOCTYPE html><html>"), "text/html; charset=utf-8");
        assert_eq!(sniff_bytes(b"%PDF-1.4"), "application/pdf");
        assert_eq!(
            sniff_bytes(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0]),
            "image/png"
        );
        assert_eq!(sniff_bytes(b"plain words"), "text/plain; charset=utf-8");
        assert_eq!(sniff_bytes(&[0x00, 0x01, 0x02, 0xff]), "application/octet-stream");
    }

    #[test]
    fn test_clean_url_path() {
        assert_eq!(clean_url_path("a/b.txt"), "/a/b.txt");
        assert_eq!(clean_url_path("./a/../b.txt"), "/b.txt");
        assert_eq!(clean_url_path("style.css"), "/style.css");
    }
}
