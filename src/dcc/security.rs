//! Filename and address hygiene for DCC.
//!
//! - **Filename tokens**: the single-word name announced on the wire for a
//!   local file, stable for the lifetime of an offer so RESUME/ACCEPT can be
//!   matched against it.
//! - **Path traversal**: names received from peers are reduced to a bare
//!   file name and resolved inside the download directory.
//! - **Private IP rejection**: optionally refuse offers pointing at
//!   private, loopback, and link-local addresses.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

const MAX_NAME_LEN: usize = 255;

/// Check if an IP address is private/loopback
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Reduce a peer-supplied name to a bare file name: no directories (Unix or
/// Windows style), no control characters, no leading dots.
pub fn sanitize_filename(filename: &str) -> Option<String> {
    // Backslash is a legal character on Unix, so split on it by hand
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && *c != ':')
        .collect();
    let cleaned = cleaned.trim_start_matches('.').trim();

    if cleaned.is_empty() {
        return None;
    }

    let mut end = cleaned.len().min(MAX_NAME_LEN);
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    Some(cleaned[..end].to_string())
}

/// Wire token for a local path: its sanitized base name with every run of
/// whitespace or `"` replaced by `_`.
pub fn filename_token(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let name = sanitize_filename(name)?;
    let token = name
        .split(|c: char| c.is_whitespace() || c == '"')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    (!token.is_empty()).then_some(token)
}

/// Resolve where an incoming file should be written, keeping it inside
/// `download_dir` and picking `name_N.ext` when the name is taken.
pub fn safe_download_path(download_dir: &Path, filename: &str) -> Option<PathBuf> {
    let sanitized = sanitize_filename(filename)?;

    let canonical_dir = download_dir
        .canonicalize()
        .unwrap_or_else(|_| download_dir.to_path_buf());
    if !canonical_dir.join(&sanitized).starts_with(&canonical_dir) {
        return None;
    }

    let path = download_dir.join(&sanitized);
    if !path.exists() {
        return Some(path);
    }

    let as_path = Path::new(&sanitized);
    let stem = as_path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = as_path.extension().and_then(|s| s.to_str());
    (1..1000)
        .map(|i| match ext {
            Some(ext) => download_dir.join(format!("{}_{}.{}", stem, i, ext)),
            None => download_dir.join(format!("{}_{}", stem, i)),
        })
        .find(|candidate| !candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("hello.txt"), Some("hello.txt".into()));
        assert_eq!(sanitize_filename("../../../etc/passwd"), Some("passwd".into()));
        assert_eq!(
            sanitize_filename("..\\..\\windows\\system32"),
            Some("system32".into())
        );
        assert_eq!(sanitize_filename(".hidden"), Some("hidden".into()));
        assert_eq!(sanitize_filename("..."), None);
        assert_eq!(sanitize_filename(""), None);
        assert_eq!(sanitize_filename("normal file.pdf"), Some("normal file.pdf".into()));
    }

    #[test]
    fn test_filename_token_has_no_whitespace() {
        assert_eq!(filename_token(Path::new("/tmp/src")), Some("src".into()));
        assert_eq!(
            filename_token(Path::new("/data/my  holiday pics.tar")),
            Some("my_holiday_pics.tar".into())
        );
        assert_eq!(filename_token(Path::new("/")), None);
    }

    #[test]
    fn test_filename_token_survives_the_wire() {
        use crate::dcc::codec::DccRequest;

        for name in ["\"weird", "a\"b c\"", "plain.txt", "two words.bin"] {
            let token = filename_token(&Path::new("/tmp").join(name)).unwrap();
            assert!(!token.contains('"'), "{token}");

            let request = DccRequest::Send {
                filename: token.clone(),
                addr: "127.0.0.1:4567".parse().unwrap(),
                size: Some(10),
            };
            assert_eq!(DccRequest::parse(&request.to_string()).unwrap(), request);

            let resume = DccRequest::Resume {
                filename: token,
                port: 4567,
                offset: 3,
            };
            assert_eq!(DccRequest::parse(&resume.to_string()).unwrap(), resume);
        }
        assert_eq!(filename_token(Path::new("/tmp/\"\"")), None);
    }

    #[test]
    fn test_safe_download_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = safe_download_path(dir.path(), "../notes.txt").unwrap();
        assert_eq!(first, dir.path().join("notes.txt"));
        std::fs::write(&first, b"x").unwrap();
        let second = safe_download_path(dir.path(), "notes.txt").unwrap();
        assert_eq!(second, dir.path().join("notes_1.txt"));
    }

    #[test]
    fn test_is_private_ip() {
        assert!(is_private_ip(&"127.0.0.1".parse().unwrap()));
        assert!(is_private_ip(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_ip(&"10.0.0.1".parse().unwrap()));
        assert!(!is_private_ip(&"8.8.8.8".parse().unwrap()));
    }
}
