//! Frame-level helpers shared by the framer, the client and the in-memory phone
//!
//! Header construction, reply splitting and the path handling that keeps
//! remote names confined under a local dump root.

use crate::codec::read_u16_be;
use crate::error::{Error, Result};
use crate::protocol::{reply, HEADER_LEN, HEADER_PREFIX, MAX_PAYLOAD};
use std::path::{Component, Path, PathBuf};

/// Validate outbound payload size against the 16-bit length field
pub fn validate_payload_size(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD {
        return Err(Error::protocol(format!(
            "payload too large: {} bytes (max: {})",
            size, MAX_PAYLOAD
        )));
    }
    Ok(())
}

/// Build the 6-byte outbound header
/// Format: 0x19 0x00 0x10 | OPCODE (1) | LENGTH (2, big-endian)
pub fn build_frame_header(opcode: u8, payload_len: u16) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..3].copy_from_slice(&HEADER_PREFIX);
    header[3] = opcode;
    header[4..6].copy_from_slice(&payload_len.to_be_bytes());
    header
}

/// Build a complete outbound frame (header + payload)
pub fn build_frame(opcode: u8, payload: &[u8]) -> Result<Vec<u8>> {
    validate_payload_size(payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&build_frame_header(opcode, payload.len() as u16));
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Split a reply made of back-to-back records into record spans.
///
/// Each record carries its body length as a big-endian u16 at offset 4 and
/// is `length + 6` bytes long. Trailing bytes shorter than a header, or
/// trailing zero padding, end the walk. A record running past the end of
/// the reply is an error.
pub fn split_records(data: &[u8]) -> Result<Vec<&[u8]>> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while data.len() - offset >= HEADER_LEN {
        let rest = &data[offset..];
        if rest.iter().all(|&b| b == 0) {
            break;
        }
        let length = read_u16_be(rest, reply::RECORD_LENGTH_OFFSET)
            .map(usize::from)
            .ok_or_else(|| Error::protocol("truncated directory record header"))?;
        let total = length + HEADER_LEN;
        if total > rest.len() {
            return Err(Error::protocol(format!(
                "directory record at offset {} declares {} bytes but only {} remain",
                offset,
                total,
                rest.len()
            )));
        }
        records.push(&rest[..total]);
        offset += total;
    }
    Ok(records)
}

/// Remote directory path with a guaranteed trailing `/`
pub fn remote_dir(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Remote directory path without trailing `/`; the root stays `/`
pub fn strip_remote_dir(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

/// Join a remote directory and an entry name
pub fn join_remote(dir: &str, name: &str) -> String {
    format!("{}{}", remote_dir(dir), name)
}

/// Normalize a path to be safely under a root directory.
/// This prevents path traversal by:
/// 1. Rejecting absolute paths, parent directory components, and root/prefix components
/// 2. Rejecting NUL bytes in path
/// 3. Canonicalizing the final path to resolve symlinks
/// 4. Ensuring the result is under the (canonical) root
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    let path_str = p.to_string_lossy();
    if path_str.contains('\0') {
        return Err(Error::protocol(format!("path {:?} contains NUL byte", p)));
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                return Err(Error::protocol(format!(
                    "path {:?} contains disallowed component: {:?}",
                    p, component
                )));
            }
        }
    }

    let root = root.canonicalize().map_err(|e| Error::io(root, e))?;
    let joined = root.join(&safe);

    // For existing paths, canonicalize to resolve symlinks
    // For new files, canonicalize parent then append filename
    let final_path = if joined.exists() {
        joined.canonicalize().map_err(|e| Error::io(&joined, e))?
    } else if let Some(parent) = joined.parent() {
        if parent.exists() {
            let canonical_parent = parent.canonicalize().map_err(|e| Error::io(parent, e))?;
            match joined.file_name() {
                Some(filename) => canonical_parent.join(filename),
                None => canonical_parent,
            }
        } else {
            joined
        }
    } else {
        joined
    };

    if !final_path.starts_with(&root) {
        return Err(Error::protocol(format!(
            "path {:?} escapes root {:?}",
            p, root
        )));
    }
    Ok(final_path)
}

/// Place a single remote entry name under a local directory
pub fn local_child(dir: &Path, name: &str) -> Result<PathBuf> {
    if name.is_empty() || name.contains('/') || name.contains('\\') {
        return Err(Error::protocol(format!(
            "remote entry name {:?} is not a single path component",
            name
        )));
    }
    normalize_under_root(dir, Path::new(name))
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| Error::io(path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn record(declared: u16, fill: u8) -> Vec<u8> {
        let mut r = vec![0x19, 0x10, 0x00, 0x6d];
        r.extend_from_slice(&declared.to_be_bytes());
        r.extend(std::iter::repeat(fill).take(declared as usize));
        r
    }

    #[test]
    fn test_split_records_exact_spans() {
        let a = record(10, 0xaa);
        let b = record(0, 0xbb);
        let c = record(25, 0xcc);
        let mut reply = Vec::new();
        reply.extend_from_slice(&a);
        reply.extend_from_slice(&b);
        reply.extend_from_slice(&c);

        let records = split_records(&reply).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], &a[..]);
        assert_eq!(records[1], &b[..]);
        assert_eq!(records[2], &c[..]);
        assert_eq!(records[0].len(), 16);
        assert_eq!(records[1].len(), 6);
        assert_eq!(records[2].len(), 31);

        // Trailing padding does not produce extra records
        for pad in [1usize, 5, 6, 64] {
            let mut padded = reply.clone();
            padded.extend(std::iter::repeat(0u8).take(pad));
            let records = split_records(&padded).unwrap();
            assert_eq!(records.len(), 3, "padding {}", pad);
            assert_eq!(records[2], &c[..]);
        }
    }

    #[test]
    fn test_split_records_overrun_is_error() {
        let mut reply = record(10, 1);
        reply.truncate(12);
        assert!(matches!(split_records(&reply), Err(Error::Protocol(_))));
        assert!(split_records(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_frame_header_layout() {
        let header = build_frame_header(0x6d, 0x0123);
        assert_eq!(header, [0x19, 0x00, 0x10, 0x6d, 0x01, 0x23]);
        let frame = build_frame(0xd0, &[0x04]).unwrap();
        assert_eq!(frame, vec![0x19, 0x00, 0x10, 0xd0, 0x00, 0x01, 0x04]);
    }

    #[test]
    fn test_validate_payload_size_edge_cases() {
        assert!(validate_payload_size(0).is_ok());
        assert!(validate_payload_size(MAX_PAYLOAD).is_ok());
        assert!(validate_payload_size(MAX_PAYLOAD + 1).is_err());
        assert!(build_frame(0x6d, &vec![0u8; MAX_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn test_remote_path_helpers() {
        assert_eq!(remote_dir("/"), "/");
        assert_eq!(remote_dir("/c/Images"), "/c/Images/");
        assert_eq!(join_remote("/c", "a.jpg"), "/c/a.jpg");
        assert_eq!(join_remote("/", "c"), "/c");
        assert_eq!(strip_remote_dir("/c/Images/"), "/c/Images");
        assert_eq!(strip_remote_dir("/c"), "/c");
        assert_eq!(strip_remote_dir("/"), "/");
        assert_eq!(strip_remote_dir("//"), "/");
    }

    #[test]
    fn test_normalize_under_root_safe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        let result = normalize_under_root(root, Path::new("subdir/file.txt")).unwrap();
        assert!(result.ends_with("subdir/file.txt"));

        let result = normalize_under_root(root, Path::new("./subdir/./file.txt")).unwrap();
        assert!(result.ends_with("subdir/file.txt"));
    }

    #[test]
    fn test_normalize_under_root_unsafe_paths() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        assert!(normalize_under_root(root, Path::new("../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("subdir/../../etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("/etc/passwd")).is_err());
        assert!(normalize_under_root(root, Path::new("file\0.txt")).is_err());
    }

    #[test]
    fn test_local_child_rejects_separators() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        assert!(local_child(root, "a/b").is_err());
        assert!(local_child(root, "..").is_err());
        assert!(local_child(root, "").is_err());
        let ok = local_child(root, "photo.jpg").unwrap();
        assert_eq!(ok.file_name().unwrap(), "photo.jpg");
    }

    #[test]
    fn test_ensure_dir_exists() {
        let temp_dir = TempDir::new().unwrap();
        let new_dir = temp_dir.path().join("new").join("nested").join("dir");

        assert!(!new_dir.exists());
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.is_dir());

        // Should be idempotent
        ensure_dir_exists(&new_dir).unwrap();
        assert!(new_dir.exists());
        fs::remove_dir(&new_dir).unwrap();
    }
}
