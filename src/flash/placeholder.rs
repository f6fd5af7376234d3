//! Placeholder image detection.
//!
//! When no firmware toolchain is available the build stage writes stub
//! artifacts that begin with `UF2_PLACEHOLDER` / `ELF_PLACEHOLDER`. Live
//! flashing must refuse them.

use std::path::Path;
use tokio::io::AsyncReadExt;

/// Marker literal present in every stub artifact.
pub const PLACEHOLDER_MARKER: &[u8] = b"PLACEHOLDER";

/// Bytes inspected from the start of the file.
const SCAN_BYTES: usize = 4096;

/// True when `bytes` looks like a stub artifact.
pub fn looks_like_placeholder(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(SCAN_BYTES)];
    head.windows(PLACEHOLDER_MARKER.len()).any(|w| w == PLACEHOLDER_MARKER)
}

/// Read the head of `path` and check it for the placeholder marker.
pub async fn is_placeholder(path: &Path) -> std::io::Result<bool> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SCAN_BYTES);
    file.take(SCAN_BYTES as u64).read_to_end(&mut head).await?;
    Ok(looks_like_placeholder(&head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_looks_like_placeholder() {
        assert!(looks_like_placeholder(b"UF2_PLACEHOLDER\n{\"case\":\"x\"}"));
        assert!(!looks_like_placeholder(b"UF2\n\x57\x51\x5d\x9e"));
        assert!(!looks_like_placeholder(b""));
    }

    #[test]
    fn test_marker_past_scan_window_ignored() {
        let mut data = vec![0u8; SCAN_BYTES];
        data.extend_from_slice(PLACEHOLDER_MARKER);
        assert!(!looks_like_placeholder(&data));
    }

    #[tokio::test]
    async fn test_is_placeholder_file() {
        let dir = TempDir::new().unwrap();
        let stub = dir.path().join("fw.uf2");
        let real = dir.path().join("real.uf2");
        std::fs::write(&stub, "UF2_PLACEHOLDER\n").unwrap();
        std::fs::write(&real, [0x55u8, 0x46, 0x32, 0x0a, 0x57, 0x51]).unwrap();

        assert!(is_placeholder(&stub).await.unwrap());
        assert!(!is_placeholder(&real).await.unwrap());
        assert!(is_placeholder(&dir.path().join("missing.uf2")).await.is_err());
    }
}
