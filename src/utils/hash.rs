use digest::Digest;
use md5::Md5;
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Streaming MD5 of a file, lowercase hex.
pub async fn compute_md5(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer).await?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let result = hasher.finalize();
    Ok(format!("{:x}", result))
}

/// Case-insensitive comparison against an expected hex digest.
pub async fn verify_md5(path: &Path, expected: &str) -> Result<bool, std::io::Error> {
    let hash = compute_md5(path).await?;
    Ok(hash.eq_ignore_ascii_case(expected))
}

pub fn md5_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_bytes() {
        // RFC 1321 test vector.
        assert_eq!(md5_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(md5_bytes(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn file_hash_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"gamma installer payload")
            .await
            .unwrap();

        let hash = compute_md5(&path).await.unwrap();
        assert!(verify_md5(&path, &hash).await.unwrap());
        assert!(verify_md5(&path, &hash.to_uppercase()).await.unwrap());
        assert!(!verify_md5(&path, "00000000000000000000000000000000")
            .await
            .unwrap());
    }
}
