//! 完整性校验：文件大小 + 可选的摘要
//!
//! 校验只读取文件，不做任何修改；摘要通过独立打开的文件句柄重新计算，
//! 与写入路径无关。

use sha2::{Digest, Sha256, Sha512};
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::core::error::DownloadError;
use crate::core::task::{Checksum, ChecksumAlgorithm};

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// 校验下载结果
pub async fn verify_file(
    path: &Path,
    expected_size: Option<u64>,
    checksum: Option<&Checksum>,
) -> Result<(), DownloadError> {
    let actual = tokio::fs::metadata(path).await?.len();
    if let Some(expected) = expected_size {
        if actual != expected {
            log::error!("文件大小不匹配: {} 预期 {} 实际 {}", path.display(), expected, actual);
            return Err(DownloadError::SizeMismatch { expected, actual });
        }
    }

    let Some(checksum) = checksum else {
        return Ok(());
    };

    let owned: PathBuf = path.to_path_buf();
    let algorithm = checksum.algorithm;
    let digest = tokio::task::spawn_blocking(move || hash_file(&owned, algorithm))
        .await
        .map_err(|e| DownloadError::DiskIo(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    if !digest.eq_ignore_ascii_case(checksum.hex.trim()) {
        log::error!("校验和不匹配: {} 预期 {} 实际 {}", path.display(), checksum.hex, digest);
        return Err(DownloadError::ChecksumMismatch {
            expected: checksum.hex.clone(),
            actual: digest,
        });
    }
    log::info!("校验通过: {} ({})", path.display(), algorithm);
    Ok(())
}

/// 计算整个文件的摘要（十六进制小写）
pub fn hash_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String, DownloadError> {
    let mut file = std::fs::File::open(path)?;
    match algorithm {
        ChecksumAlgorithm::Sha256 => digest_reader::<Sha256>(&mut file),
        ChecksumAlgorithm::Sha512 => digest_reader::<Sha512>(&mut file),
    }
}

fn digest_reader<D: Digest>(reader: &mut impl Read) -> Result<String, DownloadError> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use std::io::Write;

    fn sha256_hex(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn write_temp(data: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(data).unwrap();
        file.flush().unwrap();
        file
    }

    #[actix_rt::test]
    async fn test_verify_size_and_checksum() {
        let data = b"model weights".repeat(1000);
        let file = write_temp(&data);
        let checksum = Checksum::sha256(sha256_hex(&data).to_uppercase());
        tokio_test::assert_ok!(verify_file(file.path(), Some(data.len() as u64), Some(&checksum)).await);
    }

    #[actix_rt::test]
    async fn test_size_mismatch() {
        let file = write_temp(b"short");
        let err = verify_file(file.path(), Some(10), None).await.unwrap_err();
        assert!(matches!(err, DownloadError::SizeMismatch { expected: 10, actual: 5 }));
    }

    #[actix_rt::test]
    async fn test_flipped_byte_detected() {
        let data = vec![7u8; 4096];
        let checksum = Checksum::sha256(sha256_hex(&data));
        let mut corrupted = data.clone();
        corrupted[2048] ^= 0xff;
        let file = write_temp(&corrupted);

        let err = verify_file(file.path(), Some(4096), Some(&checksum)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::VerificationFailed);
        // 校验不会修改文件
        assert_eq!(std::fs::read(file.path()).unwrap(), corrupted);
    }

    #[actix_rt::test]
    async fn test_unknown_size_skips_size_check() {
        let file = write_temp(b"abc");
        tokio_test::assert_ok!(verify_file(file.path(), None, None).await);
    }

    #[test]
    fn test_hash_file_sha512() {
        let file = write_temp(b"abc");
        let digest = hash_file(file.path(), ChecksumAlgorithm::Sha512).unwrap();
        assert_eq!(digest.len(), 128);
        assert!(digest.starts_with("ddaf35a193617aba"));
    }
}
