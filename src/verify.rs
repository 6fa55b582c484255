use crate::error::{AppdownError, Result};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Pick the digest from the length of the declared hex value.
    pub fn for_checksum(expected: &str) -> Result<Self> {
        let expected = expected.trim();
        if !expected.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AppdownError::InvalidResponse(format!(
                "checksum is not hex: {}",
                expected
            )));
        }
        match expected.len() {
            32 => Ok(ChecksumAlgorithm::Md5),
            64 => Ok(ChecksumAlgorithm::Sha256),
            n => Err(AppdownError::InvalidResponse(format!(
                "unsupported checksum length {}",
                n
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityResult {
    pub matches: bool,
    /// Lowercase hex
    pub computed: String,
    pub algorithm: ChecksumAlgorithm,
}

impl IntegrityResult {
    /// Turn a mismatch into an error, keeping the computed value.
    pub fn into_result(self, expected: &str) -> Result<Self> {
        if self.matches {
            Ok(self)
        } else {
            Err(AppdownError::IntegrityMismatch {
                expected: expected.to_ascii_lowercase(),
                computed: self.computed,
            })
        }
    }
}

/// Whole-file digest comparison. Never deletes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub async fn verify(&self, file: &Path, expected: &str) -> Result<IntegrityResult> {
        let algorithm = ChecksumAlgorithm::for_checksum(expected)?;
        let path: PathBuf = file.to_path_buf();
        let computed = tokio::task::spawn_blocking(move || digest_file(&path, algorithm))
            .await
            .map_err(|e| AppdownError::Io(std::io::Error::other(e.to_string())))??;
        let matches = computed.eq_ignore_ascii_case(expected.trim());
        tracing::debug!(file = %file.display(), ?algorithm, matches, "verified artifact");
        Ok(IntegrityResult {
            matches,
            computed,
            algorithm,
        })
    }
}

pub fn digest_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    if !path.exists() {
        return Err(AppdownError::FileNotFound(path.to_path_buf()));
    }
    let mut file = std::fs::File::open(path)?;
    match algorithm {
        ChecksumAlgorithm::Md5 => hash_reader::<Md5>(&mut file),
        ChecksumAlgorithm::Sha256 => hash_reader::<Sha256>(&mut file),
    }
}

fn hash_reader<D: Digest>(reader: &mut impl Read) -> Result<String> {
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
