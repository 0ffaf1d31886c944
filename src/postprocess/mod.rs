//! Post-download hooks: checksum verification and archive extraction.
//!
//! Both run after a transfer commits `Completed`; their failures are
//! reported as warnings, never as transfer failures.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

const BUF_SIZE: usize = 64 * 1024;

pub trait HashVerifier: Send + Sync {
  fn verify(&self, path: &Path, expected: &str) -> Result<bool>;
}

pub trait ArchiveExtractor: Send + Sync {
  fn extract(&self, archive: &Path, dest_dir: &Path) -> Result<()>;
}

/// Streaming SHA-256 verifier; the default `HashVerifier`.
pub struct Sha256Verifier;

impl HashVerifier for Sha256Verifier {
  fn verify(&self, path: &Path, expected: &str) -> Result<bool> {
    let actual = sha256_path(path)?;
    Ok(actual == expected.trim().to_ascii_lowercase())
  }
}

/// Compute SHA-256 of a file as lowercase hex. Reads in chunks so memory
/// stays bounded for large files.
pub fn sha256_path(path: &Path) -> Result<String> {
  let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
  let mut hasher = Sha256::new();
  let mut buf = [0u8; BUF_SIZE];
  loop {
    let n = f
      .read(&mut buf)
      .with_context(|| format!("read {}", path.display()))?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(hex::encode(hasher.finalize()))
}

const ARCHIVE_EXTENSIONS: [&str; 5] = [".zip", ".rar", ".tar", ".gz", ".7z"];

pub fn is_archive(path: &Path) -> bool {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default();
  ARCHIVE_EXTENSIONS.iter().any(|ext| name.ends_with(ext))
}
