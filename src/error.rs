use std::path::Path;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Why a transfer ended up `Failed`. Pause and cancel are lifecycle
/// outcomes, not errors, and never surface through this type.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("invalid url: {0}")]
  InvalidUrl(String),

  #[error("probe failed: {0}")]
  ProbeFailed(String),

  #[error("file conflict unresolved: {0}")]
  ConflictUnresolved(String),

  #[error("transport unavailable: {0}")]
  TransportUnavailable(String),

  #[error("segment {index} failed: {reason}")]
  SegmentFailed { index: usize, reason: String },

  #[error("assembly failed: {0}")]
  AssemblyFailed(String),

  #[error("{0}")]
  Unknown(String),
}

pub fn init_tracing(logs_dir: &Path) -> anyhow::Result<()> {
  // Rotate daily; keep logs in one directory so retention can sweep it.
  let file_appender = tracing_appender::rolling::daily(logs_dir, "veildl.jsonl");
  let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
  let _ = LOG_GUARD.set(guard);

  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn,hyper=warn"));

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(non_blocking)
    .json()
    .with_current_span(true)
    .with_span_list(true)
    .init();

  Ok(())
}

/// Stderr variant for embedders that don't want log files. Ignores the
/// "already initialized" error so tests can call it repeatedly.
pub fn init_stderr_tracing() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,reqwest=warn,hyper=warn"));

  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .try_init();
}

/// Log retention sweep: removes files in `logs_dir` older than
/// `retention_days`. `0` (or negative) keeps everything. Returns the number
/// of files removed. The engine never calls this on its own; it is a hook
/// for the embedding application's retention policy.
pub fn purge_old_logs(logs_dir: &Path, retention_days: i64) -> anyhow::Result<usize> {
  if retention_days <= 0 {
    return Ok(0);
  }
  let cutoff = SystemTime::now() - Duration::from_secs(retention_days as u64 * 86_400);

  let mut removed = 0;
  for entry in std::fs::read_dir(logs_dir)? {
    let entry = entry?;
    let meta = entry.metadata()?;
    if !meta.is_file() {
      continue;
    }
    let modified = match meta.modified() {
      Ok(m) => m,
      Err(_) => continue,
    };
    if modified < cutoff && std::fs::remove_file(entry.path()).is_ok() {
      removed += 1;
    }
  }
  Ok(removed)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn purge_is_a_no_op_without_retention() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old.jsonl"), b"x").unwrap();
    assert_eq!(purge_old_logs(dir.path(), 0).unwrap(), 0);
    assert!(dir.path().join("old.jsonl").exists());
  }

  #[test]
  fn purge_keeps_fresh_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("fresh.jsonl"), b"x").unwrap();
    assert_eq!(purge_old_logs(dir.path(), 30).unwrap(), 0);
    assert!(dir.path().join("fresh.jsonl").exists());
  }
}
