use std::path::{Path, PathBuf};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
  Waiting,
  Downloading,
  Paused,
  Completed,
  Failed,
  Canceled,
}

impl TransferStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Canceled
    )
  }
}

/// The legal status transitions. Everything the engine commits goes through
/// this table; tests assert observed histories stay inside it.
pub fn transition_allowed(from: TransferStatus, to: TransferStatus) -> bool {
  use TransferStatus::*;
  matches!(
    (from, to),
    (Waiting, Downloading)
      | (Downloading, Paused)
      | (Paused, Waiting)
      | (Waiting, Canceled)
      | (Downloading, Canceled)
      | (Paused, Canceled)
      | (Downloading, Completed)
      | (Downloading, Failed)
  )
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub enum PrivacyMode {
  #[default]
  Normal,
  Proxy,
  Relay,
}

/// What to do when the target file already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
  SkipDownload,
  Overwrite,
  AutoRename,
  AlwaysAsk,
}

impl ConflictPolicy {
  /// Parses the `file_conflict` setting. Unknown values fall back to auto
  /// rename, the stock default.
  pub fn from_setting(value: &str) -> Self {
    match value.trim() {
      "Skip download" => ConflictPolicy::SkipDownload,
      "Overwrite" => ConflictPolicy::Overwrite,
      "Always ask" => ConflictPolicy::AlwaysAsk,
      _ => ConflictPolicy::AutoRename,
    }
  }
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
  Waiting,
  Downloading,
  Completed,
  Failed,
}

/// One contiguous byte range of a transfer. Ranges are inclusive on both
/// ends, matching HTTP `Range` semantics.
#[derive(Debug, Clone)]
pub struct Segment {
  pub index: usize,
  pub start: i64,
  pub end: i64,
  pub part_path: PathBuf,
  pub downloaded: i64,
  pub status: SegmentStatus,
  pub error: Option<String>,
}

impl Segment {
  pub fn len(&self) -> i64 {
    self.end - self.start + 1
  }
}

/// The in-memory transfer record. Mutable fields are only ever touched while
/// holding the registry entry lock that wraps this struct.
#[derive(Debug)]
pub struct Transfer {
  pub id: String,
  pub url: String,
  pub target_dir: PathBuf,
  pub filename: String,
  pub privacy_mode: PrivacyMode,
  pub expected_sha256: Option<String>,
  // -1 means unknown
  pub size: i64,
  pub downloaded: i64,
  pub speed: f64,
  pub eta: f64,
  pub status: TransferStatus,
  pub error: Option<String>,
  pub segments: Vec<Segment>,
  pub single_part_path: Option<PathBuf>,
  pub started_at: Option<Instant>,
  pub created_at: String,
}

impl Transfer {
  pub fn target_path(&self) -> PathBuf {
    self.target_dir.join(&self.filename)
  }

  /// Recomputes `speed` and `eta` from the monotonic start mark. `eta` stays
  /// -1 unless both the total size and a positive rate are known.
  pub fn recompute_rates(&mut self) {
    let elapsed = match self.started_at {
      Some(t) => t.elapsed().as_secs_f64(),
      None => 0.0,
    };
    if elapsed > 0.0 {
      self.speed = self.downloaded as f64 / elapsed;
    } else {
      self.speed = 0.0;
    }
    if self.size > 0 && self.speed > 0.0 {
      self.eta = (self.size - self.downloaded) as f64 / self.speed;
    } else {
      self.eta = -1.0;
    }
  }

  pub fn snapshot(&self) -> TransferSnapshot {
    TransferSnapshot {
      id: self.id.clone(),
      url: self.url.clone(),
      target_dir: self.target_dir.display().to_string(),
      filename: self.filename.clone(),
      privacy_mode: self.privacy_mode,
      size: self.size,
      downloaded: self.downloaded,
      speed: self.speed,
      eta: self.eta,
      status: self.status,
      error: self.error.clone(),
      segments: self.segments.iter().map(segment_snapshot).collect(),
      created_at: self.created_at.clone(),
    }
  }
}

fn segment_snapshot(seg: &Segment) -> SegmentSnapshot {
  SegmentSnapshot {
    index: seg.index,
    start: seg.start,
    end: seg.end,
    downloaded: seg.downloaded,
    status: seg.status,
    error: seg.error.clone(),
  }
}

/// Point-in-time copy handed to observers; the live record stays behind the
/// registry lock.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TransferSnapshot {
  pub id: String,
  pub url: String,
  pub target_dir: String,
  pub filename: String,
  pub privacy_mode: PrivacyMode,
  pub size: i64,
  pub downloaded: i64,
  pub speed: f64,
  pub eta: f64,
  pub status: TransferStatus,
  pub error: Option<String>,
  pub segments: Vec<SegmentSnapshot>,
  pub created_at: String,
}

impl TransferSnapshot {
  pub fn target_path(&self) -> PathBuf {
    Path::new(&self.target_dir).join(&self.filename)
  }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SegmentSnapshot {
  pub index: usize,
  pub start: i64,
  pub end: i64,
  pub downloaded: i64,
  pub status: SegmentStatus,
  pub error: Option<String>,
}

pub fn now_rfc3339() -> String {
  time::OffsetDateTime::now_utc()
    .format(&time::format_description::well_known::Rfc3339)
    .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn conflict_policy_parses_setting_strings() {
    assert_eq!(ConflictPolicy::from_setting("Skip download"), ConflictPolicy::SkipDownload);
    assert_eq!(ConflictPolicy::from_setting("Overwrite"), ConflictPolicy::Overwrite);
    assert_eq!(ConflictPolicy::from_setting("Always ask"), ConflictPolicy::AlwaysAsk);
    assert_eq!(ConflictPolicy::from_setting("Auto rename"), ConflictPolicy::AutoRename);
    assert_eq!(ConflictPolicy::from_setting("bogus"), ConflictPolicy::AutoRename);
  }

  #[test]
  fn terminal_statuses_accept_no_transitions() {
    use TransferStatus::*;
    for from in [Completed, Failed, Canceled] {
      for to in [Waiting, Downloading, Paused, Completed, Failed, Canceled] {
        assert!(!transition_allowed(from, to), "{from:?} -> {to:?} must be illegal");
      }
    }
  }

  #[test]
  fn pause_resume_cycle_is_legal() {
    use TransferStatus::*;
    assert!(transition_allowed(Waiting, Downloading));
    assert!(transition_allowed(Downloading, Paused));
    assert!(transition_allowed(Paused, Waiting));
    assert!(!transition_allowed(Paused, Downloading));
  }

  #[test]
  fn eta_requires_known_size_and_positive_speed() {
    let mut t = Transfer {
      id: "t".into(),
      url: "http://example.com/a".into(),
      target_dir: PathBuf::from("/tmp"),
      filename: "a".into(),
      privacy_mode: PrivacyMode::Normal,
      expected_sha256: None,
      size: -1,
      downloaded: 0,
      speed: 0.0,
      eta: -1.0,
      status: TransferStatus::Waiting,
      error: None,
      segments: Vec::new(),
      single_part_path: None,
      started_at: None,
      created_at: now_rfc3339(),
    };
    t.recompute_rates();
    assert_eq!(t.speed, 0.0);
    assert_eq!(t.eta, -1.0);
  }

  #[test]
  fn segment_len_is_inclusive() {
    let seg = Segment {
      index: 0,
      start: 0,
      end: 24_999,
      part_path: PathBuf::from("/tmp/x.part0"),
      downloaded: 0,
      status: SegmentStatus::Waiting,
      error: None,
    };
    assert_eq!(seg.len(), 25_000);
  }
}
