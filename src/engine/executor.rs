use super::bandwidth::BandwidthLimiter;
use super::naming::{self, ConflictOutcome, ConflictResolver};
use super::segment;
use super::{Liveness, TransferRegistry};
use crate::error::EngineError;
use crate::events::{EngineEvent, EventHub};
use crate::model::{Segment, SegmentStatus, TransferStatus};
use crate::postprocess::{self, ArchiveExtractor, HashVerifier};
use crate::settings::EngineConfig;
use crate::transport::Transport;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use url::Url;

/// Everything a transfer run (and its segment workers) needs. Cheap to
/// clone; each segment task carries its own copy.
#[derive(Clone)]
pub(crate) struct TransferCtx {
  pub registry: TransferRegistry,
  pub events: EventHub,
  pub config: Arc<EngineConfig>,
  pub transport: Transport,
  pub limiter: BandwidthLimiter,
  pub verifier: Option<Arc<dyn HashVerifier>>,
  pub extractor: Option<Arc<dyn ArchiveExtractor>>,
  pub resolver: Option<Arc<dyn ConflictResolver>>,
}

pub(crate) enum Outcome {
  /// `run_hooks` is false when an existing file satisfied the request
  /// (Skip-download conflict policy); post-processing only runs on files
  /// this run actually produced.
  Completed { run_hooks: bool },
  /// Paused, canceled, or deleted out from under us. Status is owned by
  /// whoever made that change; the executor just stops.
  Interrupted,
  Failed(EngineError),
}

struct ProbeResult {
  final_url: Url,
  size: i64,
  supports_ranges: bool,
  content_disposition: Option<String>,
  content_type: Option<String>,
}

/// Drives a single transfer from dispatch to terminal: probe, conflict
/// resolution, strategy selection, transfer, assembly.
pub(crate) async fn run_transfer(ctx: &TransferCtx, id: &str) -> Outcome {
  // Fresh run: a resumed transfer restarts from scratch (no cross-run
  // resume), so accounting resets here.
  let Some((url_str, mode)) = ctx.registry.with_state(id, |t| {
    t.downloaded = 0;
    t.speed = 0.0;
    t.eta = -1.0;
    t.error = None;
    t.segments.clear();
    t.single_part_path = None;
    t.started_at = Some(Instant::now());
    (t.url.clone(), t.privacy_mode)
  }) else {
    return Outcome::Interrupted;
  };

  let client = match ctx.transport.client_for(mode) {
    Ok(c) => c,
    Err(e) => return Outcome::Failed(e),
  };
  let url = match Url::parse(&url_str) {
    Ok(u) => u,
    Err(e) => return Outcome::Failed(EngineError::InvalidUrl(e.to_string())),
  };

  let probe = match probe(&client, url).await {
    Ok(p) => p,
    Err(e) => return Outcome::Failed(e),
  };

  let Some((target_dir, filename)) = ctx.registry.with_state(id, |t| {
    t.url = probe.final_url.to_string();
    t.size = probe.size;
    if let Some(name) = naming::filename_from_probe(
      &t.filename,
      probe.content_disposition.as_deref(),
      probe.content_type.as_deref(),
    ) {
      t.filename = name;
    }
    (t.target_dir.clone(), t.filename.clone())
  }) else {
    return Outcome::Interrupted;
  };

  match naming::resolve_conflict(
    &target_dir,
    &filename,
    ctx.config.file_conflict,
    ctx.resolver.as_deref(),
  ) {
    Ok(ConflictOutcome::AlreadyDone) => return Outcome::Completed { run_hooks: false },
    Ok(ConflictOutcome::Proceed(name)) => {
      if name != filename && ctx.registry.with_state(id, |t| t.filename = name).is_none() {
        return Outcome::Interrupted;
      }
    }
    Err(e) => return Outcome::Failed(e),
  }

  if let Err(e) = naming::ensure_dir(&target_dir) {
    return Outcome::Failed(EngineError::Unknown(e.to_string()));
  }

  let Some(target_path) = ctx.registry.with_state(id, |t| t.target_path()) else {
    return Outcome::Interrupted;
  };

  let segmented = probe.supports_ranges
    && ctx.config.chunk_enabled
    && ctx.config.chunk_min_size > 0
    && probe.size >= ctx.config.chunk_min_size;

  if segmented {
    download_segmented(ctx, id, &client, &probe.final_url, &target_path, probe.size).await
  } else {
    download_single(ctx, id, &client, &probe.final_url, &target_path, probe.size).await
  }
}

/// HEAD with redirects followed: discovers the final URL, total size, range
/// support, and any server-supplied filename.
async fn probe(client: &reqwest::Client, url: Url) -> Result<ProbeResult, EngineError> {
  let resp = client
    .head(url)
    .send()
    .await
    .map_err(|e| EngineError::ProbeFailed(e.to_string()))?;
  let status = resp.status();
  if status.is_client_error() || status.is_server_error() {
    return Err(EngineError::ProbeFailed(format!("HTTP {}", status.as_u16())));
  }

  let headers = resp.headers();
  let size = headers
    .get(reqwest::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok())
    .and_then(|s| s.parse::<i64>().ok())
    .unwrap_or(-1);
  let supports_ranges = headers
    .get(reqwest::header::ACCEPT_RANGES)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_ascii_lowercase().contains("bytes"))
    .unwrap_or(false);
  let content_disposition = headers
    .get(reqwest::header::CONTENT_DISPOSITION)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_string());
  let content_type = headers
    .get(reqwest::header::CONTENT_TYPE)
    .and_then(|v| v.to_str().ok())
    .map(|s| s.to_string());

  Ok(ProbeResult {
    final_url: resp.url().clone(),
    size,
    supports_ranges,
    content_disposition,
    content_type,
  })
}

enum StreamRun {
  Done,
  Interrupted,
}

async fn download_single(
  ctx: &TransferCtx,
  id: &str,
  client: &reqwest::Client,
  url: &Url,
  target_path: &Path,
  size: i64,
) -> Outcome {
  let part_path = PathBuf::from(format!("{}.part", target_path.display()));
  if ctx
    .registry
    .with_state(id, |t| t.single_part_path = Some(part_path.clone()))
    .is_none()
  {
    return Outcome::Interrupted;
  }

  let mut attempt: u32 = 0;
  loop {
    match single_attempt(ctx, id, client, url, &part_path, size).await {
      Ok(StreamRun::Done) => break,
      Ok(StreamRun::Interrupted) => {
        return interrupted_cleanup(ctx, id, std::slice::from_ref(&part_path));
      }
      Err(err) => {
        attempt += 1;
        if attempt > ctx.config.retry_count {
          let _ = std::fs::remove_file(&part_path);
          return Outcome::Failed(EngineError::Unknown(err));
        }
        tracing::warn!(transfer_id = %id, attempt, error = %err, "download attempt failed; retrying");
        tokio::time::sleep(ctx.config.retry_delay).await;
        match ctx.registry.liveness(id) {
          Liveness::Active => {}
          _ => return interrupted_cleanup(ctx, id, std::slice::from_ref(&part_path)),
        }
      }
    }
  }

  if let Err(e) = tokio::fs::rename(&part_path, target_path).await {
    let _ = std::fs::remove_file(&part_path);
    return Outcome::Failed(EngineError::Unknown(format!(
      "failed to move part into place: {e}"
    )));
  }
  Outcome::Completed { run_hooks: true }
}

async fn single_attempt(
  ctx: &TransferCtx,
  id: &str,
  client: &reqwest::Client,
  url: &Url,
  part_path: &Path,
  size: i64,
) -> Result<StreamRun, String> {
  let resp = client.get(url.clone()).send().await.map_err(|e| e.to_string())?;
  let status = resp.status();
  if !status.is_success() {
    return Err(format!("HTTP {}", status.as_u16()));
  }

  // Each attempt rewrites the part from scratch; without range support a
  // partial body cannot be resumed.
  let mut file = tokio::fs::File::create(part_path).await.map_err(|e| e.to_string())?;
  if ctx
    .registry
    .with_state(id, |t| {
      t.downloaded = 0;
      t.recompute_rates();
    })
    .is_none()
  {
    return Ok(StreamRun::Interrupted);
  }

  let mut stream = resp.bytes_stream();
  while let Some(chunk) = stream.next().await {
    let chunk = chunk.map_err(|e| e.to_string())?;

    // Cooperative checkpoint between writes.
    if !matches!(ctx.registry.liveness(id), Liveness::Active) {
      return Ok(StreamRun::Interrupted);
    }

    ctx.limiter.acquire(chunk.len()).await;
    file.write_all(&chunk).await.map_err(|e| e.to_string())?;

    let k = chunk.len() as i64;
    let advanced = ctx.registry.with_state(id, |t| {
      if t.status != TransferStatus::Downloading {
        return false;
      }
      t.downloaded += k;
      t.recompute_rates();
      ctx.events.emit(EngineEvent::Progress {
        id: id.to_string(),
        downloaded: t.downloaded,
        total: t.size,
      });
      true
    });
    if !matches!(advanced, Some(true)) {
      return Ok(StreamRun::Interrupted);
    }
  }
  file.flush().await.map_err(|e| e.to_string())?;

  if size >= 0 {
    let got = ctx.registry.with_state(id, |t| t.downloaded).unwrap_or(-1);
    if got >= 0 && got != size {
      return Err(format!("length mismatch: got {got}, expected {size}"));
    }
  }
  Ok(StreamRun::Done)
}

async fn download_segmented(
  ctx: &TransferCtx,
  id: &str,
  client: &reqwest::Client,
  url: &Url,
  target_path: &Path,
  size: i64,
) -> Outcome {
  let segments = plan_segments(size, ctx.config.chunk_count, target_path);
  let part_paths: Vec<PathBuf> = segments.iter().map(|s| s.part_path.clone()).collect();
  if ctx
    .registry
    .with_state(id, |t| t.segments = segments)
    .is_none()
  {
    return Outcome::Interrupted;
  }

  let mut handles = Vec::with_capacity(part_paths.len());
  for index in 0..part_paths.len() {
    let ctx = ctx.clone();
    let client = client.clone();
    let url = url.clone();
    let id = id.to_string();
    handles.push(tokio::spawn(async move {
      segment::run_segment(ctx, client, url, id, index).await;
    }));
  }
  for h in handles {
    let _ = h.await;
  }

  // A transfer-wide stop wins over per-segment bookkeeping.
  match ctx.registry.liveness(id) {
    Liveness::Active => {}
    _ => return interrupted_cleanup(ctx, id, &part_paths),
  }

  let failed = ctx.registry.with_state(id, |t| {
    t.segments
      .iter()
      .find(|s| s.status != SegmentStatus::Completed)
      .map(|s| (s.index, s.error.clone()))
  });
  match failed {
    None => return interrupted_cleanup(ctx, id, &part_paths),
    Some(Some((index, error))) => {
      remove_files(&part_paths);
      return Outcome::Failed(EngineError::SegmentFailed {
        index,
        reason: error.unwrap_or_else(|| "segment did not complete".to_string()),
      });
    }
    Some(None) => {}
  }

  if let Err(e) = assemble_parts(target_path, &part_paths).await {
    remove_files(&part_paths);
    let _ = std::fs::remove_file(target_path);
    return Outcome::Failed(EngineError::AssemblyFailed(e.to_string()));
  }
  remove_files(&part_paths);
  Outcome::Completed { run_hooks: true }
}

/// `size / count` wide ranges, the last absorbing the remainder. `size` is
/// known positive here (the segmentation gate requires it).
fn plan_segments(size: i64, count: usize, target_path: &Path) -> Vec<Segment> {
  let count = count.clamp(1, size.max(1) as usize);
  let width = size / count as i64;

  let mut segments = Vec::with_capacity(count);
  for index in 0..count {
    let start = index as i64 * width;
    let end = if index == count - 1 { size - 1 } else { start + width - 1 };
    segments.push(Segment {
      index,
      start,
      end,
      part_path: PathBuf::from(format!("{}.part{}", target_path.display(), index)),
      downloaded: 0,
      status: SegmentStatus::Waiting,
      error: None,
    });
  }
  segments
}

/// Streaming concatenation of part files, in index order, into the final
/// target.
async fn assemble_parts(target: &Path, parts: &[PathBuf]) -> anyhow::Result<u64> {
  let mut out = tokio::fs::OpenOptions::new()
    .create(true)
    .write(true)
    .truncate(true)
    .open(target)
    .await?;
  let mut total = 0u64;
  for part in parts {
    let mut f = tokio::fs::File::open(part).await?;
    total += tokio::io::copy(&mut f, &mut out).await?;
  }
  out.flush().await?;
  Ok(total)
}

/// Interrupted runs keep their parts only across a pause (the next run
/// truncates them); cancel and delete must not leave part files behind.
fn interrupted_cleanup(ctx: &TransferCtx, id: &str, parts: &[PathBuf]) -> Outcome {
  if !matches!(ctx.registry.liveness(id), Liveness::Paused) {
    remove_files(parts);
  }
  Outcome::Interrupted
}

fn remove_files(paths: &[PathBuf]) {
  for p in paths {
    let _ = std::fs::remove_file(p);
  }
}

/// Runs after `Completed` is committed and reported; failures surface as
/// warning events, never as transfer failures.
pub(crate) async fn post_process(ctx: &TransferCtx, id: &str, path: &Path) {
  let expected = ctx
    .registry
    .with_state(id, |t| t.expected_sha256.clone())
    .flatten();

  if ctx.config.verify_hash {
    if let (Some(expected), Some(verifier)) = (expected, ctx.verifier.clone()) {
      let file = path.to_path_buf();
      let verdict = tokio::task::spawn_blocking(move || verifier.verify(&file, &expected)).await;
      let warning = match verdict {
        Ok(Ok(true)) => None,
        Ok(Ok(false)) => Some("checksum mismatch".to_string()),
        Ok(Err(e)) => Some(format!("checksum verification failed: {e}")),
        Err(e) => Some(format!("checksum verification panicked: {e}")),
      };
      if let Some(message) = warning {
        tracing::warn!(transfer_id = %id, %message, "post-process");
        ctx.events.emit(EngineEvent::PostProcessWarning { id: id.to_string(), message });
      }
    }
  }

  if ctx.config.auto_extract && postprocess::is_archive(path) {
    if let Some(extractor) = ctx.extractor.clone() {
      let archive = path.to_path_buf();
      let dest = path.parent().unwrap_or(Path::new(".")).to_path_buf();
      let result = tokio::task::spawn_blocking(move || extractor.extract(&archive, &dest)).await;
      let warning = match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(format!("extraction failed: {e}")),
        Err(e) => Some(format!("extraction panicked: {e}")),
      };
      if let Some(message) = warning {
        tracing::warn!(transfer_id = %id, %message, "post-process");
        ctx.events.emit(EngineEvent::PostProcessWarning { id: id.to_string(), message });
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn segments_partition_evenly_with_remainder_in_last() {
    let segs = plan_segments(100_000, 4, Path::new("/tmp/out.bin"));
    assert_eq!(segs.len(), 4);
    assert_eq!((segs[0].start, segs[0].end), (0, 24_999));
    assert_eq!((segs[1].start, segs[1].end), (25_000, 49_999));
    assert_eq!((segs[2].start, segs[2].end), (50_000, 74_999));
    assert_eq!((segs[3].start, segs[3].end), (75_000, 99_999));
  }

  #[test]
  fn last_segment_absorbs_remainder() {
    let segs = plan_segments(1003, 4, Path::new("/tmp/out.bin"));
    assert_eq!(segs.len(), 4);
    // 1003 / 4 = 250 per segment; the last takes 253.
    assert_eq!((segs[0].start, segs[0].end), (0, 249));
    assert_eq!((segs[3].start, segs[3].end), (750, 1002));
    let total: i64 = segs.iter().map(Segment::len).sum();
    assert_eq!(total, 1003);
  }

  #[test]
  fn ranges_are_contiguous_and_disjoint() {
    let segs = plan_segments(7_777_777, 6, Path::new("/tmp/big"));
    for pair in segs.windows(2) {
      assert_eq!(pair[1].start, pair[0].end + 1);
    }
    assert_eq!(segs.first().unwrap().start, 0);
    assert_eq!(segs.last().unwrap().end, 7_777_776);
  }

  #[test]
  fn tiny_sizes_cannot_outnumber_bytes() {
    let segs = plan_segments(3, 8, Path::new("/tmp/tiny"));
    assert_eq!(segs.len(), 3);
    let total: i64 = segs.iter().map(Segment::len).sum();
    assert_eq!(total, 3);
  }

  #[test]
  fn part_paths_are_indexed_siblings() {
    let segs = plan_segments(100, 2, Path::new("/data/out.bin"));
    assert_eq!(segs[0].part_path, Path::new("/data/out.bin.part0"));
    assert_eq!(segs[1].part_path, Path::new("/data/out.bin.part1"));
  }
}
