use super::executor::TransferCtx;
use super::Liveness;
use crate::events::EngineEvent;
use crate::model::{SegmentStatus, TransferStatus};
use futures_util::StreamExt;
use reqwest::header::RANGE;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use url::Url;

enum SegmentRun {
  Done,
  /// The transfer stopped being Downloading (pause/cancel/delete). The
  /// worker abandons the range without marking the segment either way; the
  /// owning executor observes the transfer-wide change.
  Interrupted,
}

/// Downloads one inclusive byte range into its own part file. Retries with
/// fixed backoff resume from the bytes already on disk, so the transfer's
/// `downloaded` never moves backwards.
pub(crate) async fn run_segment(
  ctx: TransferCtx,
  client: reqwest::Client,
  url: Url,
  id: String,
  index: usize,
) {
  let Some((start, end, part_path)) = ctx.registry.with_state(&id, |t| {
    let seg = &mut t.segments[index];
    seg.status = SegmentStatus::Downloading;
    (seg.start, seg.end, seg.part_path.clone())
  }) else {
    return;
  };

  let mut attempt: u32 = 0;
  loop {
    match fetch_range(&ctx, &client, &url, &id, index, start, end, &part_path).await {
      Ok(SegmentRun::Done) => {
        ctx.registry.with_state(&id, |t| {
          if t.status == TransferStatus::Downloading {
            t.segments[index].status = SegmentStatus::Completed;
          }
        });
        return;
      }
      Ok(SegmentRun::Interrupted) => return,
      Err(err) => {
        attempt += 1;
        if attempt > ctx.config.retry_count {
          ctx.registry.with_state(&id, |t| {
            let seg = &mut t.segments[index];
            seg.status = SegmentStatus::Failed;
            seg.error = Some(err.clone());
          });
          tracing::warn!(transfer_id = %id, segment = index, error = %err, "segment exhausted retries");
          return;
        }
        tracing::debug!(transfer_id = %id, segment = index, attempt, error = %err, "segment attempt failed; retrying");
        tokio::time::sleep(ctx.config.retry_delay).await;
        if !matches!(ctx.registry.liveness(&id), Liveness::Active) {
          return;
        }
      }
    }
  }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_range(
  ctx: &TransferCtx,
  client: &reqwest::Client,
  url: &Url,
  id: &str,
  index: usize,
  start: i64,
  end: i64,
  part_path: &Path,
) -> Result<SegmentRun, String> {
  // Resume from whatever earlier attempts already committed to the part.
  let Some(already) = ctx.registry.with_state(id, |t| t.segments[index].downloaded) else {
    return Ok(SegmentRun::Interrupted);
  };
  let from = start + already;
  if from > end {
    return Ok(SegmentRun::Done);
  }

  let resp = client
    .get(url.clone())
    .header(RANGE, format!("bytes={from}-{end}"))
    .send()
    .await
    .map_err(|e| e.to_string())?;
  let status = resp.status();
  if status.as_u16() != 206 {
    // A 200 here means the server ignored the range and would hand us the
    // whole body; treat it like any other bad response.
    return Err(format!("expected partial content, got HTTP {}", status.as_u16()));
  }

  let mut file = if already > 0 {
    tokio::fs::OpenOptions::new()
      .append(true)
      .open(part_path)
      .await
  } else {
    tokio::fs::File::create(part_path).await
  }
  .map_err(|e| e.to_string())?;

  let mut stream = resp.bytes_stream();
  while let Some(chunk) = stream.next().await {
    let chunk = chunk.map_err(|e| e.to_string())?;

    // Cooperative checkpoint between writes.
    if !matches!(ctx.registry.liveness(id), Liveness::Active) {
      return Ok(SegmentRun::Interrupted);
    }

    ctx.limiter.acquire(chunk.len()).await;
    file.write_all(&chunk).await.map_err(|e| e.to_string())?;

    let k = chunk.len() as i64;
    let advanced = ctx.registry.with_state(id, |t| {
      if t.status != TransferStatus::Downloading {
        return false;
      }
      let seg = &mut t.segments[index];
      seg.downloaded += k;
      t.downloaded = t.segments.iter().map(|s| s.downloaded).sum();
      t.recompute_rates();
      ctx.events.emit(EngineEvent::Progress {
        id: id.to_string(),
        downloaded: t.downloaded,
        total: t.size,
      });
      true
    });
    if !matches!(advanced, Some(true)) {
      return Ok(SegmentRun::Interrupted);
    }
  }
  file.flush().await.map_err(|e| e.to_string())?;

  let Some(done) = ctx
    .registry
    .with_state(id, |t| t.segments[index].downloaded >= end - start + 1)
  else {
    return Ok(SegmentRun::Interrupted);
  };
  if !done {
    // Clean EOF short of the range; counts as a failed attempt.
    return Err("connection closed before range completed".to_string());
  }
  Ok(SegmentRun::Done)
}
