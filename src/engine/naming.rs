use crate::error::EngineError;
use crate::model::ConflictPolicy;
use anyhow::Context;
use sanitize_filename::sanitize;
use std::path::{Path, PathBuf};
use url::Url;

/// Initial filename for a freshly submitted transfer: basename of the
/// percent-decoded URL path, or "download" when the path has none.
pub fn derive_filename(url: &Url) -> String {
  if let Some(seg) = url
    .path_segments()
    .and_then(|mut s| s.next_back())
    .filter(|s| !s.is_empty())
  {
    let s = sanitize(decode_filename_like(seg));
    if !s.is_empty() && s != "." {
      return s;
    }
  }
  "download".to_string()
}

/// Server-supplied rename discovered during the probe. Content-Disposition
/// wins; otherwise a bare "download" gains an extension guessed from the
/// Content-Type.
pub fn filename_from_probe(
  current: &str,
  content_disposition: Option<&str>,
  content_type: Option<&str>,
) -> Option<String> {
  if let Some(cd) = content_disposition {
    if let Some(n) = parse_content_disposition_filename(cd) {
      let s = sanitize(n);
      if !s.is_empty() {
        return Some(s);
      }
    }
  }

  if current == "download" {
    if let Some(ext) = content_type
      .and_then(|ct| mime_guess::get_mime_extensions_str(ct))
      .and_then(|exts| exts.first().copied())
    {
      return Some(format!("download.{ext}"));
    }
  }
  None
}

fn parse_content_disposition_filename(cd: &str) -> Option<String> {
  // Supports common forms:
  // - filename="a.txt"
  // - filename=a.txt
  // - filename*=UTF-8''a%20b.txt
  let cd = cd.trim();

  fn take_param_value(s: &str) -> &str {
    // Extract the parameter value up to the next ';' (unless that ';' occurs
    // inside quotes), so subsequent parameters like `; filename=...` are not
    // consumed by accident.
    let mut in_quotes = false;
    let mut escape = false;
    for (i, ch) in s.char_indices() {
      if escape {
        escape = false;
        continue;
      }
      match ch {
        '\\' if in_quotes => escape = true,
        '"' => in_quotes = !in_quotes,
        ';' if !in_quotes => return s[..i].trim(),
        _ => {}
      }
    }
    s.trim()
  }

  // filename*=
  if let Some(idx) = cd.to_ascii_lowercase().find("filename*=") {
    let rest = &cd[idx + "filename*=".len()..];
    let rest = take_param_value(rest.trim_start());
    // Often: UTF-8''... (RFC 5987)
    if let Some(pos) = rest.find("''") {
      let enc_value = &rest[pos + 2..];
      let enc_value = enc_value.trim().trim_matches('"');
      if let Ok(decoded) = urlencoding::decode(enc_value) {
        return Some(decoded.into_owned());
      }
    }
    let value = rest.trim().trim_matches('"');
    if !value.is_empty() {
      return Some(value.to_string());
    }
  }

  // filename=
  if let Some(idx) = cd.to_ascii_lowercase().find("filename=") {
    let mut rest = &cd[idx + "filename=".len()..];
    if let Some(semi) = rest.find(';') {
      rest = &rest[..semi];
    }
    let value = rest.trim().trim_matches('"');
    if !value.is_empty() {
      return Some(decode_filename_like(value));
    }
  }

  None
}

fn decode_filename_like(s: &str) -> String {
  // Both Content-Disposition values and URL path segments show up
  // percent-encoded in the wild; '+' misuse included.
  match urlencoding::decode(s) {
    Ok(v) => v.into_owned(),
    Err(_) => s.replace("%20", " "),
  }
}

/// What the conflict policy decided for an already-existing target.
#[derive(Debug, PartialEq, Eq)]
pub enum ConflictOutcome {
  /// Go ahead and write under this (possibly renamed) filename.
  Proceed(String),
  /// The existing file satisfies the request; no network traffic needed.
  AlreadyDone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictAction {
  Overwrite,
  Rename(String),
  Skip,
}

/// External callback for the "Always ask" policy. Returning `None` leaves
/// the conflict unresolved and fails the transfer.
pub trait ConflictResolver: Send + Sync {
  fn resolve(&self, existing: &Path) -> Option<ConflictAction>;
}

pub fn resolve_conflict(
  dir: &Path,
  filename: &str,
  policy: ConflictPolicy,
  resolver: Option<&dyn ConflictResolver>,
) -> Result<ConflictOutcome, EngineError> {
  let target = dir.join(filename);
  if !target.exists() {
    return Ok(ConflictOutcome::Proceed(filename.to_string()));
  }

  match policy {
    ConflictPolicy::SkipDownload => Ok(ConflictOutcome::AlreadyDone),
    ConflictPolicy::Overwrite => Ok(ConflictOutcome::Proceed(filename.to_string())),
    ConflictPolicy::AutoRename => {
      let renamed = choose_non_colliding_filename(dir, filename)
        .map_err(|e| EngineError::Unknown(e.to_string()))?;
      Ok(ConflictOutcome::Proceed(renamed))
    }
    ConflictPolicy::AlwaysAsk => match resolver.and_then(|r| r.resolve(&target)) {
      Some(ConflictAction::Overwrite) => Ok(ConflictOutcome::Proceed(filename.to_string())),
      Some(ConflictAction::Rename(name)) => {
        let name = sanitize(name);
        if name.is_empty() {
          return Err(EngineError::ConflictUnresolved(target.display().to_string()));
        }
        Ok(ConflictOutcome::Proceed(name))
      }
      Some(ConflictAction::Skip) => Ok(ConflictOutcome::AlreadyDone),
      None => Err(EngineError::ConflictUnresolved(target.display().to_string())),
    },
  }
}

/// Smallest counter n >= 1 such that "<base> (n)<ext>" is free.
pub fn choose_non_colliding_filename(dest_dir: &Path, desired: &str) -> anyhow::Result<String> {
  let desired = sanitize(desired);
  let desired = if desired.is_empty() { "download".to_string() } else { desired };

  let mut candidate = desired.clone();
  let mut n = 1;
  loop {
    let p = dest_dir.join(&candidate);
    if !p.exists() {
      return Ok(candidate);
    }
    candidate = append_suffix(&desired, n);
    n += 1;
    if n > 10_000 {
      anyhow::bail!("too many filename collisions");
    }
  }
}

fn append_suffix(original: &str, n: usize) -> String {
  // "file.ext" => "file (n).ext"
  // "file" => "file (n)"
  let p = PathBuf::from(original);
  let stem = p.file_stem().and_then(|s| s.to_str()).unwrap_or(original);
  let ext = p.extension().and_then(|s| s.to_str());
  if let Some(ext) = ext {
    format!("{stem} ({n}).{ext}")
  } else {
    format!("{stem} ({n})")
  }
}

pub fn ensure_dir(dest_dir: &Path) -> anyhow::Result<()> {
  std::fs::create_dir_all(dest_dir).context("failed to create destination dir")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn filename_from_url_path_basename() {
    let url = Url::parse("https://example.com/files/archive%20v2.tar.gz?x=1").unwrap();
    assert_eq!(derive_filename(&url), "archive v2.tar.gz");
  }

  #[test]
  fn filename_falls_back_to_download() {
    let url = Url::parse("https://example.com/").unwrap();
    assert_eq!(derive_filename(&url), "download");
  }

  #[test]
  fn content_disposition_filename_basic() {
    let got = filename_from_probe("x", Some(r#"attachment; filename="report.pdf""#), None);
    assert_eq!(got.as_deref(), Some("report.pdf"));
  }

  #[test]
  fn content_disposition_filename_star_does_not_consume_following_params() {
    let cd = "attachment; filename*=UTF-8''Qwen3-4B-Q5_K_M.gguf; filename=Qwen3-4B-Q5_K_M.gguf";
    let got = parse_content_disposition_filename(cd).unwrap();
    assert_eq!(got, "Qwen3-4B-Q5_K_M.gguf");
  }

  #[test]
  fn content_disposition_filename_star_percent_decodes() {
    let cd = "attachment; filename*=UTF-8''a%20b.txt; filename=a b.txt";
    let got = parse_content_disposition_filename(cd).unwrap();
    assert_eq!(got, "a b.txt");
  }

  #[test]
  fn content_type_extends_bare_download_name() {
    let got = filename_from_probe("download", None, Some("application/zip"));
    assert_eq!(got.as_deref(), Some("download.zip"));
    // an already-derived name is left alone
    assert_eq!(filename_from_probe("data.bin", None, Some("application/zip")), None);
  }

  #[test]
  fn auto_rename_walks_counters() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("out.bin"), b"x").unwrap();
    std::fs::write(dir.path().join("out (1).bin"), b"x").unwrap();

    let got = resolve_conflict(dir.path(), "out.bin", ConflictPolicy::AutoRename, None).unwrap();
    assert_eq!(got, ConflictOutcome::Proceed("out (2).bin".to_string()));
  }

  #[test]
  fn skip_policy_declares_done() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("out.bin"), b"x").unwrap();
    let got = resolve_conflict(dir.path(), "out.bin", ConflictPolicy::SkipDownload, None).unwrap();
    assert_eq!(got, ConflictOutcome::AlreadyDone);
  }

  #[test]
  fn always_ask_without_resolver_is_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("out.bin"), b"x").unwrap();
    let got = resolve_conflict(dir.path(), "out.bin", ConflictPolicy::AlwaysAsk, None);
    assert!(matches!(got, Err(EngineError::ConflictUnresolved(_))));
  }

  #[test]
  fn always_ask_honors_resolver_rename() {
    struct Renamer;
    impl ConflictResolver for Renamer {
      fn resolve(&self, _existing: &Path) -> Option<ConflictAction> {
        Some(ConflictAction::Rename("other.bin".to_string()))
      }
    }
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("out.bin"), b"x").unwrap();
    let got = resolve_conflict(dir.path(), "out.bin", ConflictPolicy::AlwaysAsk, Some(&Renamer)).unwrap();
    assert_eq!(got, ConflictOutcome::Proceed("other.bin".to_string()));
  }

  #[test]
  fn missing_target_needs_no_policy() {
    let dir = tempfile::tempdir().unwrap();
    let got = resolve_conflict(dir.path(), "new.bin", ConflictPolicy::SkipDownload, None).unwrap();
    assert_eq!(got, ConflictOutcome::Proceed("new.bin".to_string()));
  }
}
