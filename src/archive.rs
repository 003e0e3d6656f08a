//! Archive Files
//!
//! Durable exports of aged-out log events. Each sweep produces two
//! co-dated formats (row-oriented JSONL and a hierarchical JSON array)
//! bundled into one `logs_YYYY-MM-DD.tar.gz`. Every LogEvent field
//! round-trips losslessly through the bundle.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{PipelineError, PipelineResult};
use crate::model::LogEvent;

// ============================================================================
// NAMING
// ============================================================================

pub fn jsonl_name(date: NaiveDate) -> String {
    format!("logs_{}.jsonl", date)
}

pub fn json_name(date: NaiveDate) -> String {
    format!("logs_{}.json", date)
}

pub fn bundle_name(date: NaiveDate) -> String {
    format!("logs_{}.tar.gz", date)
}

/// Sweep date parsed back out of a bundle file name.
fn bundle_date(file_name: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix("logs_")?
        .strip_suffix(".tar.gz")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

// ============================================================================
// EXPORT
// ============================================================================

/// Row-oriented export: one JSON document per line.
pub fn export_jsonl(events: &[LogEvent], path: &Path) -> PipelineResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    for event in events {
        serde_json::to_writer(&mut writer, event)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Hierarchical export: one pretty-printed array.
pub fn export_json(events: &[LogEvent], path: &Path) -> PipelineResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, events)?;
    writer.flush()?;
    Ok(())
}

/// Write both exports for one sweep and bundle them into a dated tar.gz,
/// removing the intermediate files once the bundle exists. The bundle is
/// created with a plain truncating create, so a retried sweep on the same
/// date overwrites it in place.
pub fn write_bundle(
    events: &[LogEvent],
    archive_dir: &Path,
    date: NaiveDate,
) -> PipelineResult<PathBuf> {
    std::fs::create_dir_all(archive_dir)?;

    let jsonl_path = archive_dir.join(jsonl_name(date));
    let json_path = archive_dir.join(json_name(date));
    export_jsonl(events, &jsonl_path)?;
    export_json(events, &json_path)?;

    let bundle_path = archive_dir.join(bundle_name(date));
    let result = build_tarball(&bundle_path, &[&jsonl_path, &json_path]);

    // The intermediates go away whether bundling worked or not; on
    // failure a half-written bundle must not sit next to stale exports.
    let _ = std::fs::remove_file(&jsonl_path);
    let _ = std::fs::remove_file(&json_path);
    if result.is_err() {
        let _ = std::fs::remove_file(&bundle_path);
    }

    result?;
    Ok(bundle_path)
}

fn build_tarball(bundle_path: &Path, members: &[&Path]) -> PipelineResult<()> {
    let file = File::create(bundle_path)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for member in members {
        let name = member
            .file_name()
            .ok_or_else(|| PipelineError::Archive(format!("bad member path {:?}", member)))?;
        builder.append_path_with_name(member, name)?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| PipelineError::Archive(format!("finalizing bundle: {}", e)))?;
    encoder
        .finish()?
        .flush()
        .map_err(|e| PipelineError::Archive(format!("flushing bundle: {}", e)))?;
    Ok(())
}

// ============================================================================
// READ BACK
// ============================================================================

/// Restore the events from a bundle via its JSONL member.
pub fn read_bundle(bundle_path: &Path) -> PipelineResult<Vec<LogEvent>> {
    let file = File::open(bundle_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    for entry in archive.entries()? {
        let entry = entry?;
        let is_jsonl = entry
            .path()?
            .extension()
            .map(|e| e == "jsonl")
            .unwrap_or(false);
        if !is_jsonl {
            continue;
        }

        let mut events = Vec::new();
        for line in BufReader::new(entry).lines() {
            let line = line?;
            if !line.is_empty() {
                events.push(serde_json::from_str::<LogEvent>(&line)?);
            }
        }
        return Ok(events);
    }

    Err(PipelineError::Archive(format!(
        "no JSONL member in {:?}",
        bundle_path
    )))
}

// ============================================================================
// PRUNE
// ============================================================================

/// Delete bundles whose sweep date is older than the retention horizon.
/// Returns how many were removed. Files that do not match the bundle
/// naming scheme are left alone.
pub fn prune_old_bundles(
    archive_dir: &Path,
    retention_days: i64,
    now: DateTime<Utc>,
) -> PipelineResult<usize> {
    if !archive_dir.is_dir() {
        return Ok(0);
    }

    let horizon = now.date_naive() - chrono::Duration::days(retention_days);
    let mut pruned = 0;

    for entry in std::fs::read_dir(archive_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(date) = name.to_str().and_then(bundle_date) else {
            continue;
        };
        if date < horizon {
            std::fs::remove_file(entry.path())?;
            log::info!("pruned archive bundle {:?}", entry.path());
            pruned += 1;
        }
    }

    Ok(pruned)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LogType, Severity};
    use chrono::Duration;
    use tempfile::TempDir;

    fn events() -> Vec<LogEvent> {
        vec![
            LogEvent {
                id: 1,
                timestamp: Utc::now() - Duration::days(10),
                endpoint_id: "ep-1".to_string(),
                log_type: LogType::Auth,
                source: "host-a".to_string(),
                severity: Severity::High,
                message: "Login failed, with \"quotes\"\nand a newline".to_string(),
                raw_data: Some(r#"{"src_ip": "10.0.0.1"}"#.to_string()),
            },
            LogEvent {
                id: 2,
                timestamp: Utc::now() - Duration::days(9),
                endpoint_id: "ep-2".to_string(),
                log_type: LogType::Other("custom_feed".to_string()),
                source: "host-b".to_string(),
                severity: Severity::Low,
                message: "routine entry".to_string(),
                raw_data: None,
            },
        ]
    }

    #[test]
    fn test_bundle_round_trip_is_lossless() {
        let dir = TempDir::new().unwrap();
        let original = events();
        let date = Utc::now().date_naive();

        let bundle = write_bundle(&original, dir.path(), date).unwrap();
        let restored = read_bundle(&bundle).unwrap();
        assert_eq!(restored, original);
    }

    #[test]
    fn test_intermediates_removed_after_bundling() {
        let dir = TempDir::new().unwrap();
        let date = Utc::now().date_naive();
        write_bundle(&events(), dir.path(), date).unwrap();

        assert!(!dir.path().join(jsonl_name(date)).exists());
        assert!(!dir.path().join(json_name(date)).exists());
        assert!(dir.path().join(bundle_name(date)).exists());
    }

    #[test]
    fn test_bundle_overwrite_on_same_date() {
        let dir = TempDir::new().unwrap();
        let date = Utc::now().date_naive();
        write_bundle(&events(), dir.path(), date).unwrap();
        let bundle = write_bundle(&events()[..1].to_vec(), dir.path(), date).unwrap();

        let restored = read_bundle(&bundle).unwrap();
        assert_eq!(restored.len(), 1);
    }

    #[test]
    fn test_prune_respects_horizon_and_naming() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let old_date = (now - Duration::days(45)).date_naive();
        let fresh_date = now.date_naive();

        write_bundle(&events(), dir.path(), old_date).unwrap();
        write_bundle(&events(), dir.path(), fresh_date).unwrap();
        std::fs::write(dir.path().join("unrelated.tar.gz"), b"keep me").unwrap();

        let pruned = prune_old_bundles(dir.path(), 30, now).unwrap();
        assert_eq!(pruned, 1);
        assert!(!dir.path().join(bundle_name(old_date)).exists());
        assert!(dir.path().join(bundle_name(fresh_date)).exists());
        assert!(dir.path().join("unrelated.tar.gz").exists());
    }

    #[test]
    fn test_prune_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert_eq!(prune_old_bundles(&missing, 30, Utc::now()).unwrap(), 0);
    }
}
