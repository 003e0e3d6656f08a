//! Retention and Archival
//!
//! Periodic sweep that moves aged-out log events into dated archive
//! bundles, deletes them from the live store, and prunes bundles past
//! their own retention horizon. Cycles are strictly serialized on a
//! single background thread; export must succeed before anything is
//! deleted, so a partial failure never silently loses data.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sysinfo::Disks;

use crate::archive;
use crate::config::Config;
use crate::error::PipelineResult;
use crate::store::Store;

const BYTES_PER_GB: u64 = 1_000_000_000;

// ============================================================================
// SETTINGS / REPORT
// ============================================================================

/// Knobs for one retention cycle.
#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub archive_dir: PathBuf,
    pub db_retention_days: i64,
    pub archive_retention_days: i64,
    pub min_free_disk_gb: u64,
}

impl RetentionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            archive_dir: config.archive_dir.clone(),
            db_retention_days: config.db_retention_days,
            archive_retention_days: config.archive_retention_days,
            min_free_disk_gb: config.min_free_disk_gb,
        }
    }
}

/// What one cycle actually did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    /// Cycle skipped outright because free space was below the floor.
    pub skipped_low_disk: bool,
    /// Events selected for archival.
    pub selected: usize,
    /// Bundle written this cycle, if any events were selected.
    pub bundle: Option<PathBuf>,
    /// Events deleted from the live store.
    pub deleted: usize,
    /// Old bundles pruned from the archive directory.
    pub pruned: usize,
}

// ============================================================================
// CYCLE
// ============================================================================

/// Run one cycle with an explicit clock and disk reading. Deterministic
/// core of [`run_cycle`].
///
/// Order matters: the bundle must exist on disk before any row is
/// deleted, and the deletion re-applies the same cutoff so events that
/// arrived mid-cycle survive.
pub fn run_cycle_at(
    store: &Store,
    settings: &RetentionSettings,
    now: DateTime<Utc>,
    free_disk_gb: Option<u64>,
) -> PipelineResult<CycleReport> {
    let mut report = CycleReport::default();

    if let Some(free) = free_disk_gb {
        if free < settings.min_free_disk_gb {
            log::warn!(
                "skipping retention cycle: {} GB free on archive volume, floor is {} GB",
                free,
                settings.min_free_disk_gb
            );
            report.skipped_low_disk = true;
            return Ok(report);
        }
    }

    let cutoff = now - Duration::days(settings.db_retention_days);
    let events = store.events_older_than(cutoff)?;
    report.selected = events.len();

    if !events.is_empty() {
        let bundle = archive::write_bundle(&events, &settings.archive_dir, now.date_naive())?;
        log::info!(
            "archived {} events older than {} into {:?}",
            events.len(),
            cutoff.to_rfc3339(),
            bundle
        );
        report.bundle = Some(bundle);
        report.deleted = store.delete_older_than(cutoff)?;
    }

    report.pruned =
        archive::prune_old_bundles(&settings.archive_dir, settings.archive_retention_days, now)?;

    Ok(report)
}

/// Run one cycle against the real clock and the real disk.
pub fn run_cycle(store: &Store, settings: &RetentionSettings) -> PipelineResult<CycleReport> {
    let free = free_disk_gb(settings);
    run_cycle_at(store, settings, Utc::now(), free)
}

/// Free space on the volume holding the archive directory, in whole GB.
/// `None` when no mounted disk matches; the guard then stands aside.
fn free_disk_gb(settings: &RetentionSettings) -> Option<u64> {
    let target = std::fs::canonicalize(&settings.archive_dir)
        .unwrap_or_else(|_| settings.archive_dir.clone());

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() / BYTES_PER_GB)
}

// ============================================================================
// SCHEDULER
// ============================================================================

/// Spawn the retention thread. One cycle per tick, back to back; a
/// failed cycle is logged and the next tick retries from scratch.
pub fn start(store: Arc<Store>, settings: RetentionSettings, interval: StdDuration) {
    let spawned = thread::Builder::new()
        .name("retention".to_string())
        .spawn(move || loop {
            match run_cycle(&store, &settings) {
                Ok(report) if report.skipped_low_disk => {}
                Ok(report) => {
                    if report.selected > 0 || report.pruned > 0 {
                        log::info!(
                            "retention cycle: selected={} deleted={} pruned={}",
                            report.selected,
                            report.deleted,
                            report.pruned
                        );
                    }
                }
                Err(e) => log::error!("retention cycle failed: {}", e),
            }
            thread::sleep(interval);
        });

    // A daemon without its retention thread must be visible in the log.
    if let Err(e) = spawned {
        log::error!("failed to spawn retention thread: {}", e);
    }
}

// ============================================================================
// TESTS
// ============================================================================
