//! Sentinel Core - Daemon Entry Point
//!
//! Reads newline-delimited JSON collector records from stdin, feeds them
//! through the ingestion pipeline, and runs the retention scheduler in
//! the background. Exits when the input stream closes.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use sentinel_core::config::Config;
use sentinel_core::model::IncomingRecord;
use sentinel_core::notify::Notifier;
use sentinel_core::pipeline::Pipeline;
use sentinel_core::retention::{self, RetentionSettings};
use sentinel_core::store::Store;
use sentinel_core::PipelineResult;

fn main() -> PipelineResult<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    log::info!(
        "starting sentinel-core (db={:?}, archive={:?}, retention={}d)",
        config.database_path,
        config.archive_dir,
        config.db_retention_days
    );

    let store = Arc::new(Store::open(&config.database_path)?);
    let notifier = Arc::new(Notifier::new());
    let pipeline = Pipeline::from_config(&config, Arc::clone(&store), notifier);

    retention::start(
        store,
        RetentionSettings::from_config(&config),
        Duration::from_secs(config.archive_interval_secs),
    );

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<IncomingRecord>(&line) {
            Ok(record) => {
                if let Err(e) = pipeline.ingest(&record) {
                    log::error!("ingest failed for {}: {}", record.endpoint_id, e);
                }
            }
            Err(e) => log::warn!("skipping malformed record: {}", e),
        }
    }

    log::info!("input stream closed, shutting down");
    Ok(())
}
