//! `TradeLogger`: appends one JSON-Lines record per terminal execution
//! to a daily-rotated file, the way `price_logger.rs` rotates its CSV
//! output — except line-delimited JSON instead of CSV, since spec.md
//! §6 calls for "one record per terminal trade in a line-delimited
//! structured format" with "all decimals serialised as strings" (which
//! `rust_decimal::Decimal`'s `Serialize` impl already does).

use crate::types::CompletedArbitrageLog;
use chrono::{NaiveDate, Utc};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

pub struct TradeLogger {
    log_dir: PathBuf,
    current_date: Option<NaiveDate>,
    file: Option<File>,
}

impl TradeLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let log_dir = log_dir.into();
        if let Err(e) = fs::create_dir_all(&log_dir) {
            warn!(dir = %log_dir.display(), error = %e, "failed to create trade log directory");
        }
        Self { log_dir, current_date: None, file: None }
    }

    /// Appends one JSONL record. Never returns an error upward: a
    /// logging failure must not make an otherwise-terminal execution
    /// retry or abort (spec.md §7 doesn't list logging as a failure
    /// class at all).
    pub fn append(&mut self, log: &CompletedArbitrageLog) {
        let today = Utc::now().date_naive();
        if self.current_date != Some(today) {
            self.rotate(today);
        }
        let Some(file) = self.file.as_mut() else {
            warn!("trade logger has no open file, dropping record");
            return;
        };
        match serde_json::to_string(log) {
            Ok(line) => {
                if let Err(e) = writeln!(file, "{line}") {
                    warn!(error = %e, "trade logger write failed");
                    return;
                }
                let _ = file.flush();
            }
            Err(e) => warn!(error = %e, "trade logger failed to serialize record"),
        }
    }

    fn rotate(&mut self, date: NaiveDate) {
        self.file = None;
        self.current_date = None;
        let filename = format!("trades_{}.jsonl", date.format("%Y%m%d"));
        let path = self.log_dir.join(&filename);
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => {
                self.file = Some(f);
                self.current_date = Some(date);
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to open trade log file"),
        }
    }
}
