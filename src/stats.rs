//! Index statistics and health overview.
//!
//! A quick summary of what is indexed: file, passage and vector counts,
//! embedding coverage, database size and when something was last indexed.
//! Used by `locallens stats` to show that imports and back-fills are doing
//! what they should.

use anyhow::Result;
use serde::Serialize;
use std::fmt::Write;
use std::path::Path;

use crate::embedding::ModelState;
use crate::models::IndexStats;
use crate::store::IndexStore;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    #[serde(flatten)]
    pub counts: IndexStats,
    pub db_path: String,
    pub db_size_bytes: u64,
    /// Milliseconds since the Unix epoch.
    pub last_indexed_at: Option<i64>,
    pub model_status: ModelState,
}

impl StatsReport {
    pub async fn collect(store: &IndexStore, db_path: &Path, model_status: ModelState) -> Result<Self> {
        let counts = store.stats().await?;
        let last_indexed_at = store.last_indexed_at().await?;

        // The WAL holds recent writes until checkpointed.
        let wal = db_path.with_extension(
            db_path
                .extension()
                .map(|e| format!("{}-wal", e.to_string_lossy()))
                .unwrap_or_else(|| "wal".to_string()),
        );
        let db_size_bytes = [db_path, wal.as_path()]
            .iter()
            .filter_map(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();

        Ok(Self {
            counts,
            db_path: db_path.display().to_string(),
            db_size_bytes,
            last_indexed_at,
            model_status,
        })
    }

    pub fn coverage_percent(&self) -> i64 {
        if self.counts.passage_count > 0 {
            (self.counts.vector_count * 100) / self.counts.passage_count
        } else {
            0
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "LocalLens — Index Stats");
        let _ = writeln!(out, "=======================");
        let _ = writeln!(out);
        let _ = writeln!(out, "  Database:    {}", self.db_path);
        let _ = writeln!(out, "  Size:        {}", format_bytes(self.db_size_bytes));
        let _ = writeln!(out, "  Model:       {}", self.model_status);
        let _ = writeln!(out);
        let _ = writeln!(out, "  Files:       {}", self.counts.file_count);
        let _ = writeln!(out, "  Passages:    {}", self.counts.passage_count);
        let _ = writeln!(
            out,
            "  Embedded:    {} / {} ({}%)",
            self.counts.vector_count,
            self.counts.passage_count,
            self.coverage_percent()
        );
        let last = match self.last_indexed_at {
            Some(ms) => format_ts_relative(ms / 1000),
            None => "never".to_string(),
        };
        let _ = writeln!(out, "  Last import: {}", last);
        out
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp (seconds) relative to now, e.g. "3 hours ago".
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanised() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert_eq!(format_ts_relative(now - 86400 * 3), "3 days ago");
    }

    #[test]
    fn report_renders_coverage() {
        let report = StatsReport {
            counts: IndexStats {
                file_count: 2,
                passage_count: 8,
                vector_count: 6,
            },
            db_path: "/tmp/x.sqlite".into(),
            db_size_bytes: 4096,
            last_indexed_at: None,
            model_status: ModelState::Unavailable,
        };
        assert_eq!(report.coverage_percent(), 75);
        let text = report.render();
        assert!(text.contains("Embedded:    6 / 8 (75%)"));
        assert!(text.contains("Model:       unavailable"));
        assert!(text.contains("Last import: never"));

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["file_count"], 2);
        assert_eq!(json["model_status"], "unavailable");
    }
}
