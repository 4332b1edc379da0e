//! Import progress reporting.
//!
//! The import pipeline emits a [`ProgressEvent`] when it starts reading a
//! file, after each embedded batch of passages and when a file is done. A
//! final `done` event with an empty file name closes a completed import.
//!
//! Sinks must never block the pipeline. The CLI writes to **stderr** so
//! stdout stays parseable; host applications subscribe to a bounded
//! [`tokio::sync::broadcast`] channel through [`ChannelProgress`], where a
//! slow receiver loses the oldest events instead of stalling the import.

use serde::Serialize;
use std::io::Write;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Reading,
    Embedding,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Reading => "reading",
            Phase::Embedding => "embedding",
            Phase::Done => "done",
        }
    }
}

/// A single progress event. `chunk`/`chunks` are only set while embedding.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ProgressEvent {
    pub current: usize,
    pub total: usize,
    pub file: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<usize>,
}

impl ProgressEvent {
    pub fn reading(current: usize, total: usize, file: &str) -> Self {
        Self {
            current,
            total,
            file: file.to_string(),
            phase: Phase::Reading,
            chunk: None,
            chunks: None,
        }
    }

    pub fn embedding(current: usize, total: usize, file: &str, chunk: usize, chunks: usize) -> Self {
        Self {
            current,
            total,
            file: file.to_string(),
            phase: Phase::Embedding,
            chunk: Some(chunk),
            chunks: Some(chunks),
        }
    }

    pub fn done(current: usize, total: usize, file: &str) -> Self {
        Self {
            current,
            total,
            file: file.to_string(),
            phase: Phase::Done,
            chunk: None,
            chunks: None,
        }
    }
}

/// Receives progress events. Called inline from the import pipeline.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// Human-friendly progress on stderr: "import  [12 / 1,234]  embedding  notes.txt  32/80".
pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn report(&self, event: &ProgressEvent) {
        if event.phase == Phase::Done && event.file.is_empty() {
            return;
        }
        let mut line = format!(
            "import  [{} / {}]  {:<9}  {}",
            format_number(event.current as u64),
            format_number(event.total as u64),
            event.phase.as_str(),
            event.file
        );
        if let (Some(chunk), Some(chunks)) = (event.chunk, event.chunks) {
            line.push_str(&format!("  {}/{}", chunk, chunks));
        }
        line.push('\n');
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressSink for JsonProgress {
    fn report(&self, event: &ProgressEvent) {
        if let Ok(line) = serde_json::to_string(event) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op sink when progress is disabled.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

/// Fan events out to any number of async subscribers.
pub struct ChannelProgress {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ChannelProgress {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

impl ProgressSink for ChannelProgress {
    fn report(&self, event: &ProgressEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event.clone());
    }
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn sink(&self) -> Box<dyn ProgressSink> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_shape_omits_chunk_fields_outside_embedding() {
        let reading = serde_json::to_value(ProgressEvent::reading(1, 5, "a.txt")).unwrap();
        assert_eq!(
            reading,
            serde_json::json!({"current": 1, "total": 5, "file": "a.txt", "phase": "reading"})
        );

        let embedding =
            serde_json::to_value(ProgressEvent::embedding(1, 5, "a.txt", 16, 40)).unwrap();
        assert_eq!(embedding["phase"], "embedding");
        assert_eq!(embedding["chunk"], 16);
        assert_eq!(embedding["chunks"], 40);
    }

    #[tokio::test]
    async fn channel_drops_oldest_when_full() {
        let sink = ChannelProgress::new(2);
        let mut rx = sink.subscribe();
        for i in 1..=4 {
            sink.report(&ProgressEvent::done(i, 4, "f"));
        }
        // The two oldest were overwritten.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(2))
        ));
        assert_eq!(rx.recv().await.unwrap().current, 3);
        assert_eq!(rx.recv().await.unwrap().current, 4);
    }

    #[test]
    fn channel_without_subscribers_does_not_fail() {
        ChannelProgress::new(4).report(&ProgressEvent::reading(1, 1, "x"));
    }
}
