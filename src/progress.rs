//! Sync progress reporting.
//!
//! Reports observable progress during `vcon-sync sync` so operators see what
//! is being listed, how much is left, and roughly when the run will finish.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.
//! Events are emitted from the scheduler after each batch completes, never
//! from inside a record worker.

use std::io::Write;
use std::time::Duration;

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// The source is being listed. Total unknown.
    Discovering { source: String },
    /// `processed` of `total` records have been handled.
    Loading {
        source: String,
        processed: u64,
        total: u64,
        /// Records per second since loading began.
        rate: f64,
        eta: Option<Duration>,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Must not fail the run.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr:
/// `sync s3:archive  loading  1,250 / 5,000 vCons  (41.7/s, eta 1m30s)`.
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Discovering { source } => {
                format!("sync {}  discovering...\n", source)
            }
            SyncProgressEvent::Loading {
                source,
                processed,
                total,
                rate,
                eta,
            } => {
                let eta_fmt = eta.map(format_eta).unwrap_or_else(|| "-".to_string());
                format!(
                    "sync {}  loading  {} / {} vCons  ({:.1}/s, eta {})\n",
                    source,
                    format_number(*processed),
                    format_number(*total),
                    rate,
                    eta_fmt
                )
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Discovering { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "discovering"
            }),
            SyncProgressEvent::Loading {
                source,
                processed,
                total,
                rate,
                eta,
            } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "loading",
                "processed": processed,
                "total": total,
                "rate": rate,
                "eta_secs": eta.map(|d| d.as_secs()),
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

/// Records per second and remaining time, given elapsed wall time.
pub fn rate_and_eta(processed: u64, total: u64, elapsed: Duration) -> (f64, Option<Duration>) {
    let secs = elapsed.as_secs_f64();
    if processed == 0 || secs <= 0.0 {
        return (0.0, None);
    }
    let rate = processed as f64 / secs;
    let remaining = total.saturating_sub(processed) as f64;
    (rate, Some(Duration::from_secs_f64(remaining / rate)))
}

pub(crate) fn format_number(n: u64) -> String {
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

fn format_eta(eta: Duration) -> String {
    let secs = eta.as_secs();
    match (secs / 3600, (secs % 3600) / 60, secs % 60) {
        (0, 0, s) => format!("{}s", s),
        (0, m, s) => format!("{}m{:02}s", m, s),
        (h, m, _) => format!("{}h{:02}m", h, m),
    }
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

    pub fn reporter(&self) -> Box<dyn SyncProgressReporter> {
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
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(Duration::from_secs(42)), "42s");
        assert_eq!(format_eta(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_eta(Duration::from_secs(3 * 3600 + 5 * 60)), "3h05m");
    }

    #[test]
    fn rate_and_eta_from_elapsed() {
        let (rate, eta) = rate_and_eta(50, 150, Duration::from_secs(10));
        assert!((rate - 5.0).abs() < 1e-9);
        assert_eq!(eta, Some(Duration::from_secs(20)));

        assert_eq!(rate_and_eta(0, 150, Duration::from_secs(10)), (0.0, None));
    }
}
