//! Log-driven progress tracking.
//!
//! The trainer's log is the only progress signal. Lines can be re-read after a truncation
//! and reports can repeat, so everything here is keyed off a high-water mark: only an
//! iteration above it counts as progress.

use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const EMA_ALPHA: f64 = 0.3;
const WINDOW: usize = 32;

static LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\[(?P<ts>\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2})\]\s*)?(?:Iter|Step)\s+(?P<iter>\d+)(?:\s*/\s*(?P<total>\d+))?\s*[:|]?\s*(?P<rest>.*)$",
    )
    .expect("log line regex")
});

static METRIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<name>[A-Za-z][A-Za-z0-9 _/.\-]*?)\s*(?::\s*|\s+)(?P<value>[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?)",
    )
    .expect("metric regex")
});

/// One recognized trainer log line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub iteration: u64,
    /// Total announced by `Step N/T` lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<f64>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

/// Parse `Iter N: ...` or `[ts] Step N/T | ...`. Anything else is `None`.
pub fn parse_line(line: &str, now: DateTime<Utc>) -> Option<LogEvent> {
    let caps = LINE_RE.captures(line.trim_end())?;
    let iteration = caps.name("iter")?.as_str().parse().ok()?;
    let total = caps.name("total").and_then(|m| m.as_str().parse().ok());
    let timestamp = caps
        .name("ts")
        .and_then(|m| NaiveDateTime::parse_from_str(m.as_str(), "%Y-%m-%d %H:%M:%S").ok())
        .map_or(now, |ts| ts.and_utc());

    let mut metrics = BTreeMap::new();
    let rest = caps.name("rest").map_or("", |m| m.as_str());
    for segment in rest.split([',', '|']) {
        let Some(m) = METRIC_RE.captures(segment.trim()) else {
            continue;
        };
        let Ok(value) = m["value"].parse::<f64>() else {
            continue;
        };
        let name = normalize_metric_name(&m["name"]);
        if !name.is_empty() {
            metrics.insert(name, value);
        }
    }

    let loss = metrics.get("loss").or_else(|| metrics.get("train_loss")).copied();
    Some(LogEvent { iteration, total, loss, metrics, timestamp })
}

/// `It/sec` -> `it_per_sec`, `Train loss` -> `train_loss`.
fn normalize_metric_name(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase().replace('/', "_per_");
    let mut out = String::with_capacity(lowered.len());
    for c in lowered.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '_' };
        if c == '_' && (out.is_empty() || out.ends_with('_')) {
            continue;
        }
        out.push(c);
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// New high-water mark.
    Advanced,
    /// Same iteration as the high-water mark; only metrics were merged.
    Merged,
    /// Below the high-water mark; discarded.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current_iter: u64,
    pub total_iters: u64,
    pub percent_complete: f64,
    pub estimated_seconds_remaining: Option<f64>,
    pub iterations_per_second: Option<f64>,
    pub last_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_val_loss: Option<f64>,
    pub last_progress_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ProgressMonitor {
    total: u64,
    high_water: u64,
    /// Last advanced point a duration sample can be measured from.
    anchor: Option<(u64, DateTime<Utc>)>,
    ema_secs_per_iter: Option<f64>,
    window: VecDeque<(u64, DateTime<Utc>)>,
    latest_metrics: BTreeMap<String, f64>,
    last_loss: Option<f64>,
    best_val_loss: Option<f64>,
    last_progress_at: Option<DateTime<Utc>>,
    last_activity: Instant,
}

impl ProgressMonitor {
    #[must_use]
    pub fn new(total: u64) -> Self {
        Self {
            total,
            high_water: 0,
            anchor: None,
            ema_secs_per_iter: None,
            window: VecDeque::with_capacity(WINDOW),
            latest_metrics: BTreeMap::new(),
            last_loss: None,
            best_val_loss: None,
            last_progress_at: None,
            last_activity: Instant::now(),
        }
    }

    /// Parse `line` and feed it to [`Self::observe`].
    pub fn on_line(&mut self, line: &str) -> Option<LogEvent> {
        self.on_lines(&[line], Utc::now()).pop()
    }

    /// Feed one read of the log. Lines without their own timestamp are stamped `now`, and
    /// the rate estimate takes a single sample for the whole batch, so a burst of lines
    /// flushed together does not read as zero-duration iterations.
    pub fn on_lines<S: AsRef<str>>(&mut self, lines: &[S], now: DateTime<Utc>) -> Vec<LogEvent> {
        let mut events = Vec::with_capacity(lines.len());
        let mut advanced_at = None;
        for line in lines {
            let Some(event) = parse_line(line.as_ref(), now) else {
                continue;
            };
            if self.accept(&event) == Observation::Advanced {
                advanced_at = Some(event.timestamp);
            }
            events.push(event);
        }
        if let Some(timestamp) = advanced_at {
            self.sample(self.high_water, timestamp);
        }
        events
    }

    pub fn observe(&mut self, event: &LogEvent) -> Observation {
        let observation = self.accept(event);
        if observation == Observation::Advanced {
            self.sample(event.iteration, event.timestamp);
        }
        observation
    }

    fn accept(&mut self, event: &LogEvent) -> Observation {
        if event.iteration < self.high_water {
            return Observation::Stale;
        }
        if event.iteration == self.high_water && self.last_progress_at.is_some() {
            self.merge(event);
            return Observation::Merged;
        }
        if event.iteration == self.high_water {
            // Nothing accepted yet at this mark (fresh start or resume seed).
            self.merge(event);
            self.anchor = Some((event.iteration, event.timestamp));
            self.last_progress_at = Some(event.timestamp);
            return Observation::Merged;
        }

        if self.window.len() == WINDOW {
            self.window.pop_front();
        }
        self.window.push_back((event.iteration, event.timestamp));

        self.high_water = event.iteration;
        self.last_progress_at = Some(event.timestamp);
        self.last_activity = Instant::now();
        self.merge(event);
        Observation::Advanced
    }

    /// Fold the time since the anchor into the EMA. A zero-length interval keeps the old
    /// anchor so the iterations are measured once time has passed.
    fn sample(&mut self, iteration: u64, timestamp: DateTime<Utc>) {
        let Some((from_iter, from_ts)) = self.anchor else {
            self.anchor = Some((iteration, timestamp));
            return;
        };
        if iteration <= from_iter {
            return;
        }
        #[allow(clippy::cast_precision_loss)]
        let secs = (timestamp - from_ts).num_milliseconds() as f64 / 1000.0;
        if secs > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let sample = secs / (iteration - from_iter) as f64;
            self.ema_secs_per_iter = Some(match self.ema_secs_per_iter {
                Some(ema) => EMA_ALPHA.mul_add(sample, (1.0 - EMA_ALPHA) * ema),
                None => sample,
            });
            self.anchor = Some((iteration, timestamp));
        }
    }

    fn merge(&mut self, event: &LogEvent) {
        self.latest_metrics.extend(event.metrics.iter().map(|(k, v)| (k.clone(), *v)));
        if let Some(loss) = event.loss {
            self.last_loss = Some(loss);
        }
        if let Some(&val_loss) = event.metrics.get("val_loss") {
            self.best_val_loss = Some(self.best_val_loss.map_or(val_loss, |best| best.min(val_loss)));
        }
    }

    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    #[must_use]
    pub fn latest_metrics(&self) -> &BTreeMap<String, f64> {
        &self.latest_metrics
    }

    #[must_use]
    pub fn best_val_loss(&self) -> Option<f64> {
        self.best_val_loss
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn snapshot(&self) -> ProgressSnapshot {
        let current = self.high_water.min(self.total);
        let percent_complete =
            if self.total == 0 { 0.0 } else { current as f64 / self.total as f64 * 100.0 };
        let estimated_seconds_remaining =
            self.ema_secs_per_iter.map(|ema| (self.total - current) as f64 * ema);

        let iterations_per_second = match (self.window.front(), self.window.back()) {
            (Some(&(first_iter, first_ts)), Some(&(last_iter, last_ts))) if last_iter > first_iter => {
                let secs = (last_ts - first_ts).num_milliseconds() as f64 / 1000.0;
                (secs > 0.0).then(|| (last_iter - first_iter) as f64 / secs)
            }
            _ => None,
        };

        ProgressSnapshot {
            current_iter: current,
            total_iters: self.total,
            percent_complete,
            estimated_seconds_remaining,
            iterations_per_second,
            last_loss: self.last_loss,
            best_val_loss: self.best_val_loss,
            last_progress_at: self.last_progress_at,
        }
    }

    /// Seed the high-water mark after a resume. Earlier lines become stale and the rate
    /// estimate starts over.
    pub fn resume_from(&mut self, step: u64) {
        self.high_water = step;
        self.anchor = None;
        self.ema_secs_per_iter = None;
        self.window.clear();
        self.last_progress_at = None;
        self.last_activity = Instant::now();
    }

    /// Carry the best validation loss over from a checkpoint.
    pub fn seed_best_val_loss(&mut self, best: Option<f64>) {
        self.best_val_loss = best;
    }

    /// Restart the stall clock, e.g. right after a launch.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    #[must_use]
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }
}

/// Incremental reader over an append-only log file.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
}

impl LogTail {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), offset: 0, partial: Vec::new() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Complete lines appended since the last call. A shrunken file is read again from
    /// the start.
    pub async fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "log file shrank, re-reading from start");
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        self.offset += buf.len() as u64;

        self.partial.extend_from_slice(&buf);
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        Ok(lines)
    }

    /// Unterminated trailing text, taken once the writer has exited.
    pub fn take_partial(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.partial).trim_end().to_string();
        self.partial.clear();
        (!text.is_empty()).then_some(text)
    }
}
