//! Progress parsing for the download tool's line-oriented output
//!
//! The tool is run with `--newline`, so every progress update arrives as its
//! own line on stdout. A few other lines matter too: destination and merge
//! announcements (to learn the produced file names), playlist item counters
//! and `ERROR:` lines (to explain a failed exit).

use regex::Regex;
use std::collections::VecDeque;
use std::sync::LazyLock;
use tubeq_types::Progress;

static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("valid regex"));

static SPEED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*([KMGTP]?i?B)/s").expect("valid regex")
});

static ETA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bETA\s+(\S+)").expect("valid regex"));

static DESTINATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Destination:\s+(.+?)\s*$").expect("valid regex"));

static MERGER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"Merging formats into\s+"(.+)""#).expect("valid regex")
});

static ALREADY_DOWNLOADED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(.+?) has already been downloaded").expect("valid regex")
});

static ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Downloading (?:item|video) (\d+) of (\d+)").expect("valid regex")
});

/// A raw speed reading such as `1.5MiB/s`
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedSample {
    pub value: f64,
    pub unit: String,
}

impl SpeedSample {
    pub fn bytes_per_sec(&self) -> f64 {
        self.value * unit_multiplier(&self.unit)
    }
}

/// Everything recognised on a single output line
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedLine {
    pub percent: Option<f64>,
    pub speed: Option<SpeedSample>,
    pub eta: Option<String>,
    pub destination: Option<String>,
    pub merged_into: Option<String>,
    pub already_downloaded: Option<String>,
    pub item: Option<(u32, u32)>,
    pub error: Option<String>,
}

/// Parse a single line of tool output
pub fn parse_line(line: &str) -> ParsedLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let mut parsed = ParsedLine::default();

    if let Some(message) = line.strip_prefix("ERROR:") {
        parsed.error = Some(format!("ERROR:{}", message));
        return parsed;
    }

    parsed.percent = PERCENT_RE
        .captures(line)
        .and_then(|c| c[1].parse::<f64>().ok());

    parsed.speed = SPEED_RE.captures(line).and_then(|c| {
        c[1].parse::<f64>().ok().map(|value| SpeedSample {
            value,
            unit: c[2].to_string(),
        })
    });

    parsed.eta = ETA_RE.captures(line).map(|c| c[1].to_string());

    if let Some(c) = DESTINATION_RE.captures(line) {
        parsed.destination = Some(base_name(&c[1]));
    }
    if let Some(c) = MERGER_RE.captures(line) {
        parsed.merged_into = Some(base_name(&c[1]));
    }
    if let Some(c) = ALREADY_DOWNLOADED_RE.captures(line) {
        parsed.already_downloaded = Some(base_name(&c[1]));
    }

    parsed.item = ITEM_RE.captures(line).and_then(|c| {
        let current = c[1].parse::<u32>().ok()?;
        let total = c[2].parse::<u32>().ok()?;
        Some((current, total))
    });

    parsed
}

/// Strip any directory from a path printed by the tool
///
/// Both separators are handled since the tool may run on another platform
/// than the one that later reads the snapshot.
pub fn base_name(path: &str) -> String {
    let trimmed = path.trim().trim_matches('"');
    trimmed
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "PiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "PB" => 1e15,
        _ => 1.0,
    }
}

/// Trailing moving average over the last `window` speed samples
///
/// Samples are averaged in bytes per second and rendered in the unit of the
/// most recent sample, so `[10, 20, 30, 20, 10] MiB/s` reports `18.00MiB/s`.
#[derive(Debug, Clone)]
pub struct SpeedSmoother {
    window: usize,
    samples: VecDeque<f64>,
}

impl SpeedSmoother {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
        }
    }

    /// Add a sample and return the smoothed value as display text
    pub fn push(&mut self, sample: &SpeedSample) -> String {
        self.samples.push_back(sample.bytes_per_sec());
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }

        let average = self.average_bytes_per_sec();
        format!("{:.2}{}/s", average / unit_multiplier(&sample.unit), sample.unit)
    }

    pub fn average_bytes_per_sec(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Accumulates the state of one tool process from its output lines
#[derive(Debug)]
pub struct OutputTracker {
    progress: Progress,
    smoother: SpeedSmoother,
    files: Vec<String>,
    /// Index into `files` where the current playlist item starts
    item_start: usize,
    last_error: Option<String>,
}

impl OutputTracker {
    pub fn new(speed_window: usize) -> Self {
        Self {
            progress: Progress::default(),
            smoother: SpeedSmoother::new(speed_window),
            files: Vec::new(),
            item_start: 0,
            last_error: None,
        }
    }

    /// Feed one line; returns true when the progress record changed
    pub fn feed(&mut self, line: &str) -> bool {
        let parsed = parse_line(line);
        let mut changed = false;

        if let Some(error) = parsed.error {
            self.last_error = Some(error);
            return false;
        }

        if let Some(name) = parsed.destination {
            self.record_file(name.clone());
            self.progress.filename = Some(name);
            changed = true;
        }

        if let Some(name) = parsed.merged_into {
            // The merged container replaces the separate streams of this item
            self.files.truncate(self.item_start);
            self.record_file(name.clone());
            self.progress.filename = Some(name);
            changed = true;
        }

        if let Some(name) = parsed.already_downloaded {
            self.record_file(name.clone());
            self.progress.filename = Some(name);
            self.progress.percent = 100.0;
            changed = true;
        }

        if let Some((current, total)) = parsed.item {
            self.progress.current_item = Some(current);
            self.progress.total_items = Some(total);
            self.progress.percent = 0.0;
            self.item_start = self.files.len();
            self.smoother.reset();
            changed = true;
        }

        if let Some(percent) = parsed.percent {
            self.progress.percent = percent;
            if let Some(sample) = parsed.speed {
                self.progress.speed = Some(self.smoother.push(&sample));
            }
            if let Some(eta) = parsed.eta {
                self.progress.eta = Some(eta);
            }
            changed = true;
        }

        changed
    }

    fn record_file(&mut self, name: String) {
        if !self.files.contains(&name) {
            self.files.push(name);
        }
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn into_files(self) -> Vec<String> {
        self.files
    }
}
