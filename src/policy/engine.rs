//! Rule evaluation over a time-ordered temperature series.
//!
//! Pure: no I/O, no clock. Two independent scans run over the same series:
//! threshold/duration segmentation and repeated-minor spike counting. The
//! two families may overlap in time.

use crate::model::{PolicyRules, PolicyType, Reading, Severity, Violation, ViolationKind, MINUTE_MS};

/// Runs of in-violation readings no longer than this count as spikes.
pub const SPIKE_MAX_MINUTES: f64 = 5.0;

/// Bounds in force for one series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveBounds {
    pub max: f64,
    /// Disabled for frozen product
    pub min: Option<f64>,
    pub max_duration_minutes: f64,
    pub repeated_minor_count: u32,
    pub frozen: bool,
}

impl EffectiveBounds {
    /// Frozen mode: a frozen-max bound is configured and the first reading is below 0°C.
    pub fn resolve(rules: &PolicyRules, first: Option<&Reading>) -> Self {
        let limits = rules.limits();
        let frozen_max = limits
            .frozen_max_temp_c
            .filter(|_| first.map(|r| r.temperature < 0.0).unwrap_or(false));

        match frozen_max {
            Some(frozen_max) => Self {
                max: frozen_max,
                min: None,
                max_duration_minutes: limits.max_duration_minutes,
                repeated_minor_count: limits.repeated_minor_count,
                frozen: true,
            },
            None => Self {
                max: limits.max_temp_c,
                min: Some(limits.min_temp_c),
                max_duration_minutes: limits.max_duration_minutes,
                repeated_minor_count: limits.repeated_minor_count,
                frozen: false,
            },
        }
    }

    pub fn is_over_max(&self, temperature: f64) -> bool {
        temperature > self.max
    }

    pub fn is_under_min(&self, temperature: f64) -> bool {
        self.min.map(|min| temperature < min).unwrap_or(false)
    }

    pub fn in_violation(&self, temperature: f64) -> bool {
        self.is_over_max(temperature) || self.is_under_min(temperature)
    }

    /// Severity of a single reading; `Low` means in range.
    pub fn grade(&self, temperature: f64) -> Severity {
        if self.is_over_max(temperature) {
            let delta = temperature - self.max;
            if delta >= 5.0 {
                Severity::Critical
            } else if delta >= 3.0 {
                Severity::High
            } else {
                Severity::Medium
            }
        } else if let Some(min) = self.min.filter(|min| temperature < *min) {
            let delta = min - temperature;
            if delta >= 5.0 {
                Severity::Critical
            } else if delta >= 2.0 {
                Severity::High
            } else {
                Severity::Medium
            }
        } else {
            Severity::Low
        }
    }
}

/// An excursion being accumulated while the walk is inside a violating run.
struct OpenRun {
    start: i64,
    peak: f64,
    worst: Severity,
}

impl OpenRun {
    fn open(reading: &Reading, bounds: &EffectiveBounds) -> Self {
        Self {
            start: reading.timestamp,
            peak: reading.temperature,
            worst: bounds.grade(reading.temperature),
        }
    }

    fn extend(&mut self, reading: &Reading, bounds: &EffectiveBounds) {
        self.peak = if bounds.is_over_max(reading.temperature) {
            self.peak.max(reading.temperature)
        } else {
            self.peak.min(reading.temperature)
        };
        self.worst = self.worst.max(bounds.grade(reading.temperature));
    }

    fn close(self, end: i64, bounds: &EffectiveBounds, policy_type: PolicyType) -> Violation {
        let duration_minutes = (end - self.start) as f64 / MINUTE_MS as f64;
        if duration_minutes > bounds.max_duration_minutes {
            let severity = match policy_type {
                PolicyType::Pharma => Severity::High,
                PolicyType::Food => Severity::Medium,
            };
            return Violation::new(ViolationKind::Duration, severity, self.start, end, Some(self.peak));
        }

        let kind = if self.peak > bounds.max {
            ViolationKind::ThresholdHigh
        } else {
            ViolationKind::ThresholdLow
        };
        Violation::new(kind, self.worst, self.start, end, Some(self.peak))
    }
}

/// Evaluate a series against a policy. Returns threshold/duration violations
/// in start order, followed by at most one repeated-minor violation.
pub fn evaluate(readings: &[Reading], rules: &PolicyRules) -> Vec<Violation> {
    if readings.is_empty() {
        return Vec::new();
    }

    let mut sorted = readings.to_vec();
    sorted.sort_by_key(|r| r.timestamp);

    let policy_type = rules.policy_type();
    let bounds = EffectiveBounds::resolve(rules, sorted.first());

    let mut violations = segment_runs(&sorted, &bounds, policy_type);
    if let Some(repeated) = repeated_minor(&sorted, &bounds, policy_type) {
        violations.push(repeated);
    }
    violations
}

fn segment_runs(sorted: &[Reading], bounds: &EffectiveBounds, policy_type: PolicyType) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut open: Option<OpenRun> = None;

    for reading in sorted {
        if bounds.in_violation(reading.temperature) {
            match open.as_mut() {
                Some(run) => run.extend(reading, bounds),
                None => open = Some(OpenRun::open(reading, bounds)),
            }
        } else if let Some(run) = open.take() {
            violations.push(run.close(reading.timestamp, bounds, policy_type));
        }
    }

    // Still violating at series end: close at the last reading, no extrapolation.
    if let (Some(run), Some(last)) = (open, sorted.last()) {
        violations.push(run.close(last.timestamp, bounds, policy_type));
    }

    violations
}

/// Spike intervals `(start, end)`: violating runs closed by an in-range
/// reading within `SPIKE_MAX_MINUTES`. A run still open at series end is
/// not a spike.
pub fn spikes(sorted: &[Reading], bounds: &EffectiveBounds) -> Vec<(i64, i64)> {
    let mut spikes = Vec::new();
    let mut spike_start: Option<i64> = None;

    for reading in sorted {
        if bounds.in_violation(reading.temperature) {
            spike_start.get_or_insert(reading.timestamp);
        } else if let Some(start) = spike_start.take() {
            let minutes = (reading.timestamp - start) as f64 / MINUTE_MS as f64;
            if minutes <= SPIKE_MAX_MINUTES {
                spikes.push((start, reading.timestamp));
            }
        }
    }

    spikes
}

fn repeated_minor(sorted: &[Reading], bounds: &EffectiveBounds, policy_type: PolicyType) -> Option<Violation> {
    let spikes = spikes(sorted, bounds);
    if spikes.is_empty() || spikes.len() < bounds.repeated_minor_count as usize {
        return None;
    }

    let (first_start, _) = spikes[0];
    let (_, last_end) = spikes[spikes.len() - 1];
    let severity = match policy_type {
        PolicyType::Pharma => Severity::Medium,
        PolicyType::Food => Severity::Low,
    };
    Some(Violation::new(ViolationKind::RepeatedMinor, severity, first_start, last_end, None))
}
