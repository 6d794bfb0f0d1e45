use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Present,
    Absent,
    Late,
}

impl RecordStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "present" => Some(RecordStatus::Present),
            "absent" => Some(RecordStatus::Absent),
            "late" => Some(RecordStatus::Late),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordStatus::Present => "present",
            RecordStatus::Absent => "absent",
            RecordStatus::Late => "late",
        }
    }
}

/// Classify a requested marking against the session's grace window.
/// Only `present` is time-sensitive: requested after `start_time +
/// grace_period_minutes` it is recorded as `late`. The deadline itself
/// still counts as present (inclusive boundary).
pub fn classify_marking(
    requested: RecordStatus,
    marked_at: DateTime<Utc>,
    start_time: DateTime<Utc>,
    grace_period_minutes: i64,
) -> RecordStatus {
    if requested != RecordStatus::Present {
        return requested;
    }
    let deadline = start_time + Duration::minutes(grace_period_minutes);
    if marked_at <= deadline {
        RecordStatus::Present
    } else {
        RecordStatus::Late
    }
}

/// 1-decimal rounding for percentage figures.
pub fn round_percent_1dp(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakdown {
    pub present: i64,
    pub absent: i64,
    pub late: i64,
    pub total: i64,
}

impl Breakdown {
    pub fn add(&mut self, status: RecordStatus) {
        match status {
            RecordStatus::Present => self.present += 1,
            RecordStatus::Absent => self.absent += 1,
            RecordStatus::Late => self.late += 1,
        }
        self.total += 1;
    }

    /// Share of `present` records, 0.0 on an empty set.
    pub fn percent_present(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round_percent_1dp(100.0 * self.present as f64 / self.total as f64)
    }

    /// Share of records that attended at all (present + late), 0.0 on an
    /// empty set. This is the metric behind low-attendance warnings.
    pub fn attended_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        round_percent_1dp(100.0 * (self.present + self.late) as f64 / self.total as f64)
    }
}

pub fn breakdown<I>(statuses: I) -> Breakdown
where
    I: IntoIterator<Item = RecordStatus>,
{
    let mut out = Breakdown::default();
    for s in statuses {
        out.add(s);
    }
    out
}
