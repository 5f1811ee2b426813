// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The schedule grammar and next-run computation.
//!
//! Two forms, both UTC:
//!   - `HH:MM`            fire daily at that wall-clock time
//!   - `every <N><s|m|h>` fire on a fixed interval anchored at task creation
//!
//! `next_run_at` is a pure function of (schedule, anchor, after); the driver
//! only ever asks "is the cached next-run due".

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use satchel_core::SatchelError;

/// A parsed schedule expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Daily at the given UTC wall-clock time.
    Daily { hour: u32, minute: u32 },
    /// Every `secs` seconds, anchored at task creation.
    Every { secs: u64 },
}

impl std::str::FromStr for Schedule {
    type Err = SatchelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();

        if let Some(rest) = raw.strip_prefix("every ") {
            let rest = rest.trim();
            let Some((idx, unit)) = rest.char_indices().last() else {
                return Err(invalid(raw));
            };
            let n: u64 = rest[..idx].parse().map_err(|_| invalid(raw))?;
            if n == 0 {
                return Err(invalid(raw));
            }
            let secs = match unit {
                's' => n,
                'm' => n * 60,
                'h' => n * 3600,
                _ => return Err(invalid(raw)),
            };
            return Ok(Schedule::Every { secs });
        }

        let (hh, mm) = raw.split_once(':').ok_or_else(|| invalid(raw))?;
        if hh.len() != 2 || mm.len() != 2 {
            return Err(invalid(raw));
        }
        let hour: u32 = hh.parse().map_err(|_| invalid(raw))?;
        let minute: u32 = mm.parse().map_err(|_| invalid(raw))?;
        if hour > 23 || minute > 59 {
            return Err(invalid(raw));
        }
        Ok(Schedule::Daily { hour, minute })
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Daily { hour, minute } => write!(f, "{hour:02}:{minute:02}"),
            Schedule::Every { secs } => {
                if secs % 3600 == 0 {
                    write!(f, "every {}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "every {}m", secs / 60)
                } else {
                    write!(f, "every {secs}s")
                }
            }
        }
    }
}

fn invalid(raw: &str) -> SatchelError {
    SatchelError::InvalidArgument(format!(
        "invalid schedule '{raw}' (expected HH:MM or 'every <N><s|m|h>')"
    ))
}

/// The first fire time strictly after `after`.
///
/// For interval schedules the grid is anchored at `anchor` (task creation),
/// so a missed window resumes on the original cadence instead of drifting.
pub fn next_run_at(
    schedule: Schedule,
    anchor: DateTime<Utc>,
    after: DateTime<Utc>,
) -> DateTime<Utc> {
    match schedule {
        Schedule::Daily { hour, minute } => {
            let time = NaiveTime::from_hms_opt(hour, minute, 0)
                .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).expect("midnight"));
            let candidate = Utc
                .from_utc_datetime(&after.date_naive().and_time(time));
            if candidate > after {
                candidate
            } else {
                candidate + Duration::days(1)
            }
        }
        Schedule::Every { secs } => {
            let secs = secs as i64;
            if after < anchor {
                return anchor;
            }
            let elapsed = (after - anchor).num_seconds();
            let intervals = elapsed / secs + 1;
            anchor + Duration::seconds(intervals * secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn parse_daily_vectors() {
        assert_eq!(
            "08:30".parse::<Schedule>().unwrap(),
            Schedule::Daily { hour: 8, minute: 30 }
        );
        assert_eq!(
            "23:59".parse::<Schedule>().unwrap(),
            Schedule::Daily { hour: 23, minute: 59 }
        );
        assert_eq!(
            "00:00".parse::<Schedule>().unwrap(),
            Schedule::Daily { hour: 0, minute: 0 }
        );
    }

    #[test]
    fn parse_interval_vectors() {
        assert_eq!(
            "every 90s".parse::<Schedule>().unwrap(),
            Schedule::Every { secs: 90 }
        );
        assert_eq!(
            "every 15m".parse::<Schedule>().unwrap(),
            Schedule::Every { secs: 900 }
        );
        assert_eq!(
            "every 2h".parse::<Schedule>().unwrap(),
            Schedule::Every { secs: 7200 }
        );
    }

    #[test]
    fn parse_rejections() {
        for bad in ["24:00", "12:60", "8:30", "every 0s", "every 5x", "every s", "nonsense", ""] {
            assert!(bad.parse::<Schedule>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn daily_next_run_same_day() {
        let schedule = "08:30".parse::<Schedule>().unwrap();
        let anchor = ts("2026-03-01T00:00:00Z");
        let next = next_run_at(schedule, anchor, ts("2026-03-01T06:00:00Z"));
        assert_eq!(next, ts("2026-03-01T08:30:00Z"));
    }

    #[test]
    fn daily_next_run_wraps_to_tomorrow() {
        let schedule = "08:30".parse::<Schedule>().unwrap();
        let anchor = ts("2026-03-01T00:00:00Z");
        // Exactly at the fire time counts as passed -- strictly after.
        let next = next_run_at(schedule, anchor, ts("2026-03-01T08:30:00Z"));
        assert_eq!(next, ts("2026-03-02T08:30:00Z"));

        let next = next_run_at(schedule, anchor, ts("2026-03-01T22:00:00Z"));
        assert_eq!(next, ts("2026-03-02T08:30:00Z"));
    }

    #[test]
    fn interval_stays_on_anchor_grid() {
        let schedule = "every 15m".parse::<Schedule>().unwrap();
        let anchor = ts("2026-03-01T10:00:00Z");
        // 10:07 -> next grid point is 10:15, not 10:22.
        let next = next_run_at(schedule, anchor, ts("2026-03-01T10:07:00Z"));
        assert_eq!(next, ts("2026-03-01T10:15:00Z"));
        // Missing several windows resumes the cadence.
        let next = next_run_at(schedule, anchor, ts("2026-03-01T11:32:00Z"));
        assert_eq!(next, ts("2026-03-01T11:45:00Z"));
    }

    #[test]
    fn interval_before_anchor_fires_at_anchor() {
        let schedule = "every 1h".parse::<Schedule>().unwrap();
        let anchor = ts("2026-03-01T10:00:00Z");
        let next = next_run_at(schedule, anchor, ts("2026-03-01T09:00:00Z"));
        assert_eq!(next, anchor);
    }

    #[test]
    fn display_round_trips() {
        for expr in ["08:30", "23:59", "every 90s", "every 15m", "every 2h"] {
            let schedule = expr.parse::<Schedule>().unwrap();
            assert_eq!(schedule.to_string(), expr);
        }
    }
}
