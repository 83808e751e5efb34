//! Live countdown of a visit.
//!
//! [`project`] is a pure function of the timeline and the current time; the
//! ticker only decides how often it is evaluated.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::models::{TimelinePhase, VisitTimeline};

/// Elapsed and remaining time of a visit at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerProjection {
    pub phase: TimelinePhase,
    /// Time since the actual start; zero before the visit starts
    pub elapsed: Duration,
    /// Time left until the scheduled end; negative once overtime
    pub remaining: Duration,
    pub is_overtime: bool,
    /// `|remaining|` while overtime
    pub overtime_by: Option<Duration>,
    /// Actual minus scheduled start; positive means late
    pub start_variance: Option<Duration>,
}

impl TimerProjection {
    /// `MM:SS` (or `H:MM:SS`) remaining, `+MM:SS` once overtime
    pub fn countdown_label(&self) -> String {
        match self.overtime_by {
            Some(overtime) => format!("+{}", clock(overtime)),
            None => clock(self.remaining),
        }
    }
}

/// Project a timeline at `now`.
///
/// The countdown always runs to the scheduled end, so a late start shortens
/// the visit instead of shifting it. A completed visit is frozen at its
/// actual end.
pub fn project(timeline: &VisitTimeline, now: DateTime<Utc>) -> TimerProjection {
    let Some(actual_start) = timeline.actual_start else {
        return TimerProjection {
            phase: TimelinePhase::NotStarted,
            elapsed: Duration::zero(),
            remaining: timeline.scheduled_duration(),
            is_overtime: false,
            overtime_by: None,
            start_variance: None,
        };
    };

    let reference = timeline.actual_end.unwrap_or(now);
    let elapsed = (reference - actual_start).max(Duration::zero());
    let remaining = timeline.scheduled_end - reference;
    let is_overtime = remaining < Duration::zero();

    TimerProjection {
        phase: timeline.phase(),
        elapsed,
        remaining,
        is_overtime,
        overtime_by: is_overtime.then(|| remaining.abs()),
        start_variance: Some(actual_start - timeline.scheduled_start),
    }
}

fn clock(duration: Duration) -> String {
    let total = duration.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

/// Re-evaluate `project` every `period` until every receiver is dropped.
///
/// Runs on its own task, so a slow remote write never delays a tick.
pub fn spawn_ticker<F>(
    period: std::time::Duration,
    mut project: F,
) -> watch::Receiver<Option<TimerProjection>>
where
    F: FnMut() -> Option<TimerProjection> + Send + 'static,
{
    let (sender, receiver) = watch::channel(project());
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    sender.send_replace(project());
                }
                () = sender.closed() => break,
            }
        }
    });
    receiver
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, hour, minute, 0).unwrap()
    }

    fn timeline(actual_start: Option<DateTime<Utc>>, actual_end: Option<DateTime<Utc>>) -> VisitTimeline {
        VisitTimeline {
            actual_start,
            actual_end,
            ..VisitTimeline::scheduled(at(10, 0), at(11, 0)).unwrap()
        }
    }

    #[test]
    fn unstarted_visit_shows_full_duration() {
        let projection = project(&timeline(None, None), at(12, 0));
        assert_eq!(projection.phase, TimelinePhase::NotStarted);
        assert_eq!(projection.elapsed, Duration::zero());
        assert_eq!(projection.remaining, Duration::hours(1));
        assert!(!projection.is_overtime);
        assert_eq!(projection.start_variance, None);
    }

    #[test]
    fn late_start_counts_down_to_scheduled_end() {
        let projection = project(&timeline(Some(at(10, 10)), None), at(10, 25));
        assert_eq!(projection.elapsed, Duration::minutes(15));
        assert_eq!(projection.remaining, Duration::minutes(35));
        assert!(!projection.is_overtime);
        assert_eq!(projection.start_variance, Some(Duration::minutes(10)));
        assert_eq!(projection.countdown_label(), "35:00");
    }

    #[test]
    fn overtime_reports_positive_overrun() {
        let projection = project(&timeline(Some(at(10, 0)), None), at(11, 5));
        assert_eq!(projection.remaining, -Duration::minutes(5));
        assert!(projection.is_overtime);
        assert_eq!(projection.overtime_by, Some(Duration::minutes(5)));
        assert_eq!(projection.countdown_label(), "+05:00");
    }

    #[test]
    fn completed_visit_is_frozen_at_actual_end() {
        let completed = timeline(Some(at(9, 55)), Some(at(10, 50)));
        let later = project(&completed, at(15, 0));
        assert_eq!(later, project(&completed, at(10, 50)));
        assert_eq!(later.phase, TimelinePhase::Completed);
        assert_eq!(later.elapsed, Duration::minutes(55));
        assert_eq!(later.remaining, Duration::minutes(10));
        assert_eq!(later.start_variance, Some(-Duration::minutes(5)));
    }

    #[test]
    fn labels_switch_to_hours() {
        let long = VisitTimeline::scheduled(at(8, 0), at(10, 30)).unwrap();
        assert_eq!(project(&long, at(8, 0)).countdown_label(), "2:30:00");
        let exact = project(&timeline(Some(at(10, 0)), None), at(11, 0));
        assert!(!exact.is_overtime);
        assert_eq!(exact.countdown_label(), "00:00");
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_stops_when_receivers_are_gone() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut receiver = spawn_ticker(std::time::Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            None
        });

        receiver.changed().await.unwrap();
        receiver.changed().await.unwrap();
        assert!(calls.load(Ordering::SeqCst) >= 3);

        drop(receiver);
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        let settled = calls.load(Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), settled);
    }
}
