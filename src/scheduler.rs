//! Deadline-anchored async scheduling loop (spec §4.E).
//!
//! Adapted from the teacher's `interval::Loop`: each call to `tick()`
//! sleeps until the next scheduled deadline and returns. If the previous
//! cycle overran the deadline, the loop does not try to catch up by
//! running back-to-back cycles — it drops the backlog and re-anchors one
//! interval ahead of now, logging the overrun. The teacher's thread-park
//! primitives (`tasks::sleep`, `tasks::mark_thread_ready`) become
//! `tokio::time::sleep`; the CPU-affinity/controller-readiness bookkeeping
//! that only makes sense across OS threads is dropped.

use log::warn;
use std::time::Duration;
use tokio::time::Instant;

pub struct DeadlineLoop {
    next_tick: Instant,
    interval: Duration,
    report: bool,
    last_report_at: Instant,
    label: String,
}

/// Outcome of a single `tick()`: whether the cycle ran on schedule, and
/// (if `report` was requested) the jitter observed since the previous
/// on-schedule tick.
pub struct TickOutcome {
    pub on_schedule: bool,
    pub jitter: Option<Duration>,
}

impl DeadlineLoop {
    pub fn new(interval: Duration) -> Self {
        Self::with_label(interval, "loop")
    }

    pub fn with_label(interval: Duration, label: impl Into<String>) -> Self {
        let now = Instant::now();
        DeadlineLoop {
            next_tick: now + interval,
            interval,
            report: false,
            last_report_at: now,
            label: label.into(),
        }
    }

    pub fn reporting(mut self) -> Self {
        self.report = true;
        self
    }

    /// Sleeps until the next deadline (or returns immediately, re-anchored
    /// one interval past now, if the deadline already passed). Never runs
    /// two cycles back-to-back to recover a missed deadline.
    pub async fn tick(&mut self) -> TickOutcome {
        let now = Instant::now();
        let on_schedule = now <= self.next_tick;

        if on_schedule {
            tokio::time::sleep_until(self.next_tick).await;
            self.next_tick += self.interval;
        } else {
            let overrun = now - self.next_tick;
            warn!(
                "{} loop overran deadline by {:?} ({:?} interval); dropping backlog and re-anchoring",
                self.label, overrun, self.interval
            );
            self.next_tick = Instant::now() + self.interval;
        }

        let jitter = if self.report {
            let t = Instant::now();
            let elapsed = t.duration_since(self.last_report_at);
            let j = if elapsed > self.interval {
                elapsed - self.interval
            } else {
                self.interval - elapsed
            };
            self.last_report_at = t;
            Some(j)
        } else {
            None
        };

        TickOutcome { on_schedule, jitter }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_advance_by_interval_on_schedule() {
        let mut l = DeadlineLoop::new(Duration::from_millis(100));
        let start = Instant::now();
        let o1 = l.tick().await;
        assert!(o1.on_schedule);
        let o2 = l.tick().await;
        assert!(o2.on_schedule);
        assert!(Instant::now() >= start + Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn overrun_drops_backlog_instead_of_catching_up() {
        let mut l = DeadlineLoop::new(Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(500)).await;
        let o = l.tick().await;
        assert!(!o.on_schedule);
        // After an overrun the next deadline is anchored from "now",
        // never from the missed deadlines — so the next tick should
        // again be roughly one interval away, not instantaneous.
        let before = Instant::now();
        let o2 = l.tick().await;
        assert!(o2.on_schedule);
        assert!(Instant::now() >= before + Duration::from_millis(50));
    }
}
