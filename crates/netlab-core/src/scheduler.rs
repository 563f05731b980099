//! # Event Scheduler
//!
//! Single-threaded, time-ordered callback queue. Every other component is
//! driven from here.
//!
//! Events fire in non-decreasing fire-time order; events with equal fire time
//! fire in the order they were scheduled. A callback receives the scheduler
//! itself and may schedule or cancel further events. Those calls only affect
//! later dispatch, because the running event has already left the queue.

use crate::error::SchedulerError;
use crate::time::{SimDuration, SimTime};
use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

/// Callback type dispatched by [`Scheduler`]. `C` is the experiment context.
pub type Callback<C> = Box<dyn FnOnce(&mut Scheduler<C>, &mut C)>;

/// Handle to a scheduled event, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    seq: u64,
    at: SimTime,
}

impl EventHandle {
    pub fn fire_time(&self) -> SimTime {
        self.at
    }
}

// ─── Scheduled Event ────────────────────────────────────────────────────────

struct ScheduledEvent<C> {
    /// Time when the event should occur.
    at: SimTime,
    /// Sequence number for FIFO ordering of same-time events.
    seq: u64,
    callback: Callback<C>,
}

impl<C> PartialEq for ScheduledEvent<C> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<C> Eq for ScheduledEvent<C> {}

impl<C> PartialOrd for ScheduledEvent<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for ScheduledEvent<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap and we want the earliest
        // (time, seq) on top.
        match other.at.cmp(&self.at) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

// ─── Run Summary ────────────────────────────────────────────────────────────

/// Outcome of a [`Scheduler::run_until`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Events dispatched during this call.
    pub dispatched: u64,
    /// Clock value when the call returned.
    pub ended_at: SimTime,
    /// Whether a callback requested [`Scheduler::stop`].
    pub stopped_early: bool,
}

// ─── Scheduler ──────────────────────────────────────────────────────────────

pub struct Scheduler<C> {
    now: SimTime,
    next_seq: u64,
    queue: BinaryHeap<ScheduledEvent<C>>,
    /// Sequence numbers of events that are queued and not cancelled.
    live: HashSet<u64>,
    dispatched: u64,
    stop_requested: bool,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Scheduler {
            now: SimTime::ZERO,
            next_seq: 0,
            queue: BinaryHeap::new(),
            live: HashSet::new(),
            dispatched: 0,
            stop_requested: false,
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Number of queued, non-cancelled events.
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Total events dispatched over the scheduler's lifetime.
    pub fn dispatched(&self) -> u64 {
        self.dispatched
    }

    /// Schedules `callback` to fire `delay` after `now()`.
    pub fn schedule<F>(&mut self, delay: SimDuration, callback: F) -> Result<EventHandle, SchedulerError>
    where
        F: FnOnce(&mut Scheduler<C>, &mut C) + 'static,
    {
        let at = self
            .now
            .checked_add(delay)
            .ok_or(SchedulerError::InvalidDelay(delay))?;
        Ok(self.push(at, Box::new(callback)))
    }

    /// Schedules `callback` at an absolute time, which must not be in the past.
    pub fn schedule_at<F>(&mut self, at: SimTime, callback: F) -> Result<EventHandle, SchedulerError>
    where
        F: FnOnce(&mut Scheduler<C>, &mut C) + 'static,
    {
        if at < self.now {
            return Err(SchedulerError::InvalidDelay(at - self.now));
        }
        Ok(self.push(at, Box::new(callback)))
    }

    fn push(&mut self, at: SimTime, callback: Callback<C>) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(seq);
        self.queue.push(ScheduledEvent { at, seq, callback });
        EventHandle { seq, at }
    }

    /// Withdraws a pending event. Returns `false` (and does nothing) if the
    /// event already fired or was already cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.live.remove(&handle.seq)
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.live.contains(&handle.seq)
    }

    /// Asks the running [`run_until`](Self::run_until) loop to return once the
    /// current callback completes.
    pub fn stop(&mut self) {
        self.stop_requested = true;
    }

    /// Dispatches events in order until the queue is empty, the next event is
    /// later than `stop_time`, or a callback calls [`stop`](Self::stop).
    ///
    /// Events later than `stop_time` stay queued. Unless stopped early the
    /// clock ends at `stop_time`.
    pub fn run_until(&mut self, stop_time: SimTime, ctx: &mut C) -> RunSummary {
        self.stop_requested = false;
        let mut dispatched = 0;

        loop {
            let Some(head) = self.queue.peek() else {
                break;
            };
            if head.at > stop_time {
                break;
            }
            let Some(event) = self.queue.pop() else {
                break;
            };
            // Cancelled events are dropped lazily.
            if !self.live.remove(&event.seq) {
                continue;
            }

            debug_assert!(event.at >= self.now, "clock moved backwards");
            self.now = event.at;
            (event.callback)(self, ctx);
            dispatched += 1;
            self.dispatched += 1;

            if self.stop_requested {
                return RunSummary {
                    dispatched,
                    ended_at: self.now,
                    stopped_early: true,
                };
            }
        }

        if stop_time > self.now {
            self.now = stop_time;
        }
        RunSummary {
            dispatched,
            ended_at: self.now,
            stopped_early: false,
        }
    }
}

impl<C: 'static> Scheduler<C> {
    /// Installs a self-rescheduling task: `task` runs after `first_delay` and
    /// then every `period`, until the returned handle is cancelled.
    pub fn schedule_repeating<F>(
        &mut self,
        first_delay: SimDuration,
        period: SimDuration,
        task: F,
    ) -> Result<RepeatingHandle, SchedulerError>
    where
        F: FnMut(&mut Scheduler<C>, &mut C) + 'static,
    {
        if !period.is_positive() {
            return Err(SchedulerError::InvalidPeriod(period));
        }
        let state = Rc::new(RepeatState {
            cancelled: Cell::new(false),
            next: Cell::new(None),
            runs: Cell::new(0),
        });
        arm(self, first_delay, period, state.clone(), Box::new(task))?;
        Ok(RepeatingHandle { state })
    }
}

// ─── Repeating Tasks ────────────────────────────────────────────────────────

type RepeatFn<C> = Box<dyn FnMut(&mut Scheduler<C>, &mut C)>;

struct RepeatState {
    cancelled: Cell<bool>,
    next: Cell<Option<EventHandle>>,
    runs: Cell<u64>,
}

/// Handle to a task installed with [`Scheduler::schedule_repeating`].
#[derive(Clone)]
pub struct RepeatingHandle {
    state: Rc<RepeatState>,
}

impl RepeatingHandle {
    /// Stops the task and withdraws its pending occurrence. Idempotent.
    pub fn cancel<C>(&self, scheduler: &mut Scheduler<C>) {
        self.state.cancelled.set(true);
        if let Some(next) = self.state.next.take() {
            scheduler.cancel(next);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.get()
    }

    /// How many times the task has run.
    pub fn runs(&self) -> u64 {
        self.state.runs.get()
    }

    /// Fire time of the next occurrence, if one is armed.
    pub fn next_fire_time(&self) -> Option<SimTime> {
        self.state.next.get().map(|h| h.fire_time())
    }
}

impl std::fmt::Debug for RepeatingHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepeatingHandle")
            .field("cancelled", &self.state.cancelled.get())
            .field("runs", &self.state.runs.get())
            .finish()
    }
}

fn arm<C: 'static>(
    scheduler: &mut Scheduler<C>,
    delay: SimDuration,
    period: SimDuration,
    state: Rc<RepeatState>,
    mut task: RepeatFn<C>,
) -> Result<(), SchedulerError> {
    let st = state.clone();
    let handle = scheduler.schedule(delay, move |sched, ctx| {
        st.next.set(None);
        if st.cancelled.get() {
            return;
        }
        task(sched, ctx);
        st.runs.set(st.runs.get() + 1);
        // The task may have cancelled itself.
        if !st.cancelled.get() {
            if let Err(e) = arm(sched, period, period, st.clone(), task) {
                tracing::warn!(error = %e, runs = st.runs.get(), "repeating task stopped: next occurrence is out of range");
                st.cancelled.set(true);
            }
        }
    })?;
    state.next.set(Some(handle));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    type Log = Vec<(u64, &'static str)>;

    fn record(label: &'static str) -> impl FnOnce(&mut Scheduler<Log>, &mut Log) {
        move |s, log| log.push((s.now().as_nanos(), label))
    }

    // ─── Ordering ───────────────────────────────────────────────────────

    #[test]
    fn fires_in_time_order() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched.schedule(SimDuration::from_millis(30), record("c")).unwrap();
        sched.schedule(SimDuration::from_millis(10), record("a")).unwrap();
        sched.schedule(SimDuration::from_millis(20), record("b")).unwrap();

        sched.run_until(SimTime::from_millis(100), &mut log);
        let labels: Vec<_> = log.iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec!["a", "b", "c"]);
    }

    #[test]
    fn equal_times_fire_in_schedule_order() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        for label in ["first", "second", "third", "fourth"] {
            sched.schedule(SimDuration::from_secs(3), record(label)).unwrap();
        }
        sched.run_until(SimTime::from_secs_f64(5.0), &mut log);
        let labels: Vec<_> = log.iter().map(|(_, l)| *l).collect();
        assert_eq!(labels, vec!["first", "second", "third", "fourth"]);
    }

    #[test]
    fn negative_delay_is_rejected() {
        let mut sched: Scheduler<Log> = Scheduler::new();
        let err = sched
            .schedule(SimDuration::from_millis(-1), record("x"))
            .unwrap_err();
        assert_eq!(err, SchedulerError::InvalidDelay(SimDuration::from_millis(-1)));
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn schedule_at_rejects_past() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched.run_until(SimTime::from_millis(50), &mut log);
        assert!(sched.schedule_at(SimTime::from_millis(10), record("x")).is_err());
        assert!(sched.schedule_at(SimTime::from_millis(50), record("y")).is_ok());
    }

    #[test]
    fn run_until_leaves_later_events_queued() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched.schedule(SimDuration::from_secs(1), record("in")).unwrap();
        sched.schedule(SimDuration::from_secs(10), record("out")).unwrap();

        let summary = sched.run_until(SimTime::from_secs_f64(5.0), &mut log);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.ended_at, SimTime::from_secs_f64(5.0));
        assert_eq!(sched.now(), SimTime::from_secs_f64(5.0));
        assert_eq!(sched.pending(), 1);
    }

    #[test]
    fn event_at_stop_time_fires() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched.schedule(SimDuration::from_secs(2), record("edge")).unwrap();
        sched.run_until(SimTime::from_secs_f64(2.0), &mut log);
        assert_eq!(log.len(), 1);
    }

    // ─── Reentrancy ─────────────────────────────────────────────────────

    #[test]
    fn callbacks_can_schedule_followups() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched
            .schedule(SimDuration::from_millis(10), |s, log: &mut Log| {
                log.push((s.now().as_nanos(), "outer"));
                s.schedule(SimDuration::ZERO, record("same-time")).unwrap();
                s.schedule(SimDuration::from_millis(5), record("later")).unwrap();
            })
            .unwrap();
        sched.schedule(SimDuration::from_millis(10), record("sibling")).unwrap();

        sched.run_until(SimTime::from_millis(100), &mut log);
        let labels: Vec<_> = log.iter().map(|(_, l)| *l).collect();
        // The zero-delay follow-up queues behind the already-scheduled sibling.
        assert_eq!(labels, vec!["outer", "sibling", "same-time", "later"]);
        assert_eq!(log[3].0, 15_000_000);
    }

    #[test]
    fn stop_returns_after_current_callback() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        sched
            .schedule(SimDuration::from_millis(1), |s, log: &mut Log| {
                log.push((0, "stopper"));
                s.stop();
            })
            .unwrap();
        sched.schedule(SimDuration::from_millis(2), record("never")).unwrap();

        let summary = sched.run_until(SimTime::from_secs_f64(1.0), &mut log);
        assert!(summary.stopped_early);
        assert_eq!(summary.ended_at, SimTime::from_millis(1));
        assert_eq!(log.len(), 1);
    }

    // ─── Cancellation ───────────────────────────────────────────────────

    #[test]
    fn cancelled_event_does_not_fire() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let h = sched.schedule(SimDuration::from_millis(10), record("gone")).unwrap();
        assert!(sched.cancel(h));
        sched.run_until(SimTime::from_millis(100), &mut log);
        assert!(log.is_empty());
    }

    #[test]
    fn double_cancel_is_noop() {
        let mut sched: Scheduler<Log> = Scheduler::new();
        let h = sched.schedule(SimDuration::from_millis(10), record("x")).unwrap();
        assert!(sched.cancel(h));
        assert!(!sched.cancel(h));
    }

    #[test]
    fn cancel_after_fire_is_noop() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let h = sched.schedule(SimDuration::from_millis(10), record("x")).unwrap();
        sched.run_until(SimTime::from_millis(20), &mut log);
        assert!(!sched.cancel(h));
        assert!(!sched.is_pending(h));
    }

    // ─── Repeating ──────────────────────────────────────────────────────

    #[test]
    fn repeating_task_runs_every_period() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let handle = sched
            .schedule_repeating(
                SimDuration::from_millis(100),
                SimDuration::from_millis(100),
                |s, log: &mut Log| log.push((s.now().as_nanos(), "tick")),
            )
            .unwrap();

        sched.run_until(SimTime::from_millis(550), &mut log);
        let times: Vec<_> = log.iter().map(|(t, _)| t / 1_000_000).collect();
        assert_eq!(times, vec![100, 200, 300, 400, 500]);
        assert_eq!(handle.runs(), 5);
        assert_eq!(handle.next_fire_time(), Some(SimTime::from_millis(600)));
    }

    #[test]
    fn cancelled_repeating_task_stops() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let handle = sched
            .schedule_repeating(
                SimDuration::ZERO,
                SimDuration::from_millis(10),
                |_, log: &mut Log| log.push((0, "tick")),
            )
            .unwrap();
        sched.run_until(SimTime::from_millis(25), &mut log);
        handle.cancel(&mut sched);
        handle.cancel(&mut sched);
        sched.run_until(SimTime::from_millis(100), &mut log);

        assert_eq!(log.len(), 3);
        assert!(handle.is_cancelled());
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn repeating_task_stops_when_clock_would_overflow() {
        let mut sched = Scheduler::new();
        let mut log = Log::new();
        let late = SimTime::from_nanos(u64::MAX - 10);
        sched.schedule_at(late, record("late")).unwrap();
        sched.run_until(late, &mut log);

        let handle = sched
            .schedule_repeating(
                SimDuration::ZERO,
                SimDuration::from_nanos(100),
                |_, log: &mut Log| log.push((0, "tick")),
            )
            .unwrap();
        sched.run_until(SimTime::from_nanos(u64::MAX), &mut log);

        assert_eq!(handle.runs(), 1);
        assert!(handle.is_cancelled());
        assert_eq!(handle.next_fire_time(), None);
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn repeating_rejects_zero_period() {
        let mut sched: Scheduler<Log> = Scheduler::new();
        let err = sched
            .schedule_repeating(SimDuration::ZERO, SimDuration::ZERO, |_, _| {})
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidPeriod(_)));
    }
}
