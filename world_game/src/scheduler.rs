//! One-shot and repeating timers of a game loop.
//!
//! The scheduler only orders work; it never runs callbacks itself. The game
//! pulls the due timer IDs, takes each task out, runs it with `&mut Game`, and
//! hands repeating tasks back. Deadlines use `tokio::time::Instant` so a paused
//! test clock drives them.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::game::Game;

/// One-shot callback run on the game loop.
pub type Callback = Box<dyn FnOnce(&mut Game) -> anyhow::Result<()> + Send>;

/// Repeating callback run on the game loop.
pub type RepeatingCallback = Box<dyn FnMut(&mut Game) -> anyhow::Result<()> + Send>;

/// Handle used to cancel a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer{}", self.0)
    }
}

pub(crate) enum TimerTask {
    Once(Callback),
    Repeat {
        interval: Duration,
        cb: RepeatingCallback,
    },
}

const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Default)]
pub struct Scheduler {
    next_id: u64,
    queue: BinaryHeap<Reverse<(Instant, TimerId)>>,
    tasks: HashMap<TimerId, TimerTask>,
    running: Option<TimerId>,
    cancel_running: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn schedule(&mut self, at: Instant, task: TimerTask) -> TimerId {
        self.next_id += 1;
        let id = TimerId(self.next_id);
        self.queue.push(Reverse((at, id)));
        self.tasks.insert(id, task);
        id
    }

    pub fn add_callback(&mut self, delay: Duration, cb: Callback) -> TimerId {
        self.schedule(Instant::now() + delay, TimerTask::Once(cb))
    }

    /// Runs `cb` every `interval` (at least 1ms) until cancelled.
    pub fn add_timer(&mut self, interval: Duration, cb: RepeatingCallback) -> TimerId {
        let interval = interval.max(MIN_INTERVAL);
        self.schedule(Instant::now() + interval, TimerTask::Repeat { interval, cb })
    }

    /// Cancels a pending timer. A repeating timer may cancel itself from its
    /// own callback. Returns whether anything was cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        if self.tasks.remove(&id).is_some() {
            return true;
        }
        if self.running == Some(id) {
            self.cancel_running = true;
            return true;
        }
        false
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.tasks.contains_key(&id) || (self.running == Some(id) && !self.cancel_running)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, id))) = self.queue.peek().copied() {
            if self.tasks.contains_key(&id) {
                return Some(at);
            }
            self.queue.pop();
        }
        None
    }

    /// Pops the IDs of every timer due at `now`, earliest first.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<TimerId> {
        let mut due = Vec::new();
        while let Some(Reverse((at, id))) = self.queue.peek().copied() {
            if at > now {
                break;
            }
            self.queue.pop();
            if self.tasks.contains_key(&id) {
                due.push(id);
            }
        }
        due
    }

    pub(crate) fn take(&mut self, id: TimerId) -> Option<TimerTask> {
        let task = self.tasks.remove(&id)?;
        if matches!(task, TimerTask::Repeat { .. }) {
            self.running = Some(id);
            self.cancel_running = false;
        }
        Some(task)
    }

    /// Re-arms a repeating timer after its run unless it cancelled itself.
    pub(crate) fn finish_repeat(
        &mut self,
        id: TimerId,
        interval: Duration,
        cb: RepeatingCallback,
        now: Instant,
    ) {
        let cancelled = self.running == Some(id) && self.cancel_running;
        self.running = None;
        self.cancel_running = false;
        if !cancelled {
            self.queue.push(Reverse((now + interval, id)));
            self.tasks.insert(id, TimerTask::Repeat { interval, cb });
        }
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.tasks.len())
            .field("running", &self.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Callback {
        Box::new(|_| Ok(()))
    }

    #[tokio::test(start_paused = true)]
    async fn due_in_deadline_order() {
        let mut s = Scheduler::new();
        let late = s.add_callback(Duration::from_millis(20), noop());
        let early = s.add_callback(Duration::from_millis(10), noop());
        assert!(s.take_due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_millis(25)).await;
        assert_eq!(s.take_due(Instant::now()), vec![early, late]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timers_never_come_due() {
        let mut s = Scheduler::new();
        let a = s.add_callback(Duration::from_millis(5), noop());
        let b = s.add_callback(Duration::from_millis(10), noop());
        assert!(s.cancel(a));
        assert!(!s.cancel(a));
        assert_eq!(s.next_deadline(), Some(Instant::now() + Duration::from_millis(10)));

        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(s.take_due(Instant::now()), vec![b]);
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_can_cancel_itself() {
        let mut s = Scheduler::new();
        let t = s.add_timer(Duration::from_millis(10), Box::new(|_| Ok(())));
        tokio::time::advance(Duration::from_millis(10)).await;
        let now = Instant::now();
        assert_eq!(s.take_due(now), vec![t]);

        let Some(TimerTask::Repeat { interval, cb }) = s.take(t) else {
            panic!("expected a repeating task");
        };
        assert!(s.is_pending(t));
        assert!(s.cancel(t));
        s.finish_repeat(t, interval, cb, now);
        assert!(!s.is_pending(t));
        assert!(s.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeating_timer_rearms() {
        let mut s = Scheduler::new();
        let t = s.add_timer(Duration::ZERO, Box::new(|_| Ok(())));
        tokio::time::advance(Duration::from_millis(1)).await;
        let now = Instant::now();
        assert_eq!(s.take_due(now), vec![t]);
        let Some(TimerTask::Repeat { interval, cb }) = s.take(t) else {
            panic!("expected a repeating task");
        };
        assert_eq!(interval, MIN_INTERVAL);
        s.finish_repeat(t, interval, cb, now);
        assert_eq!(s.next_deadline(), Some(now + MIN_INTERVAL));
    }
}
