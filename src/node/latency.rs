//! Latency capture windows.
//!
//! Each latency cell owns a *start* window (events logged at this stage) and
//! an *end* window (events logged when the previous stage hands over). The
//! owning thread appends events while a window is `Run`; the scheduler opens,
//! closes and drains windows by claiming them. State moves through a single
//! atomic so neither side ever takes a lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};

/// Events admitted per window before it closes as `Full`.
pub const LATENCY_WINDOW_SIZE: u32 = 100;

const IDLE: u8 = 0;
const RUN: u8 = 1;
const FULL: u8 = 2;
const STOP: u8 = 3;
const WRITING: u8 = 4;
const CLAIMED: u8 = 5;

/// Observable state of a [`LatencyWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Never opened.
    Idle,
    /// Admitting events.
    Run,
    /// Token budget exhausted.
    Full,
    /// Abandoned after its deadline ran out.
    Stop,
    /// An event is being appended.
    Writing,
    /// Held by the scheduler.
    Claimed,
}

impl WindowState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            RUN => Self::Run,
            FULL => Self::Full,
            STOP => Self::Stop,
            WRITING => Self::Writing,
            CLAIMED => Self::Claimed,
            _ => Self::Idle,
        }
    }
}

/// One captured `(correlation key, timestamp)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyEvent {
    pub key: u64,
    pub timestamp_ns: u64,
}

/// Window contents, reachable by the writer only in `Run` and by the
/// scheduler only through a [`WindowGuard`].
#[derive(Debug, Default)]
pub struct WindowData {
    /// Remaining admissions in the current window.
    pub token: u32,
    pub size: u32,
    /// Events of this window matched by the correlator.
    pub match_count: u64,
    pub events: Vec<LatencyEvent>,
}

pub struct LatencyWindow {
    state: AtomicU8,
    /// Countdown in scheduler ticks. Touched by the scheduler only.
    deadline: AtomicI32,
    data: UnsafeCell<WindowData>,
}

// SAFETY: `data` is only dereferenced by the thread that moved `state` into
// `WRITING` or `CLAIMED`, and that thread moves it out again before anyone
// else can.
unsafe impl Sync for LatencyWindow {}

impl Default for LatencyWindow {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
            deadline: AtomicI32::new(0),
            data: UnsafeCell::new(WindowData::default()),
        }
    }
}

impl LatencyWindow {
    pub fn state(&self) -> WindowState {
        WindowState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// True while the owning thread may still append.
    pub fn is_open(&self) -> bool {
        matches!(self.state(), WindowState::Run | WindowState::Writing)
    }

    /// Appends one event. Returns false when the window is not admitting.
    ///
    /// Never allocates: events beyond the capacity reserved at open time are
    /// refused, and the last admitted event closes the window as `Full`.
    #[inline]
    pub fn record(&self, key: u64, timestamp_ns: u64) -> bool {
        if self
            .state
            .compare_exchange(RUN, WRITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        // SAFETY: the successful RUN -> WRITING transition grants exclusive
        // access until the state is stored below.
        let data = unsafe { &mut *self.data.get() };
        let mut recorded = false;
        if data.token > 0 && data.events.len() < data.events.capacity() {
            data.events.push(LatencyEvent { key, timestamp_ns });
            data.token -= 1;
            recorded = true;
        }
        let next = if data.token == 0 { FULL } else { RUN };
        self.state.store(next, Ordering::Release);
        recorded
    }

    /// Takes the window for the scheduler if it is closed.
    pub fn claim(&self) -> Option<WindowGuard<'_>> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if !matches!(current, IDLE | FULL | STOP) {
                return None;
            }
            match self.state.compare_exchange_weak(
                current,
                CLAIMED,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(WindowGuard {
                        window: self,
                        restore: current,
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// True when the window is closed and every event it captured has been
    /// matched.
    pub fn drained(&self) -> bool {
        self.claim()
            .is_some_and(|mut guard| guard.data().events.is_empty())
    }

    /// Closes a running window without draining it.
    pub fn abandon(&self) -> bool {
        self.state
            .compare_exchange(RUN, STOP, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub fn deadline(&self) -> i32 {
        self.deadline.load(Ordering::Relaxed)
    }

    pub fn set_deadline(&self, ticks: i32) {
        self.deadline.store(ticks, Ordering::Relaxed);
    }

    /// Counts one scheduler tick off the deadline and returns the new value.
    pub fn tick_deadline(&self) -> i32 {
        let next = self.deadline().saturating_sub(1);
        self.set_deadline(next);
        next
    }
}

impl std::fmt::Debug for LatencyWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencyWindow")
            .field("state", &self.state())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Scheduler-side exclusive access to a closed window. Dropping it publishes
/// the previous state, or the state chosen through [`open`](Self::open) or
/// [`stop`](Self::stop).
pub struct WindowGuard<'a> {
    window: &'a LatencyWindow,
    restore: u8,
}

impl WindowGuard<'_> {
    /// State the window had when it was claimed.
    pub fn prior(&self) -> WindowState {
        WindowState::from_raw(self.restore)
    }

    pub fn data(&mut self) -> &mut WindowData {
        // SAFETY: the window is in `CLAIMED`, owned by this guard.
        unsafe { &mut *self.window.data.get() }
    }

    /// Starts a fresh window admitting `size` events.
    pub fn open(mut self, size: u32) {
        let data = self.data();
        data.events.clear();
        data.events.reserve(size as usize);
        data.size = size;
        data.token = size;
        self.restore = if size == 0 { FULL } else { RUN };
    }

    pub fn stop(mut self) {
        self.restore = STOP;
    }
}

impl Drop for WindowGuard<'_> {
    fn drop(&mut self) {
        self.window.state.store(self.restore, Ordering::Release);
    }
}

/// Start and end windows of one (index, stage) latency cell.
#[derive(Debug, Default)]
pub struct LatencyCell {
    pub start: LatencyWindow,
    pub end: LatencyWindow,
}

impl LatencyCell {
    /// True when either window is admitting events.
    pub fn is_open(&self) -> bool {
        self.start.is_open() || self.end.is_open()
    }

    pub fn drained(&self) -> bool {
        self.start.drained() && self.end.drained()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_window_refuses_events() {
        let window = LatencyWindow::default();
        assert_eq!(window.state(), WindowState::Idle);
        assert!(!window.record(1, 10));
    }

    #[test]
    fn test_open_admits_up_to_size_then_full() {
        let window = LatencyWindow::default();
        window.claim().expect("claim idle").open(3);
        assert_eq!(window.state(), WindowState::Run);

        assert!(window.record(1, 10));
        assert!(window.record(2, 20));
        assert!(window.record(3, 30));
        assert_eq!(window.state(), WindowState::Full);
        assert!(!window.record(4, 40));

        let mut guard = window.claim().expect("claim full");
        assert_eq!(guard.prior(), WindowState::Full);
        let data = guard.data();
        assert_eq!(data.token, 0);
        assert_eq!(data.events.len(), 3);
        assert_eq!(data.events[2], LatencyEvent { key: 3, timestamp_ns: 30 });
    }

    #[test]
    fn test_running_window_cannot_be_claimed() {
        let window = LatencyWindow::default();
        window.claim().expect("claim").open(LATENCY_WINDOW_SIZE);
        assert!(window.claim().is_none());
        assert!(window.abandon());
        assert_eq!(window.state(), WindowState::Stop);
        assert!(!window.abandon());
        assert!(window.claim().is_some());
    }

    #[test]
    fn test_guard_restores_prior_state() {
        let window = LatencyWindow::default();
        window.claim().expect("claim").stop();
        assert_eq!(window.state(), WindowState::Stop);
        {
            let guard = window.claim().expect("claim");
            assert_eq!(window.state(), WindowState::Claimed);
            assert_eq!(guard.prior(), WindowState::Stop);
        }
        assert_eq!(window.state(), WindowState::Stop);
    }

    #[test]
    fn test_reopen_clears_previous_events() {
        let window = LatencyWindow::default();
        window.claim().expect("claim").open(2);
        window.record(7, 1);
        window.record(8, 2);
        window.claim().expect("claim").open(2);
        let mut guard = window.claim();
        assert!(guard.is_none());
        assert!(window.abandon());
        guard = window.claim();
        let mut guard = guard.expect("claim stopped");
        assert!(guard.data().events.is_empty());
        assert_eq!(guard.data().token, 2);
    }

    #[test]
    fn test_deadline_ticks_down() {
        let window = LatencyWindow::default();
        window.set_deadline(2);
        assert_eq!(window.tick_deadline(), 1);
        assert_eq!(window.tick_deadline(), 0);
        assert_eq!(window.tick_deadline(), -1);
        window.set_deadline(i32::MIN);
        assert_eq!(window.tick_deadline(), i32::MIN);
    }

    #[test]
    fn test_cell_open_tracks_both_windows() {
        let cell = LatencyCell::default();
        assert!(!cell.is_open());
        cell.end.claim().expect("claim").open(1);
        assert!(cell.is_open());
        cell.end.record(1, 1);
        assert!(!cell.is_open());
    }
}
