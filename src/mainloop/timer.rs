//! Monotonic min-heap of pending timer deadlines.
//!
//! Replaces the original's POSIX-timer-plus-`SIGUSR1` design (see
//! `spec.md` §9, "Signal-driven timers"): both `MainLoop` backends poll
//! this heap for the next deadline instead of installing a signal handler.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use super::{Disposition, MainLoopData, TimeoutCallback};

struct Entry {
  cb: TimeoutCallback,
  data: Option<MainLoopData>,
  interval: Duration,
}

/// Not `Sync` on its own; callers wrap it in a `Mutex`, held only across
/// table mutation, matching the MainLoop callback-table guard described in
/// `spec.md` §5.
pub(super) struct TimeoutManager {
  next_id: u64,
  entries: HashMap<u64, Entry>,
  deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
}

impl TimeoutManager {
  pub fn new() -> Self {
    TimeoutManager {
      next_id: 1,
      entries: HashMap::new(),
      deadlines: BinaryHeap::new(),
    }
  }

  pub fn add(&mut self, interval_ms: u64, cb: TimeoutCallback, data: Option<MainLoopData>) -> u64 {
    let id = self.next_id;
    self.next_id += 1;
    let interval = Duration::from_millis(interval_ms);
    self.deadlines.push(Reverse((Instant::now() + interval, id)));
    self.entries.insert(id, Entry { cb, data, interval });
    id
  }

  pub fn remove(&mut self, id: u64) {
    self.entries.remove(&id);
    // The stale heap entry (if any) is dropped lazily in `next_deadline`/`fire_due`.
  }

  /// How long the caller should block before the next timer is due, if any.
  pub fn next_deadline(&self) -> Option<Duration> {
    let now = Instant::now();
    self
      .deadlines
      .peek()
      .map(|Reverse((at, _))| at.saturating_duration_since(now))
  }

  /// Pops and fires every timer whose deadline has passed, rearming those
  /// that return `Disposition::Continue`.
  pub fn fire_due(&mut self) {
    let now = Instant::now();
    loop {
      match self.deadlines.peek() {
        Some(Reverse((at, _))) if *at <= now => {}
        _ => break,
      }
      let Reverse((_, id)) = self.deadlines.pop().expect("peeked above");

      let Some(entry) = self.entries.get_mut(&id) else {
        continue; // removed since it was scheduled
      };
      let disposition = (entry.cb)(entry.data.as_mut());
      match disposition {
        Disposition::Remove => {
          self.entries.remove(&id);
        }
        Disposition::Continue => {
          let interval = entry.interval;
          self.deadlines.push(Reverse((now + interval, id)));
        }
      }
    }
  }
}
