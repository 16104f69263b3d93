//! Native `MainLoop` backend: a `poll(2)` loop over watch fds, an idle
//! queue, and a timer heap, exactly mirroring the original `PosixMainLoop`
//! (fd watches + idle dispatch + timers) minus the `SIGUSR1`/`timer_create`
//! machinery, which the min-heap in [`super::timer`] replaces.
//!
//! Built on `popol`, the same level-triggered `poll(2)` wrapper
//! `nakamoto-net-poll`'s `Reactor` uses, rather than `mio` — `mio`'s epoll
//! backend is edge-triggered by default, which would violate the
//! level-triggered watch contract `spec.md` §4.1 requires.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, trace, warn};

use super::timer::TimeoutManager;
use super::{
  Disposition, IdleCallback, MainLoop, MainLoopData, WatchCallback, WatchResult, WatchedFd,
};
use crate::error::{AittError, Result};

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
enum SourceKey {
  Watch(RawFd),
  Waker,
}

struct WatchEntry {
  cb: WatchCallback,
  data: Option<MainLoopData>,
}

struct IdleEntry {
  cb: IdleCallback,
  data: Option<MainLoopData>,
}

/// `poll(2)`-based reactor. One instance per thread; `run()` is not
/// re-entrant.
pub struct PollMainLoop {
  sources: Mutex<popol::Sources<SourceKey>>,
  waker: Arc<popol::Waker>,
  running: AtomicBool,
  quit_requested: AtomicBool,
  watches: Mutex<std::collections::HashMap<RawFd, WatchEntry>>,
  idle: Mutex<VecDeque<IdleEntry>>,
  timeouts: Mutex<TimeoutManager>,
}

impl PollMainLoop {
  pub fn new() -> io::Result<Self> {
    let mut sources = popol::Sources::new();
    let waker = Arc::new(popol::Waker::new(&mut sources, SourceKey::Waker)?);
    Ok(PollMainLoop {
      sources: Mutex::new(sources),
      waker,
      running: AtomicBool::new(false),
      quit_requested: AtomicBool::new(false),
      watches: Mutex::new(std::collections::HashMap::new()),
      idle: Mutex::new(VecDeque::new()),
      timeouts: Mutex::new(TimeoutManager::new()),
    })
  }

  fn wake(&self) {
    if let Err(e) = self.waker.wake() {
      warn!("PollMainLoop: waker.wake() failed: {e}");
    }
  }
}

impl Default for PollMainLoop {
  fn default() -> Self {
    Self::new().expect("PollMainLoop::new")
  }
}

impl MainLoop for PollMainLoop {
  fn run(&self) -> Result<()> {
    if self.running.swap(true, Ordering::SeqCst) {
      return Err(AittError::ResourceBusy("MainLoop::run is not re-entrant".into()));
    }
    self.quit_requested.store(false, Ordering::SeqCst);

    let mut events = popol::Events::new();

    loop {
      if self.quit_requested.load(Ordering::SeqCst) {
        break;
      }

      let timeout = {
        let mgr = self.timeouts.lock().expect("timeouts lock");
        mgr.next_deadline().unwrap_or(Duration::from_secs(60))
      };

      let result = {
        let mut sources = self.sources.lock().expect("sources lock");
        sources.wait_timeout(&mut events, timeout)
      };

      match result {
        Ok(()) => {
          for (key, ev) in events.iter() {
            match key {
              SourceKey::Waker => {
                popol::Waker::reset(ev.source).ok();
              }
              SourceKey::Watch(fd) => {
                let result = if ev.hangup {
                  WatchResult::Hangup
                } else if ev.errored || ev.invalid {
                  WatchResult::Error
                } else {
                  WatchResult::Okay
                };
                self.fire_watch(*fd, result);
              }
            }
          }
        }
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {
          // fall through to timer dispatch below
        }
        Err(e) => {
          self.running.store(false, Ordering::SeqCst);
          return Err(AittError::System(e));
        }
      }

      self.timeouts.lock().expect("timeouts lock").fire_due();

      let has_idle = !self.idle.lock().expect("idle lock").is_empty();
      if has_idle {
        self.fire_one_idle();
        if !self.idle.lock().expect("idle lock").is_empty() {
          self.wake();
        }
      }
    }

    self.running.store(false, Ordering::SeqCst);
    Ok(())
  }

  fn quit(&self) -> bool {
    if !self.running.load(Ordering::SeqCst) {
      error!("MainLoop::quit: loop is not running");
      return false;
    }
    self.quit_requested.store(true, Ordering::SeqCst);
    self.wake();
    true
  }

  fn add_idle(&self, cb: IdleCallback, data: Option<MainLoopData>) {
    self.idle.lock().expect("idle lock").push_back(IdleEntry { cb, data });
    self.wake();
  }

  fn add_watch(&self, fd: RawFd, cb: WatchCallback, data: Option<MainLoopData>) {
    {
      let mut sources = self.sources.lock().expect("sources lock");
      sources.register(SourceKey::Watch(fd), &WatchedFd(fd), popol::interest::READ);
    }
    self
      .watches
      .lock()
      .expect("watches lock")
      .insert(fd, WatchEntry { cb, data });
    self.wake();
  }

  fn remove_watch(&self, fd: RawFd) -> Option<MainLoopData> {
    self.sources.lock().expect("sources lock").unregister(&SourceKey::Watch(fd));
    let entry = self.watches.lock().expect("watches lock").remove(&fd);
    self.wake();
    entry.and_then(|e| e.data)
  }

  fn add_timeout(
    &self,
    interval_ms: u64,
    cb: super::TimeoutCallback,
    data: Option<MainLoopData>,
  ) -> u64 {
    let id = self.timeouts.lock().expect("timeouts lock").add(interval_ms, cb, data);
    self.wake();
    id
  }

  fn remove_timeout(&self, id: u64) {
    self.timeouts.lock().expect("timeouts lock").remove(id);
  }
}

impl PollMainLoop {
  fn fire_watch(&self, fd: RawFd, result: WatchResult) {
    let mut entry = {
      let mut watches = self.watches.lock().expect("watches lock");
      match watches.remove(&fd) {
        Some(e) => e,
        None => {
          trace!("PollMainLoop: event for unknown fd {fd}, ignoring");
          return;
        }
      }
    };
    let disposition = (entry.cb)(result, fd, entry.data.as_mut());
    let remove = disposition == Disposition::Remove
      || result == WatchResult::Hangup
      || result == WatchResult::Error;
    if remove {
      self.remove_watch(fd);
    } else {
      self.watches.lock().expect("watches lock").insert(fd, entry);
    }
  }

  fn fire_one_idle(&self) {
    let mut entry = {
      let mut idle = self.idle.lock().expect("idle lock");
      match idle.pop_front() {
        Some(e) => e,
        None => return,
      }
    };
    let disposition = (entry.cb)(entry.data.as_mut());
    if disposition == Disposition::Continue {
      self.idle.lock().expect("idle lock").push_front(entry);
    }
  }
}
