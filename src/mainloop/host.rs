//! `smol`-backed `MainLoop`, standing in for "an embedding host event loop"
//! the way the original's `GlibMainLoopHandler` stands in for GLib. Every
//! callback still runs on the thread that calls `run()`: each iteration
//! races fd-readability futures, an idle tick, and the next timer deadline,
//! then `smol::block_on`s the winner and dispatches inline, so there is no
//! hand-off to a worker thread to reason about.
//!
//! Unlike [`super::poll::PollMainLoop`], a fresh `async_io::Async` wrapper is
//! created per watched fd on every iteration; cheap enough for the fd counts
//! this crate deals with (a handful of TCP/UDP sockets per facade), but
//! worth revisiting if that changes.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_io::Async;
use log::{error, trace};
use smol::Timer;

use super::{
  Disposition, IdleCallback, MainLoop, MainLoopData, TimeoutCallback, WatchCallback, WatchResult,
  WatchedFd,
};
use super::timer::TimeoutManager;
use crate::error::{AittError, Result};

struct WatchEntry {
  cb: WatchCallback,
  data: Option<MainLoopData>,
}

struct IdleEntry {
  cb: IdleCallback,
  data: Option<MainLoopData>,
}

enum HostEvent {
  Watch(RawFd),
  TimerDue,
  Idle,
  Woken,
}

/// `MainLoop` backend driven by `smol`/`async-io` instead of a raw `poll(2)`
/// loop. Gated behind the `host-loop` feature.
pub struct HostMainLoop {
  running: AtomicBool,
  quit_requested: AtomicBool,
  waker: smol::channel::Sender<()>,
  woken: smol::channel::Receiver<()>,
  watches: Mutex<std::collections::HashMap<RawFd, WatchEntry>>,
  idle: Mutex<VecDeque<IdleEntry>>,
  timeouts: Mutex<TimeoutManager>,
}

impl HostMainLoop {
  pub fn new() -> Self {
    let (waker, woken) = smol::channel::bounded(1);
    HostMainLoop {
      running: AtomicBool::new(false),
      quit_requested: AtomicBool::new(false),
      waker,
      woken,
      watches: Mutex::new(std::collections::HashMap::new()),
      idle: Mutex::new(VecDeque::new()),
      timeouts: Mutex::new(TimeoutManager::new()),
    }
  }

  fn wake(&self) {
    let _ = self.waker.try_send(());
  }

  async fn wait_once(&self, timeout: Duration, idle_pending: bool) -> HostEvent {
    let watch_fds: Vec<RawFd> = self.watches.lock().expect("watches lock").keys().copied().collect();

    let timer_fut = async move {
      Timer::after(timeout).await;
      HostEvent::TimerDue
    };

    let woken_fut = async {
      let _ = self.woken.recv().await;
      HostEvent::Woken
    };

    let mut combined: std::pin::Pin<Box<dyn std::future::Future<Output = HostEvent>>> =
      Box::pin(smol::future::race(timer_fut, woken_fut));

    for fd in watch_fds {
      let watch_fut = async move {
        if let Ok(source) = Async::new(WatchedFd(fd)) {
          let _ = source.readable().await;
        }
        HostEvent::Watch(fd)
      };
      combined = Box::pin(smol::future::race(combined, watch_fut));
    }

    if idle_pending {
      let idle_fut = async {
        smol::future::yield_now().await;
        HostEvent::Idle
      };
      combined = Box::pin(smol::future::race(combined, idle_fut));
    }

    combined.await
  }

  fn fire_watch(&self, fd: RawFd) {
    let mut entry = {
      let mut watches = self.watches.lock().expect("watches lock");
      match watches.remove(&fd) {
        Some(e) => e,
        None => {
          trace!("HostMainLoop: event for unknown fd {fd}, ignoring");
          return;
        }
      }
    };
    // `Async::readable()` can't distinguish a clean hangup from ordinary
    // readability; the callback finds out the hard way, same as a real
    // level-triggered `POLLIN` that happens to coincide with `POLLHUP`.
    let disposition = (entry.cb)(WatchResult::Okay, fd, entry.data.as_mut());
    if disposition == Disposition::Remove {
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

impl Default for HostMainLoop {
  fn default() -> Self {
    Self::new()
  }
}

impl MainLoop for HostMainLoop {
  fn run(&self) -> Result<()> {
    if self.running.swap(true, Ordering::SeqCst) {
      return Err(AittError::ResourceBusy("MainLoop::run is not re-entrant".into()));
    }
    self.quit_requested.store(false, Ordering::SeqCst);

    loop {
      if self.quit_requested.load(Ordering::SeqCst) {
        break;
      }

      let timeout = {
        let mgr = self.timeouts.lock().expect("timeouts lock");
        mgr.next_deadline().unwrap_or(Duration::from_secs(60))
      };
      let has_idle = !self.idle.lock().expect("idle lock").is_empty();

      match smol::block_on(self.wait_once(timeout, has_idle)) {
        HostEvent::Watch(fd) => self.fire_watch(fd),
        HostEvent::Idle => self.fire_one_idle(),
        HostEvent::TimerDue | HostEvent::Woken => {}
      }

      self.timeouts.lock().expect("timeouts lock").fire_due();
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
    self.watches.lock().expect("watches lock").insert(fd, WatchEntry { cb, data });
    self.wake();
  }

  fn remove_watch(&self, fd: RawFd) -> Option<MainLoopData> {
    let entry = self.watches.lock().expect("watches lock").remove(&fd);
    self.wake();
    entry.and_then(|e| e.data)
  }

  fn add_timeout(&self, interval_ms: u64, cb: TimeoutCallback, data: Option<MainLoopData>) -> u64 {
    let id = self.timeouts.lock().expect("timeouts lock").add(interval_ms, cb, data);
    self.wake();
    id
  }

  fn remove_timeout(&self, id: u64) {
    self.timeouts.lock().expect("timeouts lock").remove(id);
  }
}
