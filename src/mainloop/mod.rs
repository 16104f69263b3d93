//! Single-threaded cooperative reactor: idle tasks, fd watches, timers.
//!
//! `MainLoop` is implemented twice: [`poll::PollMainLoop`] runs a native
//! `popol`-based poll loop, [`host::HostMainLoop`] (feature `host-loop`) maps
//! the same operations onto the `smol` executor, standing in for "an
//! embedding host event loop" the way the original's `GlibMainLoopHandler`
//! stands in for GLib. Both share the [`timer::TimeoutManager`] min-heap so
//! neither implementation needs a signal handler.

pub mod poll;
mod timer;

#[cfg(feature = "host-loop")]
pub mod host;

use std::any::Any;
use std::os::unix::io::RawFd;

use crate::error::Result;

/// What a callback wants done with its own source after it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
  Remove,
  Continue,
}

/// Why a watch callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchResult {
  Okay,
  Error,
  Hangup,
  Removed,
}

/// Opaque user data attached to a source. Handed back to the callback on
/// every invocation and returned verbatim by `remove_watch`.
pub type MainLoopData = Box<dyn Any + Send>;

pub type IdleCallback = Box<dyn FnMut(Option<&mut MainLoopData>) -> Disposition + Send>;
pub type WatchCallback =
  Box<dyn FnMut(WatchResult, RawFd, Option<&mut MainLoopData>) -> Disposition + Send>;
pub type TimeoutCallback = Box<dyn FnMut(Option<&mut MainLoopData>) -> Disposition + Send>;

/// The reactor contract. Both backends implement the same seven operations.
pub trait MainLoop {
  /// Blocks until `quit()`. Not re-entrant: calling `run` from within a
  /// callback running on this loop is a programming error.
  fn run(&self) -> Result<()>;

  /// Requests termination. Idempotent; returns `false` if the loop was not
  /// running.
  fn quit(&self) -> bool;

  /// Fires on the next cycle, and every cycle after that while the
  /// callback keeps returning `Disposition::Continue` (matching the
  /// original `PosixMainLoop::CheckIdle`, which only dequeues an idle
  /// entry once its callback returns `AITT_LOOP_EVENT_REMOVE`).
  fn add_idle(&self, cb: IdleCallback, data: Option<MainLoopData>);

  /// Level-triggered watch on `fd`. On `HANGUP`/`ERROR` the callback runs
  /// once with the matching result and the watch is removed automatically.
  fn add_watch(&self, fd: RawFd, cb: WatchCallback, data: Option<MainLoopData>);

  /// Returns the user data stored for `fd`; a no-op (returns `None`) if no
  /// watch is registered for it.
  fn remove_watch(&self, fd: RawFd) -> Option<MainLoopData>;

  /// Rearms after each `Disposition::Continue`. Returns an id usable with
  /// `remove_timeout`.
  fn add_timeout(&self, interval_ms: u64, cb: TimeoutCallback, data: Option<MainLoopData>) -> u64;

  fn remove_timeout(&self, id: u64);
}

/// Adapter so a bare `RawFd` (we don't own the underlying socket/file) can
/// be registered with a poll source that wants `AsRawFd`.
pub(crate) struct WatchedFd(pub RawFd);

impl std::os::unix::io::AsRawFd for WatchedFd {
  fn as_raw_fd(&self) -> RawFd {
    self.0
  }
}
