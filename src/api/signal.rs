//! Cooperative cancellation signals.
//!
//! An [`AbortController`] owns the right to abort; any number of
//! [`AbortSignal`] clones observe it. [`merge`] combines two signals into one
//! that fires when either source fires.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

type Listener = Box<dyn FnOnce() + Send>;

struct SignalState {
  aborted: AtomicBool,
  notify: Notify,
  listeners: Mutex<Vec<Listener>>,
}

/// Read side of a cancellation token.
#[derive(Clone)]
pub struct AbortSignal {
  state: Arc<SignalState>,
}

impl AbortSignal {
  fn new() -> Self {
    Self {
      state: Arc::new(SignalState {
        aborted: AtomicBool::new(false),
        notify: Notify::new(),
        listeners: Mutex::new(Vec::new()),
      }),
    }
  }

  /// A signal that is already aborted.
  pub fn aborted_signal() -> Self {
    let signal = Self::new();
    signal.state.aborted.store(true, Ordering::SeqCst);
    signal
  }

  pub fn is_aborted(&self) -> bool {
    self.state.aborted.load(Ordering::SeqCst)
  }

  /// Resolves once the signal has been aborted. Returns immediately if it
  /// already was.
  pub async fn aborted(&self) {
    let notified = self.state.notify.notified();
    tokio::pin!(notified);
    // Register interest before checking the flag so an abort racing with
    // this call is never missed.
    notified.as_mut().enable();
    if self.is_aborted() {
      return;
    }
    notified.await;
  }

  /// Register a callback run exactly once when the signal aborts.
  ///
  /// If the signal is already aborted the callback runs immediately on the
  /// calling thread.
  pub fn on_abort<F>(&self, listener: F)
  where
    F: FnOnce() + Send + 'static,
  {
    let mut listeners = self
      .state
      .listeners
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    if self.is_aborted() {
      drop(listeners);
      listener();
      return;
    }
    listeners.push(Box::new(listener));
  }

  fn trigger(&self) {
    if self.state.aborted.swap(true, Ordering::SeqCst) {
      return;
    }
    let listeners = std::mem::take(
      &mut *self
        .state
        .listeners
        .lock()
        .unwrap_or_else(PoisonError::into_inner),
    );
    self.state.notify.notify_waiters();
    for listener in listeners {
      listener();
    }
  }
}

impl fmt::Debug for AbortSignal {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("AbortSignal")
      .field("aborted", &self.is_aborted())
      .finish()
  }
}

/// Write side of a cancellation token.
#[derive(Debug, Clone)]
pub struct AbortController {
  signal: AbortSignal,
}

impl AbortController {
  pub fn new() -> Self {
    Self {
      signal: AbortSignal::new(),
    }
  }

  pub fn signal(&self) -> AbortSignal {
    self.signal.clone()
  }

  /// Abort the signal. Subsequent calls are no-ops.
  pub fn abort(&self) {
    self.signal.trigger();
  }
}

impl Default for AbortController {
  fn default() -> Self {
    Self::new()
  }
}

/// Combine two signals into one that aborts when either input aborts.
///
/// When either input is already aborted the result is an already-aborted
/// signal and no listeners are registered. Otherwise a listener is attached
/// to each input; listeners are never detached, which is fine for
/// request-scoped signals.
pub fn merge(a: &AbortSignal, b: &AbortSignal) -> AbortSignal {
  if a.is_aborted() || b.is_aborted() {
    return AbortSignal::aborted_signal();
  }

  let controller = AbortController::new();
  for source in [a, b] {
    let controller = controller.clone();
    source.on_abort(move || controller.abort());
  }
  controller.signal()
}
