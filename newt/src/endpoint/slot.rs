use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::exchange::{Handler, Outcome};

/// A [`Handler`] that lets a thread wait for the outcome
/// of a request.
///
/// ```
/// use std::time::Duration;
///
/// use newt::endpoint::ResultSlot;
/// use newt::exchange::{Handler, Outcome};
///
/// let slot = ResultSlot::new();
/// assert_eq!(slot.wait(Duration::from_millis(1)), None);
///
/// slot.on_outcome(Outcome::Canceled);
/// assert_eq!(slot.wait(Duration::from_secs(1)), Some(Outcome::Canceled));
/// ```
#[derive(Debug, Default)]
pub struct ResultSlot {
  outcome: Mutex<Option<Outcome>>,
  filled: Condvar,
}

impl ResultSlot {
  /// Create an empty slot
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Has the outcome arrived?
  pub fn is_filled(&self) -> bool {
    self.outcome
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .is_some()
  }

  /// Block until the outcome arrives or `timeout` elapses.
  ///
  /// The outcome stays in the slot; waiting again yields it again.
  pub fn wait(&self, timeout: Duration) -> Option<Outcome> {
    let deadline = Instant::now() + timeout;
    let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);

    while outcome.is_none() {
      let left = match deadline.checked_duration_since(Instant::now()) {
        | Some(left) if !left.is_zero() => left,
        | _ => break,
      };

      outcome = self.filled
                    .wait_timeout(outcome, left)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
    }

    outcome.clone()
  }
}

impl Handler for ResultSlot {
  fn on_outcome(&self, outcome: Outcome) {
    *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    self.filled.notify_all();
  }
}
