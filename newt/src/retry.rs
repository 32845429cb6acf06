use core::ops::RangeInclusive;

use embedded_time::duration::Milliseconds;
use embedded_time::Instant;
use rand::{Rng, SeedableRng};

use crate::time::{self, Clock, Millis};

/// A non-blocking timer for exponential-backoff retries,
/// that lives alongside some operation to retry.
///
/// It does not _contain_ the work to be done; the owner
/// asks the timer what to do and performs the retry itself.
///
/// ```
/// use embedded_time::clock::Clock;
/// use embedded_time::duration::Milliseconds;
/// use newt::retry;
///
/// # main();
/// fn main() {
///   let mut called = false;
///   let mut fails_once = || -> Result<(), ()> {
///     // ...
///     # if !called {
///     #   called = true;
///     #   Err(())
///     # } else {
///     #   Ok(())
///     # }
///   };
///
///   let clock = newt::std::Clock::new();
///   let now = || clock.try_now().unwrap();
///   let strategy = retry::Strategy { init_min: Milliseconds(1),
///                                    init_max: Milliseconds(2),
///                                    factor: 2.0 };
///   let mut retry = retry::RetryTimer::new(now(), strategy, retry::Attempts(2));
///
///   while let Err(_) = fails_once() {
///     match nb::block!(retry.what_should_i_do(now())) {
///       | Ok(retry::YouShould::Retry) => continue,
///       | Ok(retry::YouShould::Cry) => panic!("no more attempts! it failed more than once!!"),
///       | Err(_) => unreachable!(),
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RetryTimer<C: Clock> {
  start: Instant<C>,
  init: Millis,
  strategy: Strategy,
  attempts: Attempts,
  max_attempts: Attempts,
}

/// A number of attempts
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u16);

/// Result of [`RetryTimer.what_should_i_do`].
///
/// This tells you if a retry should be attempted or not.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum YouShould {
  /// Attempts have been exhausted and the work that is
  /// being retried should be considered poisoned.
  Cry,
  /// A retry should be performed
  Retry,
}

impl<C: Clock> RetryTimer<C> {
  /// Create a new retrier
  ///
  /// The first attempt is assumed to happen at `start`.
  pub fn new(start: Instant<C>, strategy: Strategy, max_attempts: Attempts) -> Self {
    let init = if strategy.has_jitter() {
      let mut rand = rand_chacha::ChaCha8Rng::seed_from_u64(time::millis_since_epoch(start));
      Milliseconds(rand.gen_range(strategy.range()))
    } else {
      Milliseconds(*strategy.range().start())
    };

    Self { start,
           strategy,
           init,
           max_attempts,
           attempts: Attempts(1) }
  }

  /// When the thing we keep trying fails, invoke this to
  /// tell the retrytimer "it failed again! what do I do??"
  ///
  /// Returns `nb::Error::WouldBlock` when we have not yet
  /// waited the appropriate amount of time to retry.
  ///
  /// Once every attempt has been made, the timer waits one
  /// more backoff period before answering [`YouShould::Cry`],
  /// giving the final attempt as long to succeed as the ones before it.
  pub fn what_should_i_do(&mut self,
                          now: Instant<C>)
                          -> nb::Result<YouShould, core::convert::Infallible> {
    let ready = self.is_ready(Milliseconds(time::millis_between(self.start, now)),
                              self.attempts.0);

    match (ready, self.attempts >= self.max_attempts) {
      | (false, _) => Err(nb::Error::WouldBlock),
      | (true, true) => Ok(YouShould::Cry),
      | (true, false) => {
        self.attempts.0 += 1;
        Ok(YouShould::Retry)
      },
    }
  }

  /// Check if the strategy says an appropriate time has passed
  pub fn is_ready(&self, Milliseconds(time_passed): Millis, attempts: u16) -> bool {
    attempts == 0 || time_passed >= self.strategy.total_delay(self.init, attempts)
  }

  /// The instant at which [`RetryTimer::what_should_i_do`] will next
  /// stop blocking
  pub fn next_deadline(&self) -> Instant<C> {
    time::add_millis(self.start,
                     self.strategy.total_delay(self.init, self.attempts.0))
  }

  /// Number of attempts made so far
  pub fn attempts(&self) -> Attempts {
    self.attempts
  }

  /// The jittered initial delay this timer settled on
  pub fn init(&self) -> Millis {
    self.init
  }
}

/// Generate a random initial delay between `init_min` and `init_max`,
/// and wait until this delay has passed before the second attempt.
///
/// After each failed attempt, multiply the delay by `factor` before retrying again.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Strategy {
  /// Minimum (inclusive) delay for second attempt
  pub init_min: Millis,
  /// Maximum (inclusive) delay for second attempt
  pub init_max: Millis,
  /// Backoff multiplier
  pub factor: f32,
}

impl Strategy {
  /// Are min & max delays the same? if so, we should probably skip the random number generation.
  pub fn has_jitter(&self) -> bool {
    let rng = self.range();
    rng.start() != rng.end()
  }

  /// Get the min & max durations as an inclusive range
  pub fn range(&self) -> RangeInclusive<u64> {
    let Milliseconds(min) = self.init_min;
    let Milliseconds(max) = self.init_max;
    min..=max.max(min)
  }

  /// Get the amount of time this strategy will take if all attempts fail
  pub fn max_time(&self, max_attempts: Attempts) -> Millis {
    Milliseconds(self.total_delay(self.init_max, max_attempts.0))
  }

  /// Given the initial delay and number of attempts that have been performed,
  /// yields the time since the first attempt at which the next one is due.
  fn total_delay(&self, Milliseconds(init): Millis, attempt: u16) -> u64 {
    // | attempt | total delay         |
    // | 1       | init                |
    // | 2       | init * factor       |
    // | 3       | init * factor^2     |
    // | n       | init * factor^(n-1) |
    let exp = attempt.saturating_sub(1) as i32;
    (init as f64 * (self.factor as f64).powi(exp)) as u64
  }
}
