use embedded_time::duration::Milliseconds;
use embedded_time::Instant;

/// A duration, in milliseconds
pub type Millis = Milliseconds<u64>;

/// Supertrait of [`embedded_time::Clock`] pinning the
/// type of "ticks" to u64
pub trait Clock:
  embedded_time::Clock<T = u64> + core::fmt::Debug + Send + Sync + 'static
{
}

impl<C> Clock for C where C: embedded_time::Clock<T = u64> + core::fmt::Debug + Send + Sync + 'static
{
}

/// Milliseconds elapsed between `earlier` and `later`,
/// saturating to zero if `later` is actually earlier.
pub fn millis_between<C: Clock>(earlier: Instant<C>, later: Instant<C>) -> u64 {
  later.checked_duration_since(&earlier)
       .and_then(|d| Millis::try_from(d).ok())
       .map(|Milliseconds(ms)| ms)
       .unwrap_or(0)
}

/// Milliseconds since the clock's epoch
pub fn millis_since_epoch<C: Clock>(t: Instant<C>) -> u64 {
  Millis::try_from(t.duration_since_epoch()).map(|Milliseconds(ms)| ms)
                                            .unwrap_or(0)
}

/// `t` plus some number of milliseconds, saturating at `t`
/// if the sum is not representable.
pub fn add_millis<C: Clock>(t: Instant<C>, ms: u64) -> Instant<C> {
  t.checked_add(Milliseconds(ms)).unwrap_or(t)
}

/// Data associated with a timestamp
pub struct Stamped<C: Clock, T>(pub T, pub Instant<C>);

impl<C: Clock, T: core::fmt::Debug> core::fmt::Debug for Stamped<C, T> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_tuple("Stamped")
     .field(&self.0)
     .field(&format!("<{}ms since epoch>", millis_since_epoch(self.1)))
     .finish()
  }
}

impl<C: Clock, T: PartialEq> PartialEq for Stamped<C, T> {
  fn eq(&self, other: &Self) -> bool {
    self.0 == other.0 && self.1 == other.1
  }
}

impl<C: Clock, T: Clone> Clone for Stamped<C, T> {
  fn clone(&self) -> Self {
    Self(self.0.clone(), self.1)
  }
}

impl<C: Clock, T> Stamped<C, T> {
  /// Stamp some data with a time
  pub fn new(t: T, time: Instant<C>) -> Self {
    Self(t, time)
  }

  /// Borrow the data
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the data
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// When the data was stamped
  pub fn time(&self) -> Instant<C> {
    self.1
  }

  /// Has more than `ms` elapsed between the stamp and `now`?
  pub fn older_than(&self, now: Instant<C>, ms: u64) -> bool {
    millis_between(self.1, now) > ms
  }

  /// Discard the timestamp
  pub fn discard_timestamp(self) -> T {
    self.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test::ClockMock;

  #[test]
  fn stamped_age() {
    let clock = ClockMock::new();
    let stamped = Stamped::new("dgram", clock.instant(1_000));

    assert!(!stamped.older_than(clock.instant(1_500), 500));
    assert!(stamped.older_than(clock.instant(1_501), 500));
    assert!(!stamped.older_than(clock.instant(10), 0));
    assert_eq!(stamped.discard_timestamp(), "dgram");
  }

  #[test]
  fn arithmetic() {
    let clock = ClockMock::new();
    assert_eq!(millis_between(clock.instant(2_000), clock.instant(4_500)), 2_500);
    assert_eq!(millis_between(clock.instant(4_500), clock.instant(2_000)), 0);
    assert_eq!(millis_since_epoch(add_millis(clock.instant(100), 50)), 150);
  }
}
