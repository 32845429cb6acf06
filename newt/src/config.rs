use embedded_time::duration::Milliseconds;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::net::Transport;
use crate::retry::{Attempts, Strategy};
use crate::time::Millis;

/// Configuration options related to retransmitting outbound CON messages
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Con {
  /// Initial time to wait for an ACK before retransmitting.
  ///
  /// Defaults to 2 seconds.
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::Con;
  ///
  /// assert_eq!(Con::default().ack_timeout, Milliseconds(2_000u64));
  /// ```
  #[cfg_attr(feature = "serde", serde(with = "millis"))]
  pub ack_timeout: Millis,
  /// The initial timeout is a random duration between `ack_timeout`
  /// and `ack_timeout * ack_random_factor`.
  ///
  /// Defaults to 1.5
  /// ```
  /// use newt::config::Con;
  ///
  /// assert_eq!(Con::default().ack_random_factor, 1.5);
  /// ```
  pub ack_random_factor: f32,
  /// Multiplier applied to the timeout after each retransmission.
  ///
  /// Defaults to 2.0
  /// ```
  /// use newt::config::Con;
  ///
  /// assert_eq!(Con::default().backoff_factor, 2.0);
  /// ```
  pub backoff_factor: f32,
  /// Number of times we are allowed to resend a CON message
  /// before erroring.
  ///
  /// Defaults to 4 retransmissions (5 transmissions total).
  /// ```
  /// use newt::config::Con;
  ///
  /// assert_eq!(Con::default().max_retransmit, 4);
  /// ```
  pub max_retransmit: u16,
}

impl Default for Con {
  fn default() -> Self {
    Con { ack_timeout: Milliseconds(2_000),
          ack_random_factor: 1.5,
          backoff_factor: 2.0,
          max_retransmit: 4 }
  }
}

impl Con {
  /// The retry strategy described by this config
  pub fn retry_strategy(&self) -> Strategy {
    let Milliseconds(init) = self.ack_timeout;
    Strategy { init_min: self.ack_timeout,
               init_max: Milliseconds((init as f64 * self.ack_random_factor as f64) as u64),
               factor: self.backoff_factor }
  }

  /// Total number of transmissions allowed for a CON message
  pub fn max_attempts(&self) -> Attempts {
    Attempts(self.max_retransmit.saturating_add(1))
  }
}

/// Configuration options related to blockwise transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Block {
  /// Block size used for outbound bodies that don't fit in one message.
  ///
  /// Defaults to 1024
  /// ```
  /// use newt::config::Block;
  ///
  /// assert_eq!(Block::default().default_size, 1024);
  /// ```
  pub default_size: u16,
  /// Largest block size we will agree to when a peer
  /// sends or requests blocks.
  ///
  /// Defaults to 1024
  pub max_size: u16,
  /// Largest body we will reassemble from blocks.
  ///
  /// Defaults to 8192
  /// ```
  /// use newt::config::Block;
  ///
  /// assert_eq!(Block::default().max_body_size, 8192);
  /// ```
  pub max_body_size: usize,
}

impl Default for Block {
  fn default() -> Self {
    Block { default_size: 1024,
            max_size: 1024,
            max_body_size: 8192 }
  }
}

/// Runtime config
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
  /// See [`Con`]
  pub con: Con,
  /// See [`Block`]
  pub block: Block,
  /// How long a (peer, message id) pair is remembered for
  /// deduplication.
  ///
  /// When `None` (the default) this is derived from the retransmission
  /// settings, see [`Config::exchange_lifetime_millis`].
  #[cfg_attr(feature = "serde", serde(with = "opt_millis"))]
  pub exchange_lifetime: Option<Millis>,
  /// Maximum number of exchanges that may be active at once
  ///
  /// Defaults to 10,000
  /// ```
  /// use newt::config::Config;
  ///
  /// assert_eq!(Config::default().max_active_exchanges, 10_000);
  /// ```
  pub max_active_exchanges: usize,
  /// Seed used to generate message [`Token`](newt_msg::Token)s
  /// and the first message id.
  ///
  /// Defaults to a random integer. Endpoints sharing a seed hand
  /// out the same tokens; pin it only where reproducible tokens
  /// matter more than that.
  pub token_seed: u16,
  /// The transport this endpoint runs over
  ///
  /// Defaults to [`Transport::Datagram`]
  pub transport: Transport,
  /// Every n-th observe notification is sent CONfirmable,
  /// the rest NON. `0` sends every notification NON.
  ///
  /// Defaults to 8
  pub notification_con_interval: u32,
}

impl Default for Config {
  fn default() -> Self {
    Config { con: Con::default(),
             block: Block::default(),
             exchange_lifetime: None,
             max_active_exchanges: 10_000,
             token_seed: rand::random(),
             transport: Transport::Datagram,
             notification_con_interval: 8 }
  }
}

/// A [`Config`] that cannot work
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
pub enum ConfigError {
  /// Block sizes must be a power of two between 16 and 1024
  #[error("{0} is not a valid block size")]
  InvalidBlockSize(u16),
  /// `block.max_size` was smaller than `block.default_size`
  #[error("max block size {max} is smaller than default block size {default}")]
  MaxBlockSmallerThanDefault {
    #[allow(missing_docs)]
    default: u16,
    #[allow(missing_docs)]
    max: u16,
  },
  /// Random & backoff factors must be at least 1
  #[error("factor {0} must be >= 1.0")]
  FactorBelowOne(f32),
  /// `max_active_exchanges` was zero
  #[error("max_active_exchanges must be nonzero")]
  NoExchanges,
}

impl Config {
  /// Check that this config is usable
  ///
  /// ```
  /// use newt::config::{Config, ConfigError};
  ///
  /// assert_eq!(Config::default().validate(), Ok(()));
  ///
  /// let mut cfg = Config::default();
  /// cfg.block.default_size = 500;
  /// assert_eq!(cfg.validate(), Err(ConfigError::InvalidBlockSize(500)));
  /// ```
  pub fn validate(&self) -> Result<(), ConfigError> {
    use newt_msg::Block as B;

    [self.block.default_size, self.block.max_size].into_iter()
                                                  .find(|s| !B::is_valid_size(*s))
                                                  .map(|s| Err(ConfigError::InvalidBlockSize(s)))
                                                  .unwrap_or(Ok(()))?;

    if self.block.max_size < self.block.default_size {
      return Err(ConfigError::MaxBlockSmallerThanDefault { default: self.block.default_size,
                                                           max: self.block.max_size });
    }

    [self.con.ack_random_factor, self.con.backoff_factor].into_iter()
                                                         .find(|f| *f < 1.0)
                                                         .map(|f| Err(ConfigError::FactorBelowOne(f)))
                                                         .unwrap_or(Ok(()))?;

    match self.max_active_exchanges {
      | 0 => Err(ConfigError::NoExchanges),
      | _ => Ok(()),
    }
  }

  /// Time from the first transmission of a CON message
  /// to its last retransmission
  pub fn max_transmit_span_millis(&self) -> u64 {
    self.con
        .retry_strategy()
        .max_time(Attempts(self.con.max_retransmit))
        .0
  }

  /// Time from the first transmission of a CON message
  /// to giving up on it
  pub fn max_transmit_wait_millis(&self) -> u64 {
    self.con.retry_strategy().max_time(self.con.max_attempts()).0
  }

  /// Longest time a datagram is expected to spend in flight
  pub fn max_latency_millis(&self) -> u64 {
    100_000
  }

  /// Time a peer may take between receiving a CON and ACKing it
  pub fn processing_delay_millis(&self) -> u64 {
    self.con.ack_timeout.0
  }

  /// How long message ids are remembered for deduplication,
  /// and how long an unanswered request waits before timing out.
  ///
  /// ```
  /// use embedded_time::duration::Milliseconds;
  /// use newt::config::Config;
  ///
  /// // 2000ms * 1.5 * 2^3 + 2 * 100_000ms + 2000ms
  /// assert_eq!(Config::default().exchange_lifetime_millis(), 226_000);
  ///
  /// let cfg = Config { exchange_lifetime: Some(Milliseconds(5_000)),
  ///                    ..Config::default() };
  /// assert_eq!(cfg.exchange_lifetime_millis(), 5_000);
  /// ```
  pub fn exchange_lifetime_millis(&self) -> u64 {
    match self.exchange_lifetime {
      | Some(Milliseconds(ms)) => ms,
      | None => {
        self.max_transmit_span_millis()
        + (2 * self.max_latency_millis())
        + self.processing_delay_millis()
      },
    }
  }
}

#[cfg(feature = "serde")]
mod millis {
  use embedded_time::duration::Milliseconds;
  use serde::{Deserialize, Deserializer, Serializer};

  use crate::time::Millis;

  pub(super) fn serialize<S: Serializer>(m: &Millis, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(m.0)
  }

  pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Millis, D::Error> {
    u64::deserialize(d).map(Milliseconds)
  }
}

#[cfg(feature = "serde")]
mod opt_millis {
  use embedded_time::duration::Milliseconds;
  use serde::{Deserialize, Deserializer, Serializer};

  use crate::time::Millis;

  pub(super) fn serialize<S: Serializer>(m: &Option<Millis>, s: S) -> Result<S::Ok, S::Error> {
    match m {
      | Some(Milliseconds(ms)) => s.serialize_some(ms),
      | None => s.serialize_none(),
    }
  }

  pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Millis>, D::Error> {
    Option::<u64>::deserialize(d).map(|ms| ms.map(Milliseconds))
  }
}
