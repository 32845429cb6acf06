use newt_msg::MessageToBytesError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::exchange::ExchangeId;

/// Errors surfaced to the application
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
  /// An outbound message had no usable destination address
  /// (unspecified ip or port 0). It was never handed to the transport.
  #[error("message has no destination address")]
  DestinationMissing,

  /// A CON message was transmitted `attempts` times without
  /// being acknowledged, or a request went unanswered for an
  /// entire exchange lifetime.
  #[error("no reply after {attempts} transmission(s)")]
  Timeout {
    /// Number of transmissions made
    attempts: u16,
  },

  /// The resource changed (its ETag differed) in the middle of
  /// a blockwise transfer. The partial body was discarded.
  #[error("resource changed during blockwise transfer")]
  TransferConflict,

  /// A block arrived out of order and the transfer was aborted
  #[error("expected block {expected}, got block {got}")]
  BlockOutOfOrder {
    #[allow(missing_docs)]
    expected: u32,
    #[allow(missing_docs)]
    got: u32,
  },

  /// A blockwise body grew beyond [`Block.max_body_size`](crate::config::Block::max_body_size)
  #[error("body of {size} bytes exceeds the limit of {max} bytes")]
  BodyTooLarge {
    #[allow(missing_docs)]
    size: usize,
    #[allow(missing_docs)]
    max: usize,
  },

  /// The peer answered with a Reset
  #[error("peer rejected the message")]
  Rejected,

  /// The exchange was canceled before it completed
  #[error("exchange was canceled")]
  Canceled,

  /// Gave up waiting on a blocking send
  #[error("gave up waiting for a response")]
  WaitElapsed,

  /// [`Config.max_active_exchanges`](crate::config::Config::max_active_exchanges)
  /// exchanges are already in flight
  #[error("too many active exchanges (max {max})")]
  TooManyExchanges {
    #[allow(missing_docs)]
    max: usize,
  },

  /// The exchange does not exist (anymore)
  #[error("no active exchange {0:?}")]
  UnknownExchange(ExchangeId),

  /// A message could not be serialized
  #[error("failed to serialize message: {0}")]
  ToBytes(#[from] MessageToBytesError),

  /// The transport failed to send a message
  #[error("transport error: {0}")]
  Transport(String),

  /// Invalid configuration
  #[error("invalid configuration: {0}")]
  Config(#[from] ConfigError),

  /// The endpoint was destroyed
  #[error("endpoint is shut down")]
  Shutdown,
}
