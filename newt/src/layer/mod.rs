use embedded_time::Instant;
use newt_msg::Message;

use crate::config::Config;
use crate::error::Error;
use crate::exchange::{Exchange, ExchangeId};
use crate::net::Addrd;
use crate::time::Clock;

/// Observe: notification sequencing & subscription lifetime
pub(crate) mod observe;

/// Blockwise: splitting & reassembling large bodies
pub(crate) mod block;

/// Reliability: ACKs, retransmission of CON messages
pub(crate) mod reliability;

pub(crate) use block::Block;
pub(crate) use observe::Observe;
pub(crate) use reliability::Reliability;

/// What a layer sees of the world while it runs
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot<'a, C: Clock> {
  /// The current time
  pub(crate) time: Instant<C>,
  /// Runtime config
  pub(crate) config: &'a Config,
}

/// What to do with a message after a layer has seen it
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Flow {
  /// Hand the (possibly modified) message to the next layer
  Forward(Message),
  /// The layer consumed the message
  Stop,
}

/// Work a layer asks the protocol stage to do on its behalf
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
  /// Send a message on the exchange, passing through the layers
  /// below the one that asked
  Send(Message),
  /// Put a message straight on the wire (ACKs & RSTs)
  Transmit(Message),
  /// Put already-serialized bytes back on the wire
  Retransmit(Addrd<Vec<u8>>),
  /// The exchange finished normally
  Complete,
  /// The exchange failed
  Fail(Error),
}

/// Actions emitted by a layer, with the exchange they concern
pub(crate) type Actions = Vec<(ExchangeId, Action)>;

/// A stage of the protocol pipeline.
///
/// Outbound messages pass through the layers top to bottom,
/// inbound messages bottom to top. Per-exchange state lives in
/// the layer, keyed by [`ExchangeId`].
pub(crate) trait Layer<C: Clock>: Send + core::fmt::Debug {
  /// A message is on its way down to the wire
  fn outbound(&mut self,
              snap: &Snapshot<'_, C>,
              ex: &mut Exchange<C>,
              msg: Message,
              out: &mut Actions)
              -> Flow {
    let _ = (snap, ex, out);
    Flow::Forward(msg)
  }

  /// A CON or NON message was serialized (and given its final
  /// message id) and is being handed to the transport
  fn on_sent(&mut self, snap: &Snapshot<'_, C>, ex: &Exchange<C>, msg: &Message, bytes: &[u8]) {
    let _ = (snap, ex, msg, bytes);
  }

  /// A message belonging to `ex` is on its way up to the application
  fn inbound(&mut self,
             snap: &Snapshot<'_, C>,
             ex: &mut Exchange<C>,
             msg: Message,
             out: &mut Actions)
             -> Flow {
    let _ = (snap, ex, out);
    Flow::Forward(msg)
  }

  /// Time passed
  fn tick(&mut self, snap: &Snapshot<'_, C>, out: &mut Actions) {
    let _ = (snap, out);
  }

  /// The next time this layer wants [`Layer::tick`] invoked
  fn next_deadline(&self) -> Option<Instant<C>> {
    None
  }

  /// Drop all state for an exchange that is gone
  fn forget(&mut self, id: ExchangeId) {
    let _ = id;
  }
}
