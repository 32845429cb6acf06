use embedded_time::Instant;
use newt_msg::Message;

use crate::exchange::{Exchange, ExchangeId};
use crate::layer::{Action, Block, Flow, Layer, Observe, Reliability, Snapshot};
use crate::net::Transport;
use crate::time::Clock;

/// An action, with the layer that asked for it
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Emitted {
  pub(crate) layer: usize,
  pub(crate) exchange: ExchangeId,
  pub(crate) action: Action,
}

/// The layers, top (closest to the application) first:
///
/// ```text
///   application
///        |
///     Observe
///        |
///      Block
///        |
///   Reliability   (datagram transports only)
///        |
///      wire
/// ```
#[derive(Debug)]
pub(crate) struct Stack<C: Clock> {
  layers: Vec<Box<dyn Layer<C>>>,
}

fn tag(layer: usize, actions: Vec<(ExchangeId, Action)>) -> impl Iterator<Item = Emitted> {
  actions.into_iter()
         .map(move |(exchange, action)| Emitted { layer,
                                                  exchange,
                                                  action })
}

impl<C: Clock> Stack<C> {
  pub(crate) fn new(transport: Transport) -> Self {
    let mut layers: Vec<Box<dyn Layer<C>>> =
      vec![Box::new(Observe::<C>::default()), Box::new(Block::<C>::default())];

    if transport == Transport::Datagram {
      layers.push(Box::new(Reliability::<C>::default()));
    }

    Self { layers }
  }

  #[cfg(test)]
  pub(crate) fn depth(&self) -> usize {
    self.layers.len()
  }

  /// Pass a message down, starting at layer `from`.
  ///
  /// Yields the message to put on the wire, if no layer stopped it.
  pub(crate) fn outbound(&mut self,
                         from: usize,
                         snap: &Snapshot<'_, C>,
                         ex: &mut Exchange<C>,
                         msg: Message)
                         -> (Option<Message>, Vec<Emitted>) {
    let mut emitted = vec![];
    let mut msg = Some(msg);

    for (ix, layer) in self.layers.iter_mut().enumerate().skip(from) {
      let mut out = vec![];
      let flow = match msg.take() {
        | Some(m) => layer.outbound(snap, ex, m, &mut out),
        | None => break,
      };

      emitted.extend(tag(ix, out));
      msg = match flow {
        | Flow::Forward(m) => Some(m),
        | Flow::Stop => None,
      };
    }

    (msg, emitted)
  }

  /// Pass a message up, from the bottom layer.
  ///
  /// Yields the message for the application, if no layer stopped it.
  pub(crate) fn inbound(&mut self,
                        snap: &Snapshot<'_, C>,
                        ex: &mut Exchange<C>,
                        msg: Message)
                        -> (Option<Message>, Vec<Emitted>) {
    let mut emitted = vec![];
    let mut msg = Some(msg);

    for (ix, layer) in self.layers.iter_mut().enumerate().rev() {
      let mut out = vec![];
      let flow = match msg.take() {
        | Some(m) => layer.inbound(snap, ex, m, &mut out),
        | None => break,
      };

      emitted.extend(tag(ix, out));
      msg = match flow {
        | Flow::Forward(m) => Some(m),
        | Flow::Stop => None,
      };
    }

    (msg, emitted)
  }

  pub(crate) fn on_sent(&mut self, snap: &Snapshot<'_, C>, ex: &Exchange<C>, msg: &Message, bytes: &[u8]) {
    self.layers
        .iter_mut()
        .for_each(|l| l.on_sent(snap, ex, msg, bytes));
  }

  pub(crate) fn tick(&mut self, snap: &Snapshot<'_, C>) -> Vec<Emitted> {
    self.layers
        .iter_mut()
        .enumerate()
        .flat_map(|(ix, l)| {
          let mut out = vec![];
          l.tick(snap, &mut out);
          tag(ix, out)
        })
        .collect()
  }

  pub(crate) fn next_deadline(&self) -> Option<Instant<C>> {
    self.layers.iter().filter_map(|l| l.next_deadline()).min()
  }

  pub(crate) fn forget(&mut self, id: ExchangeId) {
    self.layers.iter_mut().for_each(|l| l.forget(id));
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::{Id, Payload, Type};

  use super::*;
  use crate::config::Config;
  use crate::exchange::Origin;
  use crate::net::{Addrd, SecurityContext};
  use crate::test::{self, msg, ClockMock};

  #[test]
  fn reliability_only_on_datagram() {
    assert_eq!(Stack::<ClockMock>::new(Transport::Datagram).depth(), 3);
    assert_eq!(Stack::<ClockMock>::new(Transport::Stream).depth(), 2);
  }

  #[test]
  fn actions_are_tagged_with_their_layer() {
    let cfg = Config { block: crate::config::Block { default_size: 16,
                                                     ..Default::default() },
                       ..Default::default() };
    let clock = ClockMock::new();
    let snap = Snapshot { time: clock.instant(0),
                          config: &cfg };
    let mut stack = Stack::<ClockMock>::new(Transport::Datagram);

    let mut put = msg!(Con {0 . 03} x 3 tk [1]);
    put.set_block1(16, 0, true);
    put.payload = Payload(vec![0; 16]);
    let mut ex = Exchange::new(ExchangeId(1),
                               Origin::Remote,
                               Addrd(put.clone(), test::dummy_addr()),
                               SecurityContext::default());

    let (up, emitted) = stack.inbound(&snap, &mut ex, put);
    assert_eq!(up, None);
    assert_eq!(emitted.len(), 1);
    assert_eq!(emitted[0].layer, 1);

    // the 2.31 continues below the block layer, and gets piggybacked
    let cont = match &emitted[0].action {
      | Action::Send(m) => m.clone(),
      | other => panic!("{:?}", other),
    };
    let (down, _) = stack.outbound(2, &snap, &mut ex, cont);
    let down = down.unwrap();
    assert_eq!(down.ty, Type::Ack);
    assert_eq!(down.id, Id(3));
  }
}
