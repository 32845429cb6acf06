use std::collections::BTreeMap;

use embedded_time::Instant;
use newt_msg::{CodeKind, Message, Type};

use super::{Action, Actions, Flow, Layer, Snapshot};
use crate::error::Error;
use crate::exchange::{Exchange, ExchangeId, Origin};
use crate::net::Addrd;
use crate::retry::{RetryTimer, YouShould};
use crate::time::Clock;

/// A CON message waiting to be acknowledged
#[derive(Debug)]
struct Pending<C: Clock> {
  timer: RetryTimer<C>,
  bytes: Addrd<Vec<u8>>,
}

/// Retransmits CON messages until they are ACKed (or RST),
/// ACKs CON responses and piggybacks responses on ACKs
/// where possible.
///
/// Only present on datagram transports.
#[derive(Debug)]
pub(crate) struct Reliability<C: Clock> {
  pending: BTreeMap<ExchangeId, Pending<C>>,
}

impl<C: Clock> Default for Reliability<C> {
  fn default() -> Self {
    Self { pending: BTreeMap::new() }
  }
}

impl<C: Clock> Reliability<C> {
  fn stop(&mut self, id: ExchangeId) {
    if self.pending.remove(&id).is_some() {
      log::trace!("{} acknowledged", id);
    }
  }
}

impl<C: Clock> Layer<C> for Reliability<C> {
  fn outbound(&mut self,
              _: &Snapshot<'_, C>,
              ex: &mut Exchange<C>,
              mut msg: Message,
              _: &mut Actions)
              -> Flow {
    if ex.origin != Origin::Remote || msg.code.kind() != CodeKind::Response {
      return Flow::Forward(msg);
    }

    let req = ex.current_request.as_ref().unwrap_or(&ex.request);
    let (req_ty, req_id) = (req.ty, req.id);

    if ex.current_response.is_none() && req_ty == Type::Con && !ex.accepted {
      msg.ty = Type::Ack;
      msg.id = req_id;
    } else if msg.ty == Type::Ack {
      msg.ty = match req_ty {
        | Type::Con => Type::Con,
        | _ => Type::Non,
      };
    }

    Flow::Forward(msg)
  }

  fn on_sent(&mut self, snap: &Snapshot<'_, C>, ex: &Exchange<C>, msg: &Message, bytes: &[u8]) {
    self.pending.remove(&ex.id);

    if msg.ty == Type::Con {
      let timer = RetryTimer::new(snap.time,
                                  snap.config.con.retry_strategy(),
                                  snap.config.con.max_attempts());
      log::trace!("{} will retransmit {:?} after {}ms",
                  ex.id,
                  msg.id,
                  timer.init().0);
      self.pending.insert(ex.id,
                          Pending { timer,
                                    bytes: Addrd(bytes.to_vec(), ex.peer) });
    }
  }

  fn inbound(&mut self,
             _: &Snapshot<'_, C>,
             ex: &mut Exchange<C>,
             msg: Message,
             out: &mut Actions)
             -> Flow {
    match (msg.ty, msg.code.kind()) {
      | (Type::Ack, CodeKind::Empty) => {
        self.stop(ex.id);

        // a response was promised; for Remote exchanges this acks our CON response
        if ex.origin == Origin::Remote && !ex.is_observing() {
          out.push((ex.id, Action::Complete));
        }

        Flow::Stop
      },
      | (Type::Reset, _) => {
        self.stop(ex.id);
        match ex.origin {
          | Origin::Local => {
            out.push((ex.id, Action::Fail(Error::Rejected)));
            Flow::Stop
          },
          | Origin::Remote => Flow::Forward(msg),
        }
      },
      | (ty, CodeKind::Response) => {
        if ex.origin == Origin::Local {
          self.stop(ex.id);
        }

        if ty == Type::Con {
          out.push((ex.id, Action::Transmit(msg.ack())));
        }

        Flow::Forward(msg)
      },
      | _ => Flow::Forward(msg),
    }
  }

  fn tick(&mut self, snap: &Snapshot<'_, C>, out: &mut Actions) {
    let mut gave_up = vec![];

    self.pending.iter_mut().for_each(|(id, p)| {
                             match p.timer.what_should_i_do(snap.time) {
                               | Ok(YouShould::Retry) => {
                                 log::debug!("{} retransmitting (attempt {})",
                                             id,
                                             p.timer.attempts().0);
                                 out.push((*id, Action::Retransmit(p.bytes.clone())));
                               },
                               | Ok(YouShould::Cry) => {
                                 let attempts = p.timer.attempts().0;
                                 log::debug!("{} not acknowledged after {} transmissions",
                                             id,
                                             attempts);
                                 out.push((*id, Action::Fail(Error::Timeout { attempts })));
                                 gave_up.push(*id);
                               },
                               | Err(_) => (),
                             }
                           });

    gave_up.into_iter().for_each(|id| {
                         self.pending.remove(&id);
                       });
  }

  fn next_deadline(&self) -> Option<Instant<C>> {
    self.pending.values().map(|p| p.timer.next_deadline()).min()
  }

  fn forget(&mut self, id: ExchangeId) {
    self.pending.remove(&id);
  }
}
