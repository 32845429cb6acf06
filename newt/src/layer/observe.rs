use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

use newt_msg::{Action as ObserveAction, Code, CodeKind, Message, Token, Type};

use super::{Action, Actions, Flow, Layer, Snapshot};
use crate::exchange::{Exchange, ExchangeId, ObserveState, Origin};
use crate::net::SocketAddr;
use crate::time::Clock;

/// Sequence numbers are 24 bits wide
const SEQ_MASK: u32 = 0xFF_FF_FF;

/// Half the sequence number space
const SEQ_HALF: u32 = 1 << 23;

/// Is notification sequence number `b` newer than `a`?
///
/// Sequence numbers wrap, so a number that is smaller by more than
/// half the number space counts as newer.
pub(crate) fn is_newer(a: u32, b: u32) -> bool {
  (a < b && b - a < SEQ_HALF) || (a > b && a - b > SEQ_HALF)
}

/// A peer observing one of our resources
#[derive(Debug, Clone, Copy, Default)]
struct Relation {
  seq: u32,
  notifications: u32,
}

/// Server side: numbers notifications, chooses CON or NON for them and
/// ends relations on error responses, RSTs and deregistrations.
///
/// Client side: drops notifications that arrive out of order and notices
/// when the server stops notifying.
#[derive(Debug)]
pub(crate) struct Observe<C: Clock> {
  relations: BTreeMap<ExchangeId, Relation>,
  registrations: HashMap<(SocketAddr, Token), ExchangeId>,
  last_seq: BTreeMap<ExchangeId, u32>,
  __clock: PhantomData<C>,
}

impl<C: Clock> Default for Observe<C> {
  fn default() -> Self {
    Self { relations: BTreeMap::new(),
           registrations: HashMap::new(),
           last_seq: BTreeMap::new(),
           __clock: PhantomData }
  }
}

fn is_success(code: Code) -> bool {
  code.class == 2
}

impl<C: Clock> Observe<C> {
  fn end_relation(&mut self, id: ExchangeId) {
    if self.relations.remove(&id).is_some() {
      log::debug!("{} observe relation ended", id);
    }

    self.registrations.retain(|_, ex| *ex != id);
  }

  /// An earlier registration from the same peer & token is replaced by this one
  fn displace(&mut self, key: (SocketAddr, Token), id: ExchangeId, out: &mut Actions) {
    if let Some(prev) = self.registrations.remove(&key).filter(|prev| *prev != id) {
      self.end_relation(prev);
      out.push((prev, Action::Complete));
    }
  }

  fn server_inbound(&mut self, ex: &mut Exchange<C>, msg: Message, out: &mut Actions) -> Flow {
    if msg.ty == Type::Reset {
      log::debug!("{} peer rejected a notification", ex.id);
      self.end_relation(ex.id);
      ex.observe = ObserveState::Off;
      out.push((ex.id, Action::Complete));
      return Flow::Stop;
    }

    if msg.code != Code::GET {
      return Flow::Forward(msg);
    }

    let key = (ex.peer, msg.token);
    match msg.observe_action() {
      | Some(ObserveAction::Register) => {
        self.displace(key, ex.id, out);
        self.registrations.insert(key, ex.id);
        self.relations.insert(ex.id, Relation::default());
        ex.observe = ObserveState::Pending;
        log::debug!("{} peer {} registered to observe {:?}",
                    ex.id,
                    ex.peer,
                    msg.uri_key());
      },
      | Some(ObserveAction::Deregister) => self.displace(key, ex.id, out),
      | None => (),
    }

    Flow::Forward(msg)
  }

  fn notify(&mut self, snap: &Snapshot<'_, C>, ex: &mut Exchange<C>, mut msg: Message) -> Flow {
    let rel = match self.relations.get_mut(&ex.id) {
      | Some(rel) => rel,
      | None => return Flow::Forward(msg),
    };

    if !is_success(msg.code) {
      msg.remove(newt_msg::known::OBSERVE);
      ex.observe = ObserveState::Off;
      self.end_relation(ex.id);
      return Flow::Forward(msg);
    }

    let seq = rel.seq;
    msg.set_observe(seq);
    rel.seq = (seq + 1) & SEQ_MASK;

    if ex.current_response.is_some() {
      rel.notifications += 1;
      let interval = snap.config.notification_con_interval;
      msg.ty = match interval > 0 && rel.notifications % interval == 0 {
        | true => Type::Con,
        | false => Type::Non,
      };
    }

    ex.observe = ObserveState::Active;
    log::trace!("{} notification {}", ex.id, seq);
    Flow::Forward(msg)
  }

  fn client_inbound(&mut self, ex: &mut Exchange<C>, msg: Message) -> Flow {
    if ex.observe == ObserveState::Off {
      return Flow::Forward(msg);
    }

    let seq = match msg.observe() {
      | Some(seq) if is_success(msg.code) => seq,
      | _ => {
        log::debug!("{} server ended the observation with {}", ex.id, msg.code);
        ex.observe = ObserveState::Off;
        self.last_seq.remove(&ex.id);
        return Flow::Forward(msg);
      },
    };

    match self.last_seq.get(&ex.id) {
      | Some(last) if !is_newer(*last, seq) => {
        log::trace!("{} dropping stale notification {} (have {})",
                    ex.id,
                    seq,
                    last);
        Flow::Stop
      },
      | _ => {
        self.last_seq.insert(ex.id, seq);
        ex.observe = ObserveState::Active;
        Flow::Forward(msg)
      },
    }
  }
}

impl<C: Clock> Layer<C> for Observe<C> {
  fn outbound(&mut self,
              snap: &Snapshot<'_, C>,
              ex: &mut Exchange<C>,
              msg: Message,
              _: &mut Actions)
              -> Flow {
    match (ex.origin, msg.code.kind()) {
      | (Origin::Local, CodeKind::Request) => {
        if msg.observe_action() == Some(ObserveAction::Register) {
          ex.observe = ObserveState::Pending;
        }
        Flow::Forward(msg)
      },
      | (Origin::Remote, CodeKind::Response) => self.notify(snap, ex, msg),
      | _ => Flow::Forward(msg),
    }
  }

  fn inbound(&mut self,
             _: &Snapshot<'_, C>,
             ex: &mut Exchange<C>,
             msg: Message,
             out: &mut Actions)
             -> Flow {
    match ex.origin {
      | Origin::Remote => self.server_inbound(ex, msg, out),
      | Origin::Local if msg.code.kind() == CodeKind::Response => self.client_inbound(ex, msg),
      | Origin::Local => Flow::Forward(msg),
    }
  }

  fn forget(&mut self, id: ExchangeId) {
    self.end_relation(id);
    self.last_seq.remove(&id);
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::Id;

  use super::*;
  use crate::config::Config;
  use crate::net::{Addrd, SecurityContext};
  use crate::test::{self, msg, ClockMock};

  fn exchange(id: u64, origin: Origin, req: Message) -> Exchange<ClockMock> {
    Exchange::new(ExchangeId(id),
                  origin,
                  Addrd(req, test::dummy_addr()),
                  SecurityContext::default())
  }

  fn register() -> Message {
    let mut req = msg!(Con {0 . 01} x 1 tk [1]);
    req.set_observe(ObserveAction::Register.into());
    req
  }

  fn notification(seq: u32) -> Message {
    let mut resp = msg!(Non {2 . 05} x 0 tk [1]);
    resp.set_observe(seq);
    resp
  }

  #[test]
  fn lollipop() {
    assert!(is_newer(1, 2));
    assert!(!is_newer(2, 1));
    assert!(!is_newer(5, 5));
    assert!(is_newer(SEQ_MASK, 0));
    assert!(is_newer(SEQ_MASK - 10, 3));
    assert!(!is_newer(3, SEQ_MASK - 10));
    assert!(!is_newer(0, SEQ_HALF + 1));
  }

  #[test]
  fn client_drops_stale_notifications() {
    let cfg = Config::default();
    let clock = ClockMock::new();
    let snap = Snapshot { time: clock.instant(0),
                          config: &cfg };
    let mut layer = Observe::<ClockMock>::default();
    let mut ex = exchange(1, Origin::Local, register());

    layer.outbound(&snap, &mut ex, register(), &mut vec![]);
    assert_eq!(ex.observe, ObserveState::Pending);

    let delivered = [SEQ_MASK - 1, SEQ_MASK, 3, 0, 1, 4, 2, 5].into_iter()
                                                             .filter(|seq| {
                                                               layer.inbound(&snap,
                                                                             &mut ex,
                                                                             notification(*seq),
                                                                             &mut vec![])
                                                               != Flow::Stop
                                                             })
                                                             .collect::<Vec<_>>();

    assert_eq!(delivered, vec![SEQ_MASK - 1, SEQ_MASK, 3, 4, 5]);
    assert_eq!(ex.observe, ObserveState::Active);
  }

  #[test]
  fn client_observation_ends_without_observe_option() {
    let cfg = Config::default();
    let clock = ClockMock::new();
    let snap = Snapshot { time: clock.instant(0),
                          config: &cfg };
    let mut layer = Observe::<ClockMock>::default();
    let mut ex = exchange(1, Origin::Local, register());

    layer.outbound(&snap, &mut ex, register(), &mut vec![]);
    layer.inbound(&snap, &mut ex, notification(1), &mut vec![]);

    let plain = msg!(Non {2 . 05} x 0 tk [1]);
    assert_eq!(layer.inbound(&snap, &mut ex, plain.clone(), &mut vec![]),
               Flow::Forward(plain));
    assert_eq!(ex.observe, ObserveState::Off);
  }

  #[test]
  fn server_numbers_notifications() {
    let cfg = Config { notification_con_interval: 2,
                       ..Config::default() };
    let clock = ClockMock::new();
    let snap = Snapshot { time: clock.instant(0),
                          config: &cfg };
    let mut layer = Observe::<ClockMock>::default();
    let mut ex = exchange(1, Origin::Remote, register());

    layer.inbound(&snap, &mut ex, register(), &mut vec![]);
    assert_eq!(ex.observe, ObserveState::Pending);

    let mut sent = vec![];
    for _ in 0..4 {
      match layer.outbound(&snap, &mut ex, msg!(Ack {2 . 05} x 0 tk [1]), &mut vec![]) {
        | Flow::Forward(m) => {
          sent.push((m.ty, m.observe()));
          ex.current_response = Some(m);
        },
        | Flow::Stop => panic!("stopped"),
      }
    }

    assert_eq!(sent,
               vec![(Type::Ack, Some(0)),
                    (Type::Non, Some(1)),
                    (Type::Con, Some(2)),
                    (Type::Non, Some(3))]);
    assert_eq!(ex.observe, ObserveState::Active);

    // an error ends the relation
    let err = match layer.outbound(&snap, &mut ex, msg!(Ack {4 . 04} x 0 tk [1]), &mut vec![]) {
      | Flow::Forward(m) => m,
      | Flow::Stop => panic!("stopped"),
    };
    assert_eq!(err.observe(), None);
    assert_eq!(ex.observe, ObserveState::Off);
    assert!(layer.relations.is_empty());
  }

  #[test]
  fn server_relation_ends_on_reset() {
    let cfg = Config::default();
    let clock = ClockMock::new();
    let snap = Snapshot { time: clock.instant(0),
                          config: &cfg };
    let mut layer = Observe::<ClockMock>::default();
    let mut ex = exchange(1, Origin::Remote, register());
    layer.inbound(&snap, &mut ex, register(), &mut vec![]);

    let mut out = vec![];
    assert_eq!(layer.inbound(&snap, &mut ex, Message::empty(Type::Reset, Id(4)), &mut out),
               Flow::Stop);
    assert_eq!(out, vec![(ExchangeId(1), Action::Complete)]);
    assert!(layer.registrations.is_empty());
  }

  #[test]
  fn reregistration_and_deregistration_replace_relation() {
    let cfg = Config::default();
    let clock = ClockMock::new();
    let snap = Snapshot { time: clock.instant(0),
                          config: &cfg };
    let mut layer = Observe::<ClockMock>::default();

    let mut first = exchange(1, Origin::Remote, register());
    layer.inbound(&snap, &mut first, register(), &mut vec![]);

    let mut again = exchange(2, Origin::Remote, register());
    let mut out = vec![];
    layer.inbound(&snap, &mut again, register(), &mut out);
    assert_eq!(out, vec![(ExchangeId(1), Action::Complete)]);

    let mut dereg = msg!(Con {0 . 01} x 2 tk [1]);
    dereg.set_observe(ObserveAction::Deregister.into());
    let mut stop = exchange(3, Origin::Remote, dereg.clone());
    let mut out = vec![];
    assert_eq!(layer.inbound(&snap, &mut stop, dereg.clone(), &mut out),
               Flow::Forward(dereg));
    assert_eq!(out, vec![(ExchangeId(2), Action::Complete)]);
    assert_eq!(stop.observe, ObserveState::Off);
    assert!(layer.relations.is_empty());
  }
}
