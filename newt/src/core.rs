use std::collections::VecDeque;
use std::sync::Arc;

use embedded_time::Instant;
use newt_msg::{CodeKind, Header, Message, MessageParseError, MessageToBytesError, Token,
               TryFromBytes, TryIntoBytes, Type};

use crate::config::Config;
use crate::error::Error;
use crate::exchange::{ExchangeId, ExecutionPolicy, Origin, Outcome, Shared, Sink};
use crate::layer::{Action, Snapshot};
use crate::logging::msg_summary;
use crate::matcher::{Matched, Matcher};
use crate::net::{is_deliverable, Addrd, Inbound, SecurityContext, Transport};
use crate::req::Req;
use crate::resp::{code, Resp};
use crate::stack::{Emitted, Stack};
use crate::time::{self, Clock};

/// Something the protocol stage needs the outside world to do
#[derive(Debug, Clone)]
pub enum Effect {
  /// Put bytes on the wire
  Transmit {
    /// The exchange the bytes belong to, if any
    exchange: Option<ExchangeId>,
    /// The message the bytes encode.
    ///
    /// `None` for retransmissions and replayed replies.
    msg: Option<Message>,
    /// The bytes & who to send them to
    bytes: Addrd<Vec<u8>>,
    /// See [`SecurityContext`]
    context: SecurityContext,
  },
  /// Hand a (reassembled, deduplicated) request to the application
  DeliverRequest {
    /// Respond with this
    exchange: ExchangeId,
    #[allow(missing_docs)]
    req: Addrd<Req>,
  },
  /// Hand an observe notification to the application
  Notify {
    #[allow(missing_docs)]
    sink: Sink,
    /// The request that registered the observation
    request: Req,
    #[allow(missing_docs)]
    resp: Addrd<Resp>,
  },
  /// An outbound request ended
  Finish {
    #[allow(missing_docs)]
    sink: Sink,
    #[allow(missing_docs)]
    outcome: Outcome,
  },
  /// Something worth logging once the protocol stage is released
  Log(log::Level, String),
}

/// A batch of [`Effect`]s, in the order they should be carried out
pub type Effects = Vec<Effect>;

/// How to answer a received CON request without a response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyKind {
  /// Send an empty ACK; the response will follow separately
  Accept,
  /// Send a RST; the request will not be answered
  Reject,
}

enum Work {
  Down {
    exchange: ExchangeId,
    from: usize,
    msg: Message,
  },
  Act(Emitted),
}

/// The deterministic protocol stage.
///
/// Owns the exchange store and the layer stack, and turns
/// inputs (requests to send, bytes received, time passing)
/// into [`Effect`]s. It never does IO and never calls into
/// the application; the caller carries out the effects.
#[derive(Debug)]
pub struct Core<C: Clock> {
  config: Config,
  matcher: Matcher<C>,
  stack: Stack<C>,
}

impl<C: Clock> Core<C> {
  /// Create a protocol stage
  pub fn new(config: Config) -> Result<Self, Error> {
    config.validate()?;

    Ok(Self { matcher: Matcher::new(&config),
              stack: Stack::new(config.transport),
              config })
  }

  /// Runtime config
  pub fn config(&self) -> &Config {
    &self.config
  }

  /// Number of exchanges currently tracked
  pub fn active_exchanges(&self) -> usize {
    self.matcher.len()
  }

  pub(crate) fn shared(&self, id: ExchangeId) -> Option<Arc<Shared>> {
    self.matcher.get(id).map(|ex| ex.shared.clone())
  }

  pub(crate) fn policy(&self, id: ExchangeId) -> Option<ExecutionPolicy> {
    self.matcher.get(id).map(|ex| ex.policy.clone())
  }

  pub(crate) fn set_policy(&mut self, id: ExchangeId, policy: ExecutionPolicy) {
    if let Some(ex) = self.matcher.get_mut(id) {
      ex.policy = policy;
    }
  }

  fn is_datagram(&self) -> bool {
    self.config.transport == Transport::Datagram
  }

  fn encode(&self, msg: &Message) -> Result<Vec<u8>, MessageToBytesError> {
    match self.config.transport {
      | Transport::Datagram => msg.clone().try_into_bytes(),
      | Transport::Stream => newt_msg::stream::try_into_bytes(msg),
    }
  }

  /// Start an exchange for an outbound request.
  ///
  /// The request is given a token if it has none, and a message id
  /// when it is put on the wire.
  pub fn send_request(&mut self,
                      now: Instant<C>,
                      req: Addrd<Req>,
                      context: SecurityContext,
                      sink: Sink,
                      policy: ExecutionPolicy)
                      -> Result<(ExchangeId, Effects), Error> {
    if !is_deliverable(req.addr()) {
      return Err(Error::DestinationMissing);
    }

    let id = self.matcher
                 .open_local(now, req.map(Message::from), context)?;

    let msg = match self.matcher.get_mut(id) {
      | Some(ex) => {
        ex.sink = Some(sink);
        ex.policy = policy;
        ex.request.clone()
      },
      | None => return Err(Error::UnknownExchange(id)),
    };

    let mut fx = vec![];
    self.run(now,
             VecDeque::from([Work::Down { exchange: id,
                                          from: 0,
                                          msg }]),
             &mut fx);
    Ok((id, fx))
  }

  /// Respond to a request received from a peer.
  ///
  /// May be called more than once for observed resources;
  /// every call after the first is a notification.
  pub fn send_response(&mut self, now: Instant<C>, id: ExchangeId, resp: Resp) -> Result<Effects, Error> {
    let token = match self.matcher.get(id) {
      | Some(ex) if ex.origin == Origin::Remote => ex.request.token,
      | _ => return Err(Error::UnknownExchange(id)),
    };

    let mut msg = Message::from(resp);
    msg.token = token;

    let mut fx = vec![];
    self.run(now,
             VecDeque::from([Work::Down { exchange: id,
                                          from: 0,
                                          msg }]),
             &mut fx);
    Ok(fx)
  }

  /// Accept or reject a received CON request with an empty message
  pub fn send_empty(&mut self, now: Instant<C>, id: ExchangeId, kind: EmptyKind) -> Result<Effects, Error> {
    let (req, peer, context) = match self.matcher.get_mut(id) {
      | Some(ex) if ex.origin == Origin::Remote => {
        if kind == EmptyKind::Accept {
          ex.accepted = true;
        }

        (ex.current_request.clone().unwrap_or_else(|| ex.request.clone()), ex.peer, ex.context)
      },
      | _ => return Err(Error::UnknownExchange(id)),
    };

    let mut fx = vec![];
    if req.ty == Type::Con {
      let reply = match kind {
        | EmptyKind::Accept => req.ack(),
        | EmptyKind::Reject => req.reset(),
      };
      self.transmit_raw(now, Some(id), Addrd(reply, peer), context, &mut fx);
    }

    if kind == EmptyKind::Reject {
      self.finish(id, None, &mut fx);
    }

    Ok(fx)
  }

  /// Cancel an exchange.
  ///
  /// Outbound requests finish with [`Outcome::Canceled`].
  /// Canceling an exchange that already ended does nothing.
  pub fn cancel(&mut self, id: ExchangeId) -> Effects {
    let mut fx = vec![];
    self.finish(id, Some(Outcome::Canceled), &mut fx);
    fx
  }

  /// End an exchange with an error the stack knows nothing about
  /// (e.g. the transport failing to send)
  pub fn fail(&mut self, id: ExchangeId, error: Error) -> Effects {
    let mut fx = vec![];
    self.finish(id, Some(Outcome::Error(error)), &mut fx);
    fx
  }

  /// Stop observing whatever the request with `token` observes.
  ///
  /// The exchange finishes with [`Outcome::Canceled`];
  /// notifications arriving later are answered with RST.
  pub fn cancel_observation(&mut self, token: Token) -> Effects {
    let found = self.matcher
                    .ids()
                    .into_iter()
                    .find(|id| {
                      self.matcher
                          .get(*id)
                          .map(|ex| {
                            ex.origin == Origin::Local
                            && ex.request.token == token
                            && ex.is_observing()
                          })
                          .unwrap_or(false)
                    });

    match found {
      | Some(id) => {
        log::debug!("{} observation canceled", id);
        self.cancel(id)
      },
      | None => vec![],
    }
  }

  /// Cancel every exchange and forget everything
  pub fn destroy(&mut self) -> Effects {
    let mut fx = vec![];
    self.matcher
        .ids()
        .into_iter()
        .for_each(|id| self.finish(id, Some(Outcome::Canceled), &mut fx));
    fx
  }

  /// The next time [`Core::tick`] has work to do
  pub fn next_deadline(&self) -> Option<Instant<C>> {
    self.stack.next_deadline()
  }

  /// Time passed: retransmit, give up on unanswered messages
  /// and forget old message ids.
  pub fn tick(&mut self, now: Instant<C>) -> Effects {
    let mut fx = vec![];
    let emitted = self.stack.tick(&Snapshot { time: now,
                                              config: &self.config });
    self.run(now, emitted.into_iter().map(Work::Act).collect(), &mut fx);

    let lifetime = self.config.exchange_lifetime_millis();
    self.matcher
        .stale(now, lifetime)
        .into_iter()
        .for_each(|id| {
          let attempts = self.matcher
                             .get(id)
                             .map(|ex| ex.retransmissions + 1)
                             .unwrap_or(1);
          log::debug!("{} expired", id);
          self.finish(id, Some(Outcome::Error(Error::Timeout { attempts })), &mut fx);
        });

    self.matcher.prune(now, lifetime);
    fx
  }

  /// Parse received bytes.
  ///
  /// Garbage that came in a CON datagram is answered with a RST
  /// (the `Err` effects), anything else unparsable is dropped.
  pub fn decode(&mut self, now: Instant<C>, inbound: &Inbound) -> Result<Addrd<Message>, Effects> {
    let Addrd(bytes, peer) = inbound.dgram.as_ref();
    let parsed: Result<Message, MessageParseError> = match self.config.transport {
      | Transport::Datagram => Message::try_from_bytes(bytes),
      | Transport::Stream => newt_msg::stream::try_from_bytes(bytes),
    };

    match parsed {
      | Ok(msg) => Ok(Addrd(msg, peer)),
      | Err(e) => {
        let mut fx = vec![];
        match Header::try_from_bytes(bytes) {
          | Ok(h) if self.is_datagram() && h.ty == Type::Con => {
            log::warn!("rejecting unparsable CON {:?} from {}: {:?}", h.id, peer, e);
            let rst = Message::empty(Type::Reset, h.id);
            self.transmit_raw(now, None, Addrd(rst, peer), inbound.context, &mut fx);
          },
          | _ => log::warn!("dropping {} unparsable bytes from {}: {:?}", bytes.len(), peer, e),
        }
        Err(fx)
      },
    }
  }

  /// Process received bytes
  pub fn recv(&mut self, now: Instant<C>, inbound: Inbound) -> Effects {
    match self.decode(now, &inbound) {
      | Ok(msg) => self.recv_msg(now, msg, inbound.context),
      | Err(fx) => fx,
    }
  }

  /// Process a received message
  pub fn recv_msg(&mut self, now: Instant<C>, msg: Addrd<Message>, context: SecurityContext) -> Effects {
    log::trace!("recvd {} <- {}", msg_summary(msg.data()), msg.addr());

    let mut fx = vec![];
    let peer = msg.addr();

    match msg.data().code.kind() {
      | CodeKind::Empty => self.recv_empty(now, msg, context, &mut fx),
      | CodeKind::Request => self.recv_request(now, msg, context, &mut fx),
      | CodeKind::Response => self.recv_response(now, msg, context, &mut fx),
      | CodeKind::Reserved => {
        let Addrd(msg, _) = msg;
        log::warn!("{} sent reserved code {}", peer, msg.code);
        if msg.ty == Type::Con {
          self.transmit_raw(now, None, Addrd(msg.reset(), peer), context, &mut fx);
        }
      },
    }

    fx
  }

  fn recv_empty(&mut self, now: Instant<C>, msg: Addrd<Message>, context: SecurityContext, fx: &mut Effects) {
    if !self.is_datagram() {
      return;
    }

    let peer = msg.addr();
    match msg.data().ty {
      | Type::Con | Type::Non => {
        log::trace!("ping from {}", peer);
        let rst = msg.data().reset();
        self.transmit_raw(now, None, Addrd(rst, peer), context, fx);
      },
      | Type::Ack | Type::Reset => match self.matcher.receive_empty(&msg) {
        | Matched::Existing(id) => self.inbound(now, id, msg.unwrap(), fx),
        | _ => log::trace!("{:?} {:?} from {} matches nothing",
                           msg.data().ty,
                           msg.data().id,
                           peer),
      },
    }
  }

  fn recv_request(&mut self, now: Instant<C>, msg: Addrd<Message>, context: SecurityContext, fx: &mut Effects) {
    let peer = msg.addr();
    let (ty, mid, token) = (msg.data().ty, msg.data().id, msg.data().token);

    match self.matcher.receive_request(now, msg.clone(), context) {
      | Ok(Matched::Fresh(id)) => {
        if let Some(ex) = self.matcher.get_mut(id) {
          ex.sent_at = Some(now);
        }
        self.inbound(now, id, msg.unwrap(), fx);
      },
      | Ok(Matched::Duplicate { reply: Some(bytes), .. }) => {
        log::debug!("{:?} from {} is a duplicate; replaying reply", mid, peer);
        fx.push(Effect::Transmit { exchange: None,
                                   msg: None,
                                   bytes: Addrd(bytes, peer),
                                   context });
      },
      | Ok(Matched::Duplicate { reply: None, .. }) => {
        log::debug!("{:?} from {} is a duplicate; still working on it", mid, peer);
      },
      | Ok(_) => (),
      | Err(e) => {
        log::warn!("refusing request from {}: {}", peer, e);
        let (ty, mid) = match ty {
          | Type::Con => (Type::Ack, mid),
          | _ => (Type::Non, self.matcher.next_mid(peer)),
        };
        let busy = Message::new(ty, code::SERVICE_UNAVAILABLE, mid, token);
        self.transmit_raw(now, None, Addrd(busy, peer), context, fx);
      },
    }
  }

  fn recv_response(&mut self, now: Instant<C>, msg: Addrd<Message>, context: SecurityContext, fx: &mut Effects) {
    let peer = msg.addr();

    match self.matcher.receive_response(now, &msg) {
      | Matched::Existing(id) => self.inbound(now, id, msg.unwrap(), fx),
      | Matched::Stale(id) => {
        log::debug!("{:?} from {} answers a request {} no longer waits on; dropping",
                    msg.data().id,
                    peer,
                    id);
      },
      | Matched::Duplicate { reply, .. } => {
        log::debug!("{:?} from {} is a duplicate", msg.data().id, peer);
        if let Some(bytes) = reply {
          fx.push(Effect::Transmit { exchange: None,
                                     msg: None,
                                     bytes: Addrd(bytes, peer),
                                     context });
        }
      },
      | _ if self.is_datagram() => {
        log::debug!("rejecting unexpected response {:?} from {}",
                    msg.data().id,
                    peer);
        let rst = msg.data().reset();
        self.transmit_raw(now, None, Addrd(rst, peer), context, fx);
      },
      | _ => log::debug!("dropping unexpected response from {}", peer),
    }
  }

  /// Pass a message belonging to exchange `id` up the stack
  fn inbound(&mut self, now: Instant<C>, id: ExchangeId, msg: Message, fx: &mut Effects) {
    let snap = Snapshot { time: now,
                          config: &self.config };
    let (up, emitted) = match self.matcher.get_mut(id) {
      | Some(ex) => self.stack.inbound(&snap, ex, msg),
      | None => return,
    };

    self.run(now, emitted.into_iter().map(Work::Act).collect(), fx);

    if let Some(msg) = up {
      self.deliver(now, id, msg, fx);
    }
  }

  /// A message made it out of the top of the stack
  fn deliver(&mut self, now: Instant<C>, id: ExchangeId, msg: Message, fx: &mut Effects) {
    let ex = match self.matcher.get_mut(id) {
      | Some(ex) => ex,
      | None => return,
    };

    match (ex.origin, msg.code.kind()) {
      | (Origin::Local, CodeKind::Response) => {
        if let (None, Some(sent)) = (ex.rtt, ex.first_sent_at) {
          let rtt = time::millis_between(sent, now);
          ex.rtt = Some(rtt);
          fx.push(Effect::Log(log::Level::Debug, format!("{} round trip took {}ms", id, rtt)));
        }

        ex.response = Some(msg.clone());
        let resp = Addrd(Resp::from(msg), ex.peer);

        if ex.is_observing() {
          if let Some(sink) = ex.sink.clone() {
            fx.push(Effect::Notify { sink,
                                     request: Req::from(ex.request.clone()),
                                     resp });
          }
        } else {
          self.finish(id, Some(Outcome::Response(resp)), fx);
        }
      },
      | (Origin::Remote, CodeKind::Request) => {
        ex.request = msg.clone();
        fx.push(Effect::DeliverRequest { exchange: id,
                                         req: Addrd(Req::from(msg), ex.peer) });
      },
      | _ => (),
    }
  }

  fn run(&mut self, now: Instant<C>, mut work: VecDeque<Work>, fx: &mut Effects) {
    while let Some(next) = work.pop_front() {
      match next {
        | Work::Down { exchange, from, msg } => {
          let snap = Snapshot { time: now,
                                config: &self.config };
          let (down, emitted) = match self.matcher.get_mut(exchange) {
            | Some(ex) => self.stack.outbound(from, &snap, ex, msg),
            | None => continue,
          };

          if let Some(msg) = down {
            self.transmit(now, exchange, msg, fx);
          }
          work.extend(emitted.into_iter().map(Work::Act));
        },
        | Work::Act(Emitted { layer,
                              exchange,
                              action, }) => match action {
          | Action::Send(msg) => work.push_back(Work::Down { exchange,
                                                             from: layer + 1,
                                                             msg }),
          | Action::Transmit(msg) => {
            if let Some((peer, context)) = self.matcher.get(exchange).map(|ex| (ex.peer, ex.context)) {
              self.transmit_raw(now, Some(exchange), Addrd(msg, peer), context, fx);
            }
          },
          | Action::Retransmit(bytes) => {
            if let Some(ex) = self.matcher.get_mut(exchange) {
              ex.retransmissions += 1;
              ex.sent_at = Some(now);
              log::trace!("{} retransmitting {}b -> {}", exchange, bytes.data().len(), bytes.addr());
              fx.push(Effect::Transmit { exchange: Some(exchange),
                                         msg: None,
                                         bytes,
                                         context: ex.context });
            }
          },
          | Action::Complete => self.finish(exchange, None, fx),
          | Action::Fail(e) => self.finish(exchange, Some(Outcome::Error(e)), fx),
        },
      }
    }
  }

  /// Put a message that went through the stack on the wire
  fn transmit(&mut self, now: Instant<C>, id: ExchangeId, mut msg: Message, fx: &mut Effects) {
    let (peer, context) = match self.matcher.get(id) {
      | Some(ex) => (ex.peer, ex.context),
      | None => return,
    };

    if self.is_datagram() && matches!(msg.ty, Type::Con | Type::Non) {
      msg.id = self.matcher.next_mid(peer);
    }

    let bytes = match self.encode(&msg) {
      | Ok(bytes) => bytes,
      | Err(e) => {
        log::warn!("{} could not serialize {}: {}", id, msg_summary(&msg), e);
        self.finish(id, Some(Outcome::Error(Error::ToBytes(e))), fx);
        return;
      },
    };

    let addrd = Addrd(msg, peer);
    self.matcher.on_transmit(now, Some(id), &addrd, &bytes);
    let Addrd(msg, _) = addrd;

    // over streams nothing is ACKed, so any response is the last
    let acked = self.is_datagram() && msg.ty == Type::Con;
    let snap = Snapshot { time: now,
                          config: &self.config };
    let done = match self.matcher.get_mut(id) {
      | Some(ex) => {
        match msg.code.kind() {
          | CodeKind::Request => {
            ex.current_request = Some(msg.clone());
            ex.first_sent_at.get_or_insert(now);
          },
          | _ => ex.current_response = Some(msg.clone()),
        }
        ex.sent_at = Some(now);
        self.stack.on_sent(&snap, ex, &msg, &bytes);

        ex.origin == Origin::Remote
        && msg.code.kind() == CodeKind::Response
        && !ex.is_observing()
        && !acked
      },
      | None => false,
    };

    log::trace!("sending {} -> {}", msg_summary(&msg), peer);
    fx.push(Effect::Transmit { exchange: Some(id),
                               msg: Some(msg),
                               bytes: Addrd(bytes, peer),
                               context });

    if done {
      self.finish(id, None, fx);
    }
  }

  /// Put an ACK, RST or canned reply on the wire, bypassing the stack
  fn transmit_raw(&mut self,
                  now: Instant<C>,
                  exchange: Option<ExchangeId>,
                  msg: Addrd<Message>,
                  context: SecurityContext,
                  fx: &mut Effects) {
    if !self.is_datagram() && msg.data().is_empty() {
      return;
    }

    match self.encode(msg.data()) {
      | Ok(bytes) => {
        self.matcher.on_transmit(now, exchange, &msg, &bytes);
        log::trace!("sending {} -> {}", msg_summary(msg.data()), msg.addr());
        let Addrd(msg, peer) = msg;
        fx.push(Effect::Transmit { exchange,
                                   msg: Some(msg),
                                   bytes: Addrd(bytes, peer),
                                   context });
      },
      | Err(e) => log::warn!("could not serialize {}: {}", msg_summary(msg.data()), e),
    }
  }

  /// End an exchange, delivering `outcome` if it was ours
  fn finish(&mut self, id: ExchangeId, outcome: Option<Outcome>, fx: &mut Effects) {
    let ex = match self.matcher.complete(id) {
      | Some(ex) => ex,
      | None => return,
    };

    self.stack.forget(id);

    if let Some(sink) = ex.sink {
      fx.push(Effect::Finish { sink,
                               outcome: outcome.unwrap_or(Outcome::Canceled) });
    }
  }
}
