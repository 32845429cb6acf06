use std::collections::HashMap;

use embedded_time::Instant;
use newt_msg::{CodeKind, Id, Message, Token, Type};

use crate::config::Config;
use crate::error::Error;
use crate::exchange::{Exchange, ExchangeId, ObserveState, Origin};
use crate::net::{Addrd, SecurityContext, SocketAddr, Transport};
use crate::time::{self, Clock, Stamped};

mod key;
mod store;

pub(crate) use key::TokenKey;
use store::Store;

/// What the matcher made of an inbound message
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Matched {
  /// A new request; a remote exchange was opened for it
  Fresh(ExchangeId),
  /// Belongs to an exchange we know about
  Existing(ExchangeId),
  /// A piggybacked response answering a request the exchange has since moved past
  Stale(ExchangeId),
  /// Seen this (peer, message id) before
  Duplicate {
    /// The exchange the original opened, if it is still alive
    exchange: Option<ExchangeId>,
    /// What we answered the original with, if anything yet
    reply: Option<Vec<u8>>,
  },
  /// No exchange wants this
  Unmatched,
}

/// A (peer, message id) we have seen recently
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Dedup {
  exchange: Option<ExchangeId>,
  reply: Option<Vec<u8>>,
}

/// Correlates messages with exchanges.
///
/// The matcher is the only thing that creates or destroys exchanges.
/// Responses are matched by token (scoped to the peer on datagram
/// transports), ACKs & RSTs by message id, and datagram requests
/// are deduplicated by (peer, message id) for an exchange lifetime.
///
/// A piggybacked response must also carry the message id of the
/// request its exchange is currently waiting on.
#[derive(Debug)]
pub(crate) struct Matcher<C: Clock> {
  transport: Transport,
  max_active: usize,
  token_seed: u16,
  store: Store<C>,
  by_token: HashMap<TokenKey, ExchangeId>,
  by_mid: HashMap<(SocketAddr, Id), ExchangeId>,
  dedup: HashMap<(SocketAddr, Id), Stamped<C, Dedup>>,
  /// Piggybacked responses already accepted, keyed by our message id
  acks: HashMap<(SocketAddr, Id), Stamped<C, ExchangeId>>,
  mid: Id,
  tokens_issued: u64,
}

impl<C: Clock> Matcher<C> {
  pub(crate) fn new(config: &Config) -> Self {
    Self { transport: config.transport,
           max_active: config.max_active_exchanges,
           token_seed: config.token_seed,
           store: Store::default(),
           by_token: HashMap::new(),
           by_mid: HashMap::new(),
           dedup: HashMap::new(),
           acks: HashMap::new(),
           mid: Id(config.token_seed),
           tokens_issued: 0 }
  }

  fn is_datagram(&self) -> bool {
    self.transport == Transport::Datagram
  }

  pub(crate) fn key(&self, peer: SocketAddr, token: Token) -> TokenKey {
    TokenKey::new(self.transport, peer, token)
  }

  fn check_capacity(&self) -> Result<(), Error> {
    match self.store.len() >= self.max_active {
      | true => Err(Error::TooManyExchanges { max: self.max_active }),
      | false => Ok(()),
    }
  }

  fn provision_token(&mut self, now: Instant<C>, peer: SocketAddr) -> Token {
    loop {
      self.tokens_issued += 1;

      let bytes = [self.token_seed.to_be_bytes().as_ref(),
                   time::millis_since_epoch(now).to_be_bytes().as_ref(),
                   self.tokens_issued.to_be_bytes().as_ref()].concat();
      let token = Token::opaque(&bytes);

      if !self.by_token.contains_key(&self.key(peer, token)) {
        break token;
      }
    }
  }

  /// Open an exchange for a request we are about to send,
  /// giving it a token if it has none.
  pub(crate) fn open_local(&mut self,
                           now: Instant<C>,
                           mut req: Addrd<Message>,
                           context: SecurityContext)
                           -> Result<ExchangeId, Error> {
    self.check_capacity()?;

    if req.data().token.is_empty() {
      req.data_mut().token = self.provision_token(now, req.addr());
    }

    let key = self.key(req.addr(), req.data().token);
    let id = self.store
                 .insert(|id| Exchange::new(id, Origin::Local, req, context));

    if let Some(prev) = self.by_token.insert(key, id) {
      log::warn!("{} reuses the token of {}; responses will go to {}",
                 id,
                 prev,
                 id);
    }

    log::debug!("opened local exchange {}", id);
    Ok(id)
  }

  /// Correlate an inbound request
  pub(crate) fn receive_request(&mut self,
                                now: Instant<C>,
                                req: Addrd<Message>,
                                context: SecurityContext)
                                -> Result<Matched, Error> {
    let dedup_key = (req.addr(), req.data().id);

    if self.is_datagram() {
      if let Some(seen) = self.dedup.get(&dedup_key) {
        return Ok(Matched::Duplicate { exchange: seen.data().exchange,
                                       reply: seen.data().reply.clone() });
      }
    }

    self.check_capacity()?;
    let id = self.store
                 .insert(|id| Exchange::new(id, Origin::Remote, req, context));

    if self.is_datagram() {
      self.dedup.insert(dedup_key,
                        Stamped::new(Dedup { exchange: Some(id),
                                             reply: None },
                                     now));
    }

    log::debug!("opened remote exchange {}", id);
    Ok(Matched::Fresh(id))
  }

  /// Correlate an inbound (non-empty) response
  pub(crate) fn receive_response(&mut self, now: Instant<C>, resp: &Addrd<Message>) -> Matched {
    let found = self.by_token
                    .get(&self.key(resp.addr(), resp.data().token))
                    .copied();

    if !self.is_datagram() {
      return found.map(Matched::Existing).unwrap_or(Matched::Unmatched);
    }

    let dedup_key = (resp.addr(), resp.data().id);
    match resp.data().ty {
      | Type::Ack => {
        if let Some(seen) = self.acks.get(&dedup_key) {
          return Matched::Duplicate { exchange: Some(*seen.data()),
                                      reply: None };
        }

        let (id, current) = match found.and_then(|id| self.store.get(id)) {
          | Some(ex) => (ex.id, ex.mids.last() == Some(&resp.data().id)),
          | None => return Matched::Unmatched,
        };

        if !current {
          return Matched::Stale(id);
        }

        self.acks.insert(dedup_key, Stamped::new(id, now));
        Matched::Existing(id)
      },
      | _ => {
        match self.dedup.get(&dedup_key) {
          | Some(seen) => {
            return Matched::Duplicate { exchange: seen.data().exchange,
                                        reply: seen.data().reply.clone() }
          },
          | None => {
            self.dedup.insert(dedup_key,
                              Stamped::new(Dedup { exchange: found,
                                                   reply: None },
                                           now));
          },
        }

        found.map(Matched::Existing).unwrap_or(Matched::Unmatched)
      },
    }
  }

  /// Correlate an inbound ACK or RST by message id
  pub(crate) fn receive_empty(&self, msg: &Addrd<Message>) -> Matched {
    self.by_mid
        .get(&(msg.addr(), msg.data().id))
        .copied()
        .map(Matched::Existing)
        .unwrap_or(Matched::Unmatched)
  }

  /// A message id for a new CON or NON message to `peer`
  /// that does not collide with one still awaiting an answer
  pub(crate) fn next_mid(&mut self, peer: SocketAddr) -> Id {
    for _ in 0..=u16::MAX {
      self.mid = self.mid.next();
      if !self.by_mid.contains_key(&(peer, self.mid)) {
        break;
      }
    }

    self.mid
  }

  /// Record a message that is going out on the wire
  pub(crate) fn on_transmit(&mut self,
                            now: Instant<C>,
                            exchange: Option<ExchangeId>,
                            msg: &Addrd<Message>,
                            bytes: &[u8]) {
    let (peer, mid) = (msg.addr(), msg.data().id);

    match msg.data().ty {
      | Type::Con | Type::Non => {
        if let Some(ex) = exchange.and_then(|id| self.store.get_mut(id)) {
          self.by_mid.insert((peer, mid), ex.id);
          if let Some(evicted) = ex.push_mid(mid) {
            self.by_mid.remove(&(peer, evicted));
          }
        }
      },
      | Type::Ack | Type::Reset if self.is_datagram() => {
        self.dedup
            .entry((peer, mid))
            .or_insert_with(|| Stamped::new(Dedup::default(), now))
            .data_mut()
            .reply = Some(bytes.to_vec());
      },
      | _ => (),
    }

    // the first reply to a request is what duplicates of it get
    let answered = exchange.and_then(|id| self.store.get(id))
                           .filter(|ex| {
                             ex.origin == Origin::Remote
                             && msg.data().code.kind() == CodeKind::Response
                           })
                           .map(|ex| (ex.peer, ex.request.id));

    if let Some(seen) = answered.and_then(|key| self.dedup.get_mut(&key)) {
      if seen.data().reply.is_none() {
        seen.data_mut().reply = Some(bytes.to_vec());
      }
    }
  }

  pub(crate) fn get(&self, id: ExchangeId) -> Option<&Exchange<C>> {
    self.store.get(id)
  }

  pub(crate) fn get_mut(&mut self, id: ExchangeId) -> Option<&mut Exchange<C>> {
    self.store.get_mut(id)
  }

  pub(crate) fn find_by_token(&self, key: TokenKey) -> Option<ExchangeId> {
    self.by_token.get(&key).copied()
  }

  pub(crate) fn len(&self) -> usize {
    self.store.len()
  }

  pub(crate) fn ids(&self) -> Vec<ExchangeId> {
    self.store.ids()
  }

  /// Remove an exchange from the store.
  ///
  /// Completing an exchange that is already gone does nothing and yields `None`.
  /// Dedup entries outlive the exchange.
  pub(crate) fn complete(&mut self, id: ExchangeId) -> Option<Exchange<C>> {
    let ex = self.store.remove(id)?;
    ex.shared.complete();

    let key = self.key(ex.peer, ex.request.token);
    if ex.origin == Origin::Local && self.by_token.get(&key) == Some(&id) {
      self.by_token.remove(&key);
    }

    ex.mids.iter().for_each(|mid| {
                    if self.by_mid.get(&(ex.peer, *mid)) == Some(&id) {
                      self.by_mid.remove(&(ex.peer, *mid));
                    }
                  });

    log::debug!("completed exchange {}", id);
    Some(ex)
  }

  /// Exchanges that have waited longer than `lifetime_ms` since
  /// their last transmission (or, for remote exchanges, since the
  /// request arrived) without finishing.
  ///
  /// Established observations never go stale.
  pub(crate) fn stale(&self, now: Instant<C>, lifetime_ms: u64) -> Vec<ExchangeId> {
    self.store
        .iter()
        .filter(|ex| ex.observe != ObserveState::Active)
        .filter(|ex| {
          ex.sent_at
            .map(|t| time::millis_between(t, now) > lifetime_ms)
            .unwrap_or(false)
        })
        .map(|ex| ex.id)
        .collect()
  }

  /// Forget (peer, message id) pairs older than `lifetime_ms`
  pub(crate) fn prune(&mut self, now: Instant<C>, lifetime_ms: u64) {
    let before = self.dedup.len() + self.acks.len();
    self.dedup.retain(|_, seen| !seen.older_than(now, lifetime_ms));
    self.acks.retain(|_, seen| !seen.older_than(now, lifetime_ms));

    match before - self.dedup.len() - self.acks.len() {
      | 0 => (),
      | n => log::trace!("forgot {} message id(s)", n),
    }
  }

  #[cfg(test)]
  pub(crate) fn dedup_len(&self) -> usize {
    self.dedup.len()
  }
}

#[cfg(test)]
mod tests {
  use newt_msg::TryIntoBytes;

  use super::*;
  use crate::test::{self, msg, ClockMock};

  fn matcher(cfg: Config) -> (ClockMock, Matcher<ClockMock>) {
    (ClockMock::new(), Matcher::new(&Config { token_seed: 0, ..cfg }))
  }

  #[test]
  fn tokens_are_provisioned_uniquely() {
    let (clock, mut m) = matcher(Config::default());

    let a = m.open_local(clock.instant(0),
                         Addrd(msg!(Con {0 . 01} x 0 tk []), test::dummy_addr()),
                         SecurityContext::default())
             .unwrap();
    let b = m.open_local(clock.instant(0),
                         Addrd(msg!(Con {0 . 01} x 0 tk []), test::dummy_addr()),
                         SecurityContext::default())
             .unwrap();

    let (ta, tb) = (m.get(a).unwrap().request.token, m.get(b).unwrap().request.token);
    assert_eq!(ta.0.len(), 8);
    assert_ne!(ta, tb);
    assert_eq!(m.find_by_token(m.key(test::dummy_addr(), ta)), Some(a));
  }

  #[test]
  fn supplied_tokens_are_kept() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Con {0 . 01} x 0 tk [0x37]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();
    assert_eq!(m.get(id).unwrap().request.token, Token::from_bytes(&[0x37]));
  }

  #[test]
  fn capacity_is_enforced() {
    let (clock, mut m) = matcher(Config { max_active_exchanges: 1,
                                          ..Config::default() });
    let open = |m: &mut Matcher<_>| {
      m.open_local(clock.instant(0),
                   Addrd(msg!(Con {0 . 01} x 0 tk []), test::dummy_addr()),
                   SecurityContext::default())
    };

    let id = open(&mut m).unwrap();
    assert_eq!(open(&mut m), Err(Error::TooManyExchanges { max: 1 }));

    m.complete(id);
    assert!(open(&mut m).is_ok());
  }

  #[test]
  fn duplicate_requests() {
    let (clock, mut m) = matcher(Config::default());
    let req = Addrd(msg!(Con {0 . 01} x 17 tk [1]), test::dummy_addr());

    let id = match m.receive_request(clock.instant(0), req.clone(), SecurityContext::default()) {
      | Ok(Matched::Fresh(id)) => id,
      | other => panic!("{:?}", other),
    };

    assert_eq!(m.receive_request(clock.instant(50), req.clone(), SecurityContext::default()),
               Ok(Matched::Duplicate { exchange: Some(id),
                                       reply: None }));

    let ack = Addrd(req.data().ack(), req.addr());
    let bytes = ack.data().clone().try_into_bytes().unwrap();
    m.on_transmit(clock.instant(60), Some(id), &ack, &bytes);
    m.complete(id);

    assert_eq!(m.receive_request(clock.instant(70), req.clone(), SecurityContext::default()),
               Ok(Matched::Duplicate { exchange: Some(id),
                                       reply: Some(bytes) }));

    // same id from somebody else is a different message
    let other = Addrd(req.data().clone(), test::addr(1));
    assert!(matches!(m.receive_request(clock.instant(80), other, SecurityContext::default()),
                     Ok(Matched::Fresh(_))));
  }

  #[test]
  fn stream_transport_does_not_dedup() {
    let (clock, mut m) = matcher(Config { transport: Transport::Stream,
                                          ..Config::default() });
    let req = Addrd(msg!(Non {0 . 01} x 0 tk [1]), test::dummy_addr());

    assert!(matches!(m.receive_request(clock.instant(0), req.clone(), SecurityContext::default()),
                     Ok(Matched::Fresh(_))));
    assert!(matches!(m.receive_request(clock.instant(0), req, SecurityContext::default()),
                     Ok(Matched::Fresh(_))));
    assert_eq!(m.dedup_len(), 0);
  }

  #[test]
  fn responses_match_by_token_and_peer() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Con {0 . 01} x 0 tk [9]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();

    let sent = Addrd(msg!(Con {0 . 01} x 3 tk [9]), test::dummy_addr());
    m.on_transmit(clock.instant(0), Some(id), &sent, &[]);

    let resp = Addrd(msg!(Ack {2 . 05} x 3 tk [9]), test::dummy_addr());
    assert_eq!(m.receive_response(clock.instant(1), &resp), Matched::Existing(id));

    let elsewhere = Addrd(msg!(Ack {2 . 05} x 3 tk [9]), test::addr(1));
    assert_eq!(m.receive_response(clock.instant(1), &elsewhere), Matched::Unmatched);

    let separate = Addrd(msg!(Con {2 . 05} x 40 tk [9]), test::dummy_addr());
    assert_eq!(m.receive_response(clock.instant(1), &separate), Matched::Existing(id));
  }

  #[test]
  fn piggybacked_responses_must_answer_the_current_request() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Con {0 . 01} x 0 tk [9]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();

    let first = Addrd(msg!(Con {0 . 01} x 3 tk [9]), test::dummy_addr());
    m.on_transmit(clock.instant(0), Some(id), &first, &[]);

    let ack = Addrd(msg!(Ack {2 . 31} x 3 tk [9]), test::dummy_addr());
    assert_eq!(m.receive_response(clock.instant(1), &ack), Matched::Existing(id));
    assert_eq!(m.receive_response(clock.instant(2), &ack),
               Matched::Duplicate { exchange: Some(id),
                                    reply: None });

    let second = Addrd(msg!(Con {0 . 01} x 4 tk [9]), test::dummy_addr());
    m.on_transmit(clock.instant(3), Some(id), &second, &[]);

    // right token, but it answers a request we already moved past
    let old = Addrd(msg!(Ack {2 . 31} x 2 tk [9]), test::dummy_addr());
    assert_eq!(m.receive_response(clock.instant(4), &old), Matched::Stale(id));

    let ack = Addrd(msg!(Ack {2 . 31} x 4 tk [9]), test::dummy_addr());
    assert_eq!(m.receive_response(clock.instant(5), &ack), Matched::Existing(id));

    m.prune(clock.instant(10), 1);
    assert_eq!(m.receive_response(clock.instant(10), &ack), Matched::Existing(id));
  }

  #[test]
  fn empty_messages_match_by_mid() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Con {0 . 01} x 0 tk [9]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();

    let mid = m.next_mid(test::dummy_addr());
    let mut sent = msg!(Con {0 . 01} x 0 tk [9]);
    sent.id = mid;
    m.on_transmit(clock.instant(0), Some(id), &Addrd(sent, test::dummy_addr()), &[]);

    let ack = Addrd(Message::empty(Type::Ack, mid), test::dummy_addr());
    assert_eq!(m.receive_empty(&ack), Matched::Existing(id));

    m.complete(id);
    assert_eq!(m.receive_empty(&ack), Matched::Unmatched);
  }

  #[test]
  fn next_mid_skips_ids_in_use() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Con {0 . 01} x 0 tk [9]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();

    let mut sent = msg!(Con {0 . 01} x 0 tk [9]);
    sent.id = Id(2);
    m.on_transmit(clock.instant(0), Some(id), &Addrd(sent, test::dummy_addr()), &[]);

    // seeded at 0
    assert_eq!(m.next_mid(test::dummy_addr()), Id(1));
    assert_eq!(m.next_mid(test::dummy_addr()), Id(3));
    assert_eq!(m.next_mid(test::addr(1)), Id(4));
  }

  #[test]
  fn complete_is_idempotent() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Con {0 . 01} x 0 tk [9]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();

    let shared = m.get(id).unwrap().shared.clone();
    assert!(m.complete(id).is_some());
    assert!(m.complete(id).is_none());
    assert!(shared.is_completed());
    assert_eq!(m.len(), 0);
    assert_eq!(m.find_by_token(m.key(test::dummy_addr(), Token::from_bytes(&[9]))),
               None);
  }

  #[test]
  fn stale_and_prune() {
    let (clock, mut m) = matcher(Config::default());
    let id = m.open_local(clock.instant(0),
                          Addrd(msg!(Non {0 . 01} x 0 tk [9]), test::dummy_addr()),
                          SecurityContext::default())
              .unwrap();
    m.get_mut(id).unwrap().sent_at = Some(clock.instant(0));
    let remote = match m.receive_request(clock.instant(0),
                                         Addrd(msg!(Non {0 . 01} x 5 tk [1]), test::addr(7)),
                                         SecurityContext::default())
                        .unwrap()
    {
      | Matched::Fresh(id) => id,
      | other => panic!("{:?}", other),
    };
    m.get_mut(remote).unwrap().sent_at = Some(clock.instant(500));

    assert!(m.stale(clock.instant(1_000), 1_000).is_empty());
    assert_eq!(m.stale(clock.instant(1_001), 1_000), vec![id]);
    assert_eq!(m.stale(clock.instant(1_501), 1_000), vec![id, remote]);

    m.prune(clock.instant(1_000), 1_000);
    assert_eq!(m.dedup_len(), 1);
    m.prune(clock.instant(1_001), 1_000);
    assert_eq!(m.dedup_len(), 0);
  }
}
