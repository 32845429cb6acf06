use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embedded_time::Instant;
use newt_msg::{Message, Token};
use toad_stem::Stem;

use crate::config::Config;
use crate::core::{Core, Effect, Effects, EmptyKind};
use crate::error::Error;
use crate::exchange::{ExchangeId, ExecutionPolicy, Handler, ResponseRoute, Shared, Sink};
use crate::logging::msg_summary;
use crate::net::{Addrd, Connector, Outbound, SecurityContext, SocketAddr};
use crate::req::Req;
use crate::resp::{code, Resp};
use crate::time::{self, Clock};

mod queue;
mod registry;
mod slot;

use queue::{Task, TaskQueue};
use registry::Registry;
pub use slot::ResultSlot;

/// How often an idle worker polls the connector
const POLL_INTERVAL_MS: u64 = 5;

/// How often exchanges & message ids are checked for expiry
/// when no retransmission is due
const HOUSEKEEPING_INTERVAL_MS: u64 = 1_000;

/// What an [`Interceptor`] wants done with a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  /// Let it through
  Continue,
  /// Drop it. A dropped outbound request finishes its
  /// exchange as [`Outcome::Canceled`](crate::exchange::Outcome::Canceled).
  Cancel,
}

/// Sees every message entering or leaving the endpoint.
///
/// Retransmissions and replayed replies are not shown again.
pub trait Interceptor: Send + Sync {
  /// A message is about to be sent to `to`
  fn outbound(&self, _msg: &Message, _to: SocketAddr) -> Verdict {
    Verdict::Continue
  }

  /// A message arrived from `from`
  fn inbound(&self, _msg: &Message, _from: SocketAddr) -> Verdict {
    Verdict::Continue
  }
}

/// Told about every observe notification delivered to a request
/// sent from this endpoint
pub trait NotificationListener: Send + Sync {
  #[allow(missing_docs)]
  fn on_notification(&self, request: &Req, notification: &Addrd<Resp>);
}

/// Told about endpoint lifecycle changes
pub trait EndpointObserver: Send + Sync {
  /// The protocol worker started
  fn started(&self) {}
  /// The protocol worker stopped
  fn stopped(&self) {}
  /// The endpoint was destroyed
  fn destroyed(&self) {}
}

/// Receives requests from peers.
///
/// Every request is delivered once, reassembled & deduplicated.
/// Answer it with [`Endpoint::respond`], or [`Endpoint::accept`]
/// first if the response will take a while.
pub trait MessageDeliverer<C: Clock, N: Connector>: Send + Sync {
  #[allow(missing_docs)]
  fn deliver_request(&self, endpoint: &Endpoint<C, N>, exchange: ExchangeId, req: Addrd<Req>);
}

impl<C, N, F> MessageDeliverer<C, N> for F
  where C: Clock,
        N: Connector,
        F: Fn(&Endpoint<C, N>, ExchangeId, Addrd<Req>) + Send + Sync
{
  fn deliver_request(&self, endpoint: &Endpoint<C, N>, exchange: ExchangeId, req: Addrd<Req>) {
    self(endpoint, exchange, req)
  }
}

/// A request sent by [`Endpoint::send`]
#[derive(Debug, Clone)]
pub struct ExchangeHandle {
  id: ExchangeId,
  shared: Arc<Shared>,
  queue: Arc<TaskQueue>,
}

impl ExchangeHandle {
  #[allow(missing_docs)]
  pub fn id(&self) -> ExchangeId {
    self.id
  }

  /// Has the exchange ended?
  pub fn is_done(&self) -> bool {
    self.shared.is_completed()
  }

  /// Has [`ExchangeHandle::cancel`] been called?
  pub fn is_canceled(&self) -> bool {
    self.shared.is_canceled()
  }

  /// Ask for the exchange to be canceled.
  ///
  /// Safe to call from any thread, any number of times. Only the
  /// first call on a live exchange returns `true`; the handler then
  /// sees [`Outcome::Canceled`](crate::exchange::Outcome::Canceled)
  /// once the protocol stage gets to it.
  pub fn cancel(&self) -> bool {
    if self.shared.is_completed() || !self.shared.cancel() {
      return false;
    }

    self.queue.push(Task::Cancel(self.id));
    true
  }
}

struct Inner<C: Clock, N: Connector> {
  core: Mutex<Core<C>>,
  clock: C,
  connector: N,
  queue: Arc<TaskQueue>,
  deliverer: Stem<Option<Arc<dyn MessageDeliverer<C, N>>>>,
  server_policy: Stem<ExecutionPolicy>,
  interceptors: Registry<dyn Interceptor>,
  listeners: Registry<dyn NotificationListener>,
  observers: Registry<dyn EndpointObserver>,
  worker: Mutex<Option<JoinHandle<()>>>,
  running: AtomicBool,
  destroyed: AtomicBool,
  housekept_at: AtomicU64,
}

/// A CoAP endpoint: one [`Core`], one [`Connector`] and a single
/// queue all protocol work goes through.
///
/// Cheap to clone; clones share everything.
///
/// Drive it with a worker thread ([`Endpoint::start`]) or
/// by calling [`Endpoint::run_pending`] yourself.
pub struct Endpoint<C: Clock, N: Connector> {
  inner: Arc<Inner<C, N>>,
}

impl<C: Clock, N: Connector> Clone for Endpoint<C, N> {
  fn clone(&self) -> Self {
    Self { inner: self.inner.clone() }
  }
}

impl<C: Clock, N: Connector> core::fmt::Debug for Endpoint<C, N> {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Endpoint")
     .field("local_addr", &self.local_addr())
     .field("started", &self.is_started())
     .field("queued", &self.inner.queue.len())
     .field("interceptors", &self.inner.interceptors)
     .finish()
  }
}

impl<C: Clock, N: Connector> Endpoint<C, N> {
  /// Create an endpoint. It does nothing until started or driven.
  pub fn new(config: Config, clock: C, connector: N) -> Result<Self, Error> {
    let core = Core::new(config)?;

    let inner = Inner { core: Mutex::new(core),
                        clock,
                        connector,
                        queue: Arc::new(TaskQueue::default()),
                        deliverer: Stem::new(None),
                        server_policy: Stem::new(ExecutionPolicy::default()),
                        interceptors: Registry::default(),
                        listeners: Registry::default(),
                        observers: Registry::default(),
                        worker: Mutex::new(None),
                        running: AtomicBool::new(false),
                        destroyed: AtomicBool::new(false),
                        housekept_at: AtomicU64::new(0) };

    Ok(Self { inner: Arc::new(inner) })
  }

  fn core(&self) -> MutexGuard<'_, Core<C>> {
    self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn now(&self) -> Instant<C> {
    match self.inner.clock.try_now() {
      | Ok(now) => now,
      | Err(e) => {
        log::error!("clock failed: {:?}", e);
        Instant::new(0)
      },
    }
  }

  /// Runtime config
  pub fn config(&self) -> Config {
    *self.core().config()
  }

  /// The address the connector is bound to
  pub fn local_addr(&self) -> SocketAddr {
    self.inner.connector.local_addr()
  }

  /// Number of exchanges in flight
  pub fn active_exchanges(&self) -> usize {
    self.core().active_exchanges()
  }

  /// Set who receives requests from peers.
  ///
  /// Without one, every request is answered with 4.04 Not Found.
  pub fn set_deliverer(&self, deliverer: Arc<dyn MessageDeliverer<C, N>>) {
    self.inner
        .deliverer
        .map_mut(|slot| *slot = Some(deliverer.clone()));
  }

  /// [`Endpoint::set_deliverer`] for a closure
  pub fn on_request<F>(&self, f: F)
    where F: Fn(&Endpoint<C, N>, ExchangeId, Addrd<Req>) + Send + Sync + 'static
  {
    self.set_deliverer(Arc::new(f));
  }

  /// How requests from peers are delivered & answered.
  ///
  /// With an executor, requests are handed to the deliverer on it.
  pub fn set_server_policy(&self, policy: ExecutionPolicy) {
    self.inner
        .server_policy
        .map_mut(|p| *p = policy.clone());
  }

  #[allow(missing_docs)]
  pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) {
    self.inner.interceptors.add(interceptor);
  }

  /// Returns whether the interceptor was registered
  pub fn remove_interceptor(&self, interceptor: &Arc<dyn Interceptor>) -> bool {
    self.inner.interceptors.remove(interceptor)
  }

  #[allow(missing_docs)]
  pub fn add_notification_listener(&self, listener: Arc<dyn NotificationListener>) {
    self.inner.listeners.add(listener);
  }

  /// Returns whether the listener was registered
  pub fn remove_notification_listener(&self, listener: &Arc<dyn NotificationListener>) -> bool {
    self.inner.listeners.remove(listener)
  }

  #[allow(missing_docs)]
  pub fn add_observer(&self, observer: Arc<dyn EndpointObserver>) {
    self.inner.observers.add(observer);
  }

  /// Returns whether the observer was registered
  pub fn remove_observer(&self, observer: &Arc<dyn EndpointObserver>) -> bool {
    self.inner.observers.remove(observer)
  }

  /// Send a request.
  ///
  /// `handler` is told about notifications (if the request observes
  /// a resource) and, exactly once, how the exchange ended.
  pub fn send(&self,
              req: Addrd<Req>,
              handler: Arc<dyn Handler>,
              policy: ExecutionPolicy)
              -> Result<ExchangeHandle, Error> {
    if self.inner.destroyed.load(Ordering::SeqCst) {
      return Err(Error::Shutdown);
    }

    let now = self.now();
    let sink = Sink::new(handler, policy.executor.clone());

    let (handle, fx) = {
      let mut core = self.core();
      let (id, fx) = core.send_request(now, req, SecurityContext::default(), sink, policy)?;

      // already over, e.g. it could not be serialized
      let shared = core.shared(id).unwrap_or_else(|| {
                                    let shared = Arc::new(Shared::default());
                                    shared.complete();
                                    shared
                                  });

      (ExchangeHandle { id,
                        shared,
                        queue: self.inner.queue.clone() },
       fx)
    };

    self.perform(fx);
    Ok(handle)
  }

  /// Send a request and wait up to `timeout` for the response.
  ///
  /// If the endpoint is not started, the calling thread drives
  /// the protocol stage while it waits. On giving up the exchange
  /// is canceled.
  pub fn send_blocking(&self, req: Addrd<Req>, timeout: Duration) -> Result<Addrd<Resp>, Error> {
    let slot = ResultSlot::new();
    let handle = self.send(req, slot.clone(), ExecutionPolicy::default())?;
    let deadline = std::time::Instant::now() + timeout;

    loop {
      let left = deadline.saturating_duration_since(std::time::Instant::now());
      let wait = match self.is_started() {
        | true => left,
        | false => {
          self.run_pending();
          left.min(Duration::from_millis(POLL_INTERVAL_MS))
        },
      };

      if let Some(outcome) = slot.wait(wait) {
        return outcome.into_result();
      }

      if left.is_zero() {
        handle.cancel();
        return Err(Error::WaitElapsed);
      }
    }
  }

  /// Respond to a request delivered by the [`MessageDeliverer`].
  ///
  /// Depending on the exchange's [`ResponseRoute`] the response is
  /// processed right away or enqueued onto the protocol stage.
  pub fn respond(&self, exchange: ExchangeId, resp: Resp) -> Result<(), Error> {
    let policy = self.core()
                     .policy(exchange)
                     .ok_or(Error::UnknownExchange(exchange))?;

    match policy.responses {
      | ResponseRoute::Inline => {
        let now = self.now();
        let fx = self.core().send_response(now, exchange, resp)?;
        self.perform(fx);
      },
      | ResponseRoute::ProtocolStage => self.inner.queue.push(Task::Respond(exchange, resp)),
    }

    Ok(())
  }

  /// Acknowledge a CON request now and respond to it later.
  ///
  /// Always happens on the calling thread.
  pub fn accept(&self, exchange: ExchangeId) -> Result<(), Error> {
    self.send_empty(exchange, EmptyKind::Accept)
  }

  /// Refuse a request with a RST.
  ///
  /// Always happens on the calling thread.
  pub fn reject(&self, exchange: ExchangeId) -> Result<(), Error> {
    self.send_empty(exchange, EmptyKind::Reject)
  }

  fn send_empty(&self, exchange: ExchangeId, kind: EmptyKind) -> Result<(), Error> {
    let now = self.now();
    let fx = self.core().send_empty(now, exchange, kind)?;
    self.perform(fx);
    Ok(())
  }

  /// Stop observing whatever the request with `token` observes
  pub fn cancel_observation(&self, token: Token) {
    self.inner.queue.push(Task::CancelObservation(token));
  }

  /// Read everything the connector has, schedule due timers and
  /// run queued tasks until the queue is empty.
  ///
  /// Returns the number of tasks run.
  pub fn run_pending(&self) -> usize {
    if self.inner.destroyed.load(Ordering::SeqCst) {
      return 0;
    }

    self.pump();

    let mut ran = 0;
    while let Some(task) = self.inner.queue.pop() {
      self.run(task);
      ran += 1;
    }

    ran
  }

  /// Start a worker thread that drives the endpoint
  pub fn start(&self) -> Result<(), Error> {
    if self.inner.destroyed.load(Ordering::SeqCst) {
      return Err(Error::Shutdown);
    }

    if self.inner.running.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    let ep = self.clone();
    let worker = thread::spawn(move || ep.work());
    *self.inner
         .worker
         .lock()
         .unwrap_or_else(PoisonError::into_inner) = Some(worker);

    log::debug!("endpoint {} started", self.local_addr());
    self.inner
        .observers
        .snapshot()
        .iter()
        .for_each(|o| o.started());
    Ok(())
  }

  /// Stop the worker thread. Queued tasks stay queued.
  pub fn stop(&self) {
    if !self.inner.running.swap(false, Ordering::SeqCst) {
      return;
    }

    self.inner.queue.wake();
    let worker = self.inner
                     .worker
                     .lock()
                     .unwrap_or_else(PoisonError::into_inner)
                     .take();

    if let Some(worker) = worker {
      if worker.thread().id() != thread::current().id() && worker.join().is_err() {
        log::error!("protocol worker panicked");
      }
    }

    log::debug!("endpoint {} stopped", self.local_addr());
    self.inner
        .observers
        .snapshot()
        .iter()
        .for_each(|o| o.stopped());
  }

  /// Stop, cancel every exchange and refuse further work
  pub fn destroy(&self) {
    self.stop();
    if self.inner.destroyed.swap(true, Ordering::SeqCst) {
      return;
    }

    let dropped = self.inner.queue.clear();
    if dropped > 0 {
      log::debug!("dropped {} queued task(s)", dropped);
    }

    let fx = self.core().destroy();
    self.perform(fx);

    log::debug!("endpoint {} destroyed", self.local_addr());
    self.inner
        .observers
        .snapshot()
        .iter()
        .for_each(|o| o.destroyed());
  }

  /// Is a worker thread driving the endpoint?
  pub fn is_started(&self) -> bool {
    self.inner.running.load(Ordering::SeqCst)
  }

  fn work(&self) {
    log::trace!("protocol worker running");
    while self.inner.running.load(Ordering::SeqCst) {
      self.run_pending();
      let idle = self.idle_wait();
      self.inner.queue.wait(idle);
    }
    log::trace!("protocol worker exiting");
  }

  fn idle_wait(&self) -> Duration {
    let now = self.now();
    let next = self.core().next_deadline();
    let ms = next.map(|d| time::millis_between(now, d))
                 .unwrap_or(POLL_INTERVAL_MS)
                 .min(POLL_INTERVAL_MS);
    Duration::from_millis(ms)
  }

  /// Queue up received bytes, and a tick if one is due
  fn pump(&self) {
    loop {
      match self.inner.connector.poll() {
        | Ok(Some(inbound)) => self.inner.queue.push(Task::Recv(inbound)),
        | Ok(None) => break,
        | Err(e) => {
          log::warn!("polling transport failed: {:?}", e);
          break;
        },
      }
    }

    let now = self.now();
    let due = self.core()
                  .next_deadline()
                  .map(|d| d <= now)
                  .unwrap_or(false);

    let ms = time::millis_since_epoch(now);
    let housekeeping = ms.saturating_sub(self.inner.housekept_at.load(Ordering::SeqCst))
                       >= HOUSEKEEPING_INTERVAL_MS;

    if due || housekeeping {
      self.inner.housekept_at.store(ms, Ordering::SeqCst);
      self.inner.queue.push(Task::Tick);
    }
  }

  /// Run a task; a panicking task is logged and forgotten
  fn run(&self, task: Task) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| self.execute(task))) {
      let msg = panic.downcast_ref::<&str>()
                     .map(|s| s.to_string())
                     .or_else(|| panic.downcast_ref::<String>().cloned())
                     .unwrap_or_else(|| "unknown panic".to_string());
      log::error!("protocol task failed: {}", msg);
    }
  }

  fn execute(&self, task: Task) {
    let now = self.now();

    match task {
      | Task::Recv(inbound) => {
        let decoded = self.core().decode(now, &inbound);
        let msg = match decoded {
          | Ok(msg) => msg,
          | Err(fx) => return self.perform(fx),
        };

        if self.intercepted(|i| i.inbound(msg.data(), msg.addr())) {
          log::debug!("interceptor dropped {} from {}",
                      msg_summary(msg.data()),
                      msg.addr());
          return;
        }

        let fx = self.core().recv_msg(now, msg, inbound.context);
        self.perform(fx);
      },
      | Task::Respond(id, resp) => {
        let sent = self.core().send_response(now, id, resp);
        match sent {
          | Ok(fx) => self.perform(fx),
          | Err(e) => log::warn!("could not respond on {}: {}", id, e),
        }
      },
      | Task::Cancel(id) => {
        let fx = self.core().cancel(id);
        self.perform(fx);
      },
      | Task::CancelObservation(token) => {
        let fx = self.core().cancel_observation(token);
        self.perform(fx);
      },
      | Task::Tick => {
        let fx = self.core().tick(now);
        self.perform(fx);
      },
    }
  }

  fn intercepted(&self, f: impl Fn(&dyn Interceptor) -> Verdict) -> bool {
    self.inner
        .interceptors
        .snapshot()
        .iter()
        .any(|i| f(i.as_ref()) == Verdict::Cancel)
  }

  /// Carry out effects. Never called with the core locked.
  fn perform(&self, fx: Effects) {
    fx.into_iter().for_each(|effect| match effect {
                    | Effect::Transmit { exchange,
                                         msg,
                                         bytes,
                                         context, } => self.transmit(exchange, msg, bytes, context),
                    | Effect::DeliverRequest { exchange, req } => self.deliver(exchange, req),
                    | Effect::Notify { sink,
                                       request,
                                       resp, } => {
                      self.inner
                          .listeners
                          .snapshot()
                          .iter()
                          .for_each(|l| l.on_notification(&request, &resp));
                      sink.notify(resp);
                    },
                    | Effect::Finish { sink, outcome } => {
                      sink.finish(outcome);
                    },
                    | Effect::Log(level, line) => log::log!(level, "{}", line),
                  });
  }

  fn transmit(&self,
              exchange: Option<ExchangeId>,
              msg: Option<Message>,
              bytes: Addrd<Vec<u8>>,
              context: SecurityContext) {
    if let Some(msg) = &msg {
      if self.intercepted(|i| i.outbound(msg, bytes.addr())) {
        log::debug!("interceptor dropped {} to {}",
                    msg_summary(msg),
                    bytes.addr());
        if let Some(id) = exchange {
          let fx = self.core().cancel(id);
          self.perform(fx);
        }
        return;
      }
    }

    let out = Outbound { bytes: bytes.as_ref().map(|b| b.as_slice()),
                         context };
    if let Err(e) = nb::block!(self.inner.connector.send(out)) {
      log::warn!("failed to send {} bytes to {}: {:?}",
                 bytes.data().len(),
                 bytes.addr(),
                 e);
      if let Some(id) = exchange {
        let fx = self.core().fail(id, Error::Transport(format!("{:?}", e)));
        self.perform(fx);
      }
    }
  }

  fn deliver(&self, exchange: ExchangeId, req: Addrd<Req>) {
    let policy = self.inner.server_policy.map_ref(|p| p.clone());
    self.core().set_policy(exchange, policy.clone());

    let deliverer = match self.inner.deliverer.map_ref(|d| d.clone()) {
      | Some(d) => d,
      | None => {
        log::debug!("nobody handles {:?}; answering 4.04", req.data().path());
        if let Some(mut resp) = Resp::for_request(req.data()) {
          resp.set_code(code::NOT_FOUND);
          if let Err(e) = self.respond(exchange, resp) {
            log::warn!("could not respond on {}: {}", exchange, e);
          }
        }
        return;
      },
    };

    match policy.executor {
      | Some(executor) => {
        let ep = self.clone();
        executor.execute(Box::new(move || deliverer.deliver_request(&ep, exchange, req)));
      },
      | None => deliverer.deliver_request(self, exchange, req),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use newt_msg::{Action as ObserveAction, Code, Id, Type};

  use super::*;
  use crate::config;
  use crate::exchange::{Executor, Outcome};
  use crate::test::{self, addr, msg, ClockMock, ConnectorMock, Recorder};

  type Ep = Endpoint<ClockMock, ConnectorMock>;

  fn endpoint(cfg: Config) -> (ClockMock, ConnectorMock, Ep) {
    test::log();
    let clock = ClockMock::new();
    let net = ConnectorMock::new();
    let cfg = Config { token_seed: 0x5EED,
                       ..cfg };
    let ep = Endpoint::new(cfg, clock.clone(), net.clone()).unwrap();
    (clock, net, ep)
  }

  /// The response a server at `from` would send to `req`
  fn answer(req: &Addrd<Message>, code: Code, from: SocketAddr) -> Addrd<Message> {
    Addrd(Message::new(Type::Ack, code, req.data().id, req.data().token), from)
  }

  #[derive(Default)]
  struct Deferred(Mutex<Vec<Box<dyn FnOnce() + Send>>>);

  impl Deferred {
    fn run_all(&self) -> usize {
      let work = std::mem::take(&mut *self.0.lock().unwrap());
      let n = work.len();
      work.into_iter().for_each(|f| f());
      n
    }
  }

  impl Executor for Deferred {
    fn execute(&self, work: Box<dyn FnOnce() + Send>) {
      self.0.lock().unwrap().push(work);
    }
  }

  #[test]
  fn request_gets_response() {
    let (_, net, ep) = endpoint(Config::default());
    let rec = Recorder::new();

    ep.send(Addrd(Req::get("hello"), addr(2)),
            rec.clone(),
            ExecutionPolicy::default())
      .unwrap();

    let sent = net.sent_msgs();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].addr(), addr(2));

    net.push_rx(answer(&sent[0], code::CONTENT, addr(2)));
    assert!(ep.run_pending() >= 1);

    match &rec.outcomes()[..] {
      | [Outcome::Response(r)] => assert_eq!(r.data().code(), code::CONTENT),
      | other => panic!("{:?}", other),
    }
    assert_eq!(ep.active_exchanges(), 0);
  }

  #[test]
  fn unanswered_request_times_out() {
    let cfg = Config { con: config::Con { ack_random_factor: 1.0,
                                          ..Default::default() },
                       ..Default::default() };
    let (clock, net, ep) = endpoint(cfg);
    let rec = Recorder::new();

    let mut req = Req::get("t");
    req.set_token(Token::from_bytes(&[0x37]));
    ep.send(Addrd(req, addr(2)), rec.clone(), ExecutionPolicy::default())
      .unwrap();
    assert_eq!(net.sent_msgs()[0].data().token, Token::from_bytes(&[0x37]));

    let mut transmitted_at = vec![0];
    for ms in (500..=32_000).step_by(500) {
      let before = net.sent().len();
      clock.set(ms);
      ep.run_pending();
      if net.sent().len() > before {
        transmitted_at.push(ms);
      }
    }

    assert_eq!(transmitted_at, vec![0, 2_000, 4_000, 8_000, 16_000]);
    assert_eq!(rec.outcomes(),
               vec![Outcome::Error(Error::Timeout { attempts: 5 })]);
  }

  #[test]
  fn requests_are_delivered_and_answered_inline() {
    let (_, net, ep) = endpoint(Config::default());
    ep.on_request(|ep: &Ep, id, req: Addrd<Req>| {
        let mut resp = Resp::for_request(req.data()).unwrap();
        resp.set_payload(req.data().path().join("/").bytes());
        ep.respond(id, resp).unwrap();
      });

    let mut get = msg!(Con {0 . 01} x 17 tk [3]);
    get.set_path("a/b");
    net.push_rx(Addrd(get.clone(), addr(3)));
    net.push_rx(Addrd(get, addr(3)));
    ep.run_pending();

    let sent = net.sent_msgs();
    assert_eq!(sent.len(), 2);
    assert_eq!(net.sent()[0], net.sent()[1]);
    assert_eq!(sent[0].data().ty, Type::Ack);
    assert_eq!(sent[0].data().id, Id(17));
    assert_eq!(sent[0].data().payload.0, b"a/b".to_vec());
  }

  #[test]
  fn without_deliverer_requests_are_not_found() {
    let (_, net, ep) = endpoint(Config::default());
    net.push_rx(Addrd(msg!(Non {0 . 01} x 4 tk [3]), addr(3)));
    ep.run_pending();

    let sent = net.sent_msgs();
    assert_eq!(sent.len(), 1);
    assert_eq!((sent[0].data().ty, sent[0].data().code),
               (Type::Non, code::NOT_FOUND));
  }

  #[test]
  fn responses_can_be_routed_through_the_queue() {
    let (_, net, ep) = endpoint(Config::default());
    let delivered = Arc::new(Mutex::new(vec![]));

    ep.set_server_policy(ExecutionPolicy { executor: None,
                                           responses: ResponseRoute::ProtocolStage });
    {
      let delivered = delivered.clone();
      ep.on_request(move |_: &Ep, id, req: Addrd<Req>| {
          delivered.lock().unwrap().push((id, req.unwrap()));
        });
    }

    net.push_rx(Addrd(msg!(Con {0 . 01} x 9 tk [1]), addr(3)));
    ep.run_pending();

    let (id, req) = delivered.lock().unwrap()[0].clone();
    ep.respond(id, Resp::ack(&req)).unwrap();
    assert!(net.sent().is_empty());

    assert_eq!(ep.run_pending(), 1);
    assert_eq!(net.sent_msgs()[0].data().id, Id(9));
  }

  #[test]
  fn callbacks_run_on_the_given_executor() {
    let (_, net, ep) = endpoint(Config::default());
    let exec = Arc::new(Deferred::default());
    let rec = Recorder::new();

    ep.send(Addrd(Req::get("a"), addr(2)),
            rec.clone(),
            ExecutionPolicy::with_executor(exec.clone()))
      .unwrap();

    net.push_rx(answer(&net.sent_msgs()[0], code::CONTENT, addr(2)));
    ep.run_pending();
    assert!(rec.outcomes().is_empty());

    assert_eq!(exec.run_all(), 1);
    assert_eq!(rec.outcomes().len(), 1);
  }

  #[test]
  fn requests_can_be_delivered_on_an_executor() {
    let (_, net, ep) = endpoint(Config::default());
    let exec = Arc::new(Deferred::default());
    ep.set_server_policy(ExecutionPolicy::with_executor(exec.clone()));
    ep.on_request(|ep: &Ep, id, req: Addrd<Req>| {
        ep.respond(id, Resp::ack(req.data())).unwrap();
      });

    net.push_rx(Addrd(msg!(Con {0 . 01} x 9 tk [1]), addr(3)));
    ep.run_pending();
    assert!(net.sent().is_empty());

    assert_eq!(exec.run_all(), 1);
    assert!(net.sent().is_empty(), "response waits for the protocol stage");
    ep.run_pending();
    assert_eq!(net.sent_msgs()[0].data().id, Id(9));
  }

  #[test]
  fn accept_then_respond() {
    let (_, net, ep) = endpoint(Config::default());
    let delivered = Arc::new(Mutex::new(vec![]));
    {
      let delivered = delivered.clone();
      ep.on_request(move |ep: &Ep, id, req: Addrd<Req>| {
          ep.accept(id).unwrap();
          delivered.lock().unwrap().push((id, req.unwrap()));
        });
    }

    net.push_rx(Addrd(msg!(Con {0 . 01} x 9 tk [1]), addr(3)));
    ep.run_pending();

    let sent = net.sent_msgs();
    assert_eq!(sent[0].data(), &Message::empty(Type::Ack, Id(9)));

    let (id, req) = delivered.lock().unwrap()[0].clone();
    ep.respond(id, Resp::ack(&req)).unwrap();
    let resp = net.sent_msgs()[1].clone();
    assert_eq!(resp.data().ty, Type::Con);

    net.push_rx(Addrd(Message::empty(Type::Ack, resp.data().id), addr(3)));
    ep.run_pending();
    assert_eq!(ep.active_exchanges(), 0);
  }

  #[test]
  fn reject_sends_reset() {
    let (_, net, ep) = endpoint(Config::default());
    ep.on_request(|ep: &Ep, id, _| ep.reject(id).unwrap());

    net.push_rx(Addrd(msg!(Con {0 . 01} x 9 tk [1]), addr(3)));
    ep.run_pending();

    assert_eq!(net.sent_msgs()[0].data(), &Message::empty(Type::Reset, Id(9)));
    assert_eq!(ep.active_exchanges(), 0);
  }

  struct DropRequests;
  impl Interceptor for DropRequests {
    fn outbound(&self, msg: &Message, _: SocketAddr) -> Verdict {
      match msg.code.kind() {
        | newt_msg::CodeKind::Request => Verdict::Cancel,
        | _ => Verdict::Continue,
      }
    }
  }

  struct DropEverythingInbound;
  impl Interceptor for DropEverythingInbound {
    fn inbound(&self, _: &Message, _: SocketAddr) -> Verdict {
      Verdict::Cancel
    }
  }

  #[test]
  fn outbound_interceptor_cancels_request() {
    let (_, net, ep) = endpoint(Config::default());
    let rec = Recorder::new();
    let interceptor: Arc<dyn Interceptor> = Arc::new(DropRequests);
    ep.add_interceptor(interceptor.clone());

    ep.send(Addrd(Req::get("a"), addr(2)), rec.clone(), ExecutionPolicy::default())
      .unwrap();
    assert!(net.sent().is_empty());
    assert_eq!(rec.outcomes(), vec![Outcome::Canceled]);

    assert!(ep.remove_interceptor(&interceptor));
    ep.send(Addrd(Req::get("a"), addr(2)), rec.clone(), ExecutionPolicy::default())
      .unwrap();
    assert_eq!(net.sent().len(), 1);
  }

  #[test]
  fn inbound_interceptor_drops_messages() {
    let (_, net, ep) = endpoint(Config::default());
    let hits = Arc::new(AtomicUsize::new(0));
    {
      let hits = hits.clone();
      ep.on_request(move |_: &Ep, _, _| {
          hits.fetch_add(1, Ordering::SeqCst);
        });
    }
    ep.add_interceptor(Arc::new(DropEverythingInbound));

    net.push_rx(Addrd(msg!(Con {0 . 01} x 9 tk [1]), addr(3)));
    ep.run_pending();

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert!(net.sent().is_empty());
  }

  #[derive(Default)]
  struct Listener(Mutex<Vec<(Req, u32)>>);
  impl NotificationListener for Listener {
    fn on_notification(&self, request: &Req, notification: &Addrd<Resp>) {
      self.0
          .lock()
          .unwrap()
          .push((request.clone(), notification.data().observe().unwrap_or(0)));
    }
  }

  #[test]
  fn notifications_reach_listeners_until_canceled() {
    let (_, net, ep) = endpoint(Config::default());
    let rec = Recorder::new();
    let listener = Arc::new(Listener::default());
    ep.add_notification_listener(listener.clone());

    let mut get = Req::get("temp");
    get.observe(ObserveAction::Register);
    ep.send(Addrd(get, addr(2)), rec.clone(), ExecutionPolicy::default())
      .unwrap();

    let req = net.sent_msgs()[0].clone();
    let token = req.data().token;
    for (seq, mid) in [(1u32, req.data().id.0), (3, 700), (2, 701)] {
      let mut n = answer(&req, code::CONTENT, addr(2));
      n.data_mut().set_observe(seq);
      if seq > 1 {
        n.data_mut().ty = Type::Non;
        n.data_mut().id = Id(mid);
      }
      net.push_rx(n);
    }
    ep.run_pending();

    let seen = listener.0.lock().unwrap().iter().map(|(_, seq)| *seq).collect::<Vec<_>>();
    assert_eq!(seen, vec![1, 3]);
    assert_eq!(rec.notifications().len(), 2);
    assert_eq!(listener.0.lock().unwrap()[0].0.path(), vec!["temp"]);
    assert!(rec.outcomes().is_empty());

    ep.cancel_observation(token);
    ep.run_pending();
    assert_eq!(rec.outcomes(), vec![Outcome::Canceled]);
  }

  #[test]
  fn transport_failure_fails_the_exchange() {
    let (_, net, ep) = endpoint(Config::default());
    let rec = Recorder::new();
    net.broken.store(true, Ordering::SeqCst);

    ep.send(Addrd(Req::get("a"), addr(2)), rec.clone(), ExecutionPolicy::default())
      .unwrap();

    match &rec.outcomes()[..] {
      | [Outcome::Error(Error::Transport(_))] => (),
      | other => panic!("{:?}", other),
    }
    assert_eq!(ep.active_exchanges(), 0);
  }

  #[test]
  fn panicking_deliverer_does_not_stop_the_queue() {
    let (_, net, ep) = endpoint(Config::default());
    let calls = Arc::new(AtomicUsize::new(0));
    {
      let calls = calls.clone();
      ep.on_request(move |ep: &Ep, id, req: Addrd<Req>| {
          if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("first request explodes");
          }
          ep.respond(id, Resp::ack(req.data())).unwrap();
        });
    }

    net.push_rx(Addrd(msg!(Con {0 . 01} x 1 tk [1]), addr(3)));
    net.push_rx(Addrd(msg!(Con {0 . 01} x 2 tk [2]), addr(3)));
    assert_eq!(ep.run_pending(), 2);

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(net.sent_msgs()[0].data().id, Id(2));
  }

  #[test]
  fn handle_cancels_once() {
    let (_, _, ep) = endpoint(Config::default());
    let rec = Recorder::new();
    let handle = ep.send(Addrd(Req::get("a"), addr(2)), rec.clone(), ExecutionPolicy::default())
                   .unwrap();

    assert!(handle.cancel());
    assert!(!handle.cancel());
    assert!(handle.is_canceled());
    assert!(!handle.is_done());

    ep.run_pending();
    assert!(handle.is_done());
    assert!(!handle.cancel());
    assert_eq!(rec.outcomes(), vec![Outcome::Canceled]);
  }

  #[test]
  fn cancel_racing_a_response_finishes_once() {
    let (_, net, ep) = endpoint(Config::default());

    for _ in 0..200 {
      let rec = Recorder::new();
      let handle = ep.send(Addrd(Req::get("race"), addr(2)), rec.clone(), ExecutionPolicy::default())
                     .unwrap();
      let req = net.sent_msgs().pop().unwrap();
      let start = Arc::new(std::sync::Barrier::new(2));

      let canceler = {
        let start = start.clone();
        thread::spawn(move || {
          start.wait();
          handle.cancel();
        })
      };
      let responder = {
        let (ep, net, start) = (ep.clone(), net.clone(), start.clone());
        thread::spawn(move || {
          start.wait();
          net.push_rx(answer(&req, code::CONTENT, addr(2)));
          ep.run_pending();
        })
      };

      canceler.join().unwrap();
      responder.join().unwrap();
      ep.run_pending();

      match &rec.outcomes()[..] {
        | [Outcome::Canceled] | [Outcome::Response(_)] => (),
        | other => panic!("{:?}", other),
      }
      assert_eq!(ep.active_exchanges(), 0);
    }
  }

  #[test]
  fn send_requires_destination() {
    let (_, net, ep) = endpoint(Config::default());
    let res = ep.send(Addrd(Req::get("a"), "0.0.0.0:5683".parse().unwrap()),
                      Recorder::new(),
                      ExecutionPolicy::default());
    assert_eq!(res.map(|h| h.id()), Err(Error::DestinationMissing));
    assert!(net.sent().is_empty());
  }

  #[test]
  fn blocking_send_gives_up() {
    let (_, _, ep) = endpoint(Config::default());
    let res = ep.send_blocking(Addrd(Req::get("a"), addr(2)), Duration::from_millis(20));
    assert_eq!(res, Err(Error::WaitElapsed));

    ep.run_pending();
    assert_eq!(ep.active_exchanges(), 0);
  }

  #[test]
  fn blocking_send_with_worker() {
    let (_, net, ep) = endpoint(Config::default());
    ep.start().unwrap();

    let server = {
      let net = net.clone();
      thread::spawn(move || {
        let req = loop {
          match net.sent_msgs().pop() {
            | Some(req) => break req,
            | None => thread::sleep(Duration::from_millis(1)),
          }
        };
        let mut resp = answer(&req, code::CONTENT, addr(2));
        resp.data_mut().payload.0 = b"pong".to_vec();
        net.push_rx(resp);
      })
    };

    let resp = ep.send_blocking(Addrd(Req::get("ping"), addr(2)), Duration::from_secs(5))
                 .unwrap();
    assert_eq!(resp.data().payload(), b"pong");

    server.join().unwrap();
    ep.stop();
    assert!(!ep.is_started());
  }

  #[derive(Default)]
  struct Lifecycle(Mutex<Vec<&'static str>>);
  impl EndpointObserver for Lifecycle {
    fn started(&self) {
      self.0.lock().unwrap().push("started");
    }

    fn stopped(&self) {
      self.0.lock().unwrap().push("stopped");
    }

    fn destroyed(&self) {
      self.0.lock().unwrap().push("destroyed");
    }
  }

  #[test]
  fn lifecycle() {
    let (_, _, ep) = endpoint(Config::default());
    let seen = Arc::new(Lifecycle::default());
    ep.add_observer(seen.clone());
    let rec = Recorder::new();

    ep.start().unwrap();
    ep.start().unwrap();
    assert!(ep.is_started());
    ep.send(Addrd(Req::get("a"), addr(2)), rec.clone(), ExecutionPolicy::default())
      .unwrap();

    ep.destroy();
    ep.destroy();
    assert_eq!(*seen.0.lock().unwrap(), vec!["started", "stopped", "destroyed"]);
    assert_eq!(rec.outcomes(), vec![Outcome::Canceled]);
    assert_eq!(ep.active_exchanges(), 0);

    let after = ep.send(Addrd(Req::get("a"), addr(2)), rec, ExecutionPolicy::default());
    assert_eq!(after.map(|h| h.id()), Err(Error::Shutdown));
    assert_eq!(ep.start(), Err(Error::Shutdown));
  }
}
