use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_time::Instant;
use newt_msg::{Id, Message};

use crate::error::Error;
use crate::net::{Addrd, SecurityContext, SocketAddr};
use crate::resp::Resp;
use crate::time::Clock;

/// Message ids remembered per exchange for matching ACKs & RSTs
const MAX_MIDS: usize = 16;

/// Handle to an exchange tracked by a [`Core`](crate::core::Core)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeId(pub u64);

impl core::fmt::Display for ExchangeId {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Who started an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
  /// We sent the request
  Local,
  /// A peer sent us the request
  Remote,
}

/// How an outbound request ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// The (fully reassembled) response
  Response(Addrd<Resp>),
  /// The exchange failed
  Error(Error),
  /// The exchange was canceled, either explicitly or
  /// by canceling its observation.
  ///
  /// This is a normal end, not a failure.
  Canceled,
}

impl Outcome {
  /// Collapse into a `Result`, treating cancellation as [`Error::Canceled`]
  pub fn into_result(self) -> Result<Addrd<Resp>, Error> {
    match self {
      | Outcome::Response(r) => Ok(r),
      | Outcome::Error(e) => Err(e),
      | Outcome::Canceled => Err(Error::Canceled),
    }
  }
}

/// Application callbacks for an outbound request.
///
/// `on_outcome` is invoked exactly once per request.
///
/// ```
/// use newt::exchange::{Handler, Outcome};
///
/// fn print(outcome: Outcome) {
///   println!("{:?}", outcome);
/// }
///
/// fn takes_handler(_: impl Handler) {}
/// takes_handler(print);
/// ```
pub trait Handler: Send + Sync {
  /// An observe notification arrived.
  ///
  /// Notifications always arrive in increasing order
  /// of their sequence numbers; stale ones are dropped.
  fn on_notification(&self, resp: Addrd<Resp>) {
    log::trace!("notification from {} dropped; handler ignores notifications",
                resp.addr());
  }

  /// The exchange ended
  fn on_outcome(&self, outcome: Outcome);
}

impl<F> Handler for F where F: Fn(Outcome) + Send + Sync
{
  fn on_outcome(&self, outcome: Outcome) {
    self(outcome)
  }
}

/// Something that can run application callbacks somewhere
/// other than the protocol stage (a thread pool, an async runtime, ...)
pub trait Executor: Send + Sync {
  /// Run `work` eventually
  fn execute(&self, work: Box<dyn FnOnce() + Send>);
}

/// Where responses to a remote exchange are processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseRoute {
  /// On the thread calling [`Endpoint::respond`](crate::endpoint::Endpoint::respond)
  #[default]
  Inline,
  /// Enqueued onto the protocol stage
  ProtocolStage,
}

/// Per-exchange execution settings
#[derive(Clone, Default)]
pub struct ExecutionPolicy {
  /// Where to run application callbacks.
  ///
  /// `None` runs them on the protocol stage.
  pub executor: Option<Arc<dyn Executor>>,
  /// See [`ResponseRoute`]
  pub responses: ResponseRoute,
}

impl ExecutionPolicy {
  /// Dispatch callbacks onto `executor` and process responses
  /// on the protocol stage
  pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
    Self { executor: Some(executor),
           responses: ResponseRoute::ProtocolStage }
  }
}

impl core::fmt::Debug for ExecutionPolicy {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("ExecutionPolicy")
     .field("executor", &self.executor.as_ref().map(|_| "<executor>"))
     .field("responses", &self.responses)
     .finish()
  }
}

/// Where the result of an outbound request goes.
///
/// Wraps a [`Handler`] and guarantees it sees exactly one
/// terminal call no matter how many paths try to finish the exchange.
#[derive(Clone)]
pub struct Sink {
  handler: Arc<dyn Handler>,
  done: Arc<AtomicBool>,
  executor: Option<Arc<dyn Executor>>,
}

impl Sink {
  /// Wrap a handler
  pub fn new(handler: Arc<dyn Handler>, executor: Option<Arc<dyn Executor>>) -> Self {
    Self { handler,
           done: Arc::new(AtomicBool::new(false)),
           executor }
  }

  /// Has the terminal call been made?
  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::SeqCst)
  }

  fn dispatch(&self, f: impl FnOnce(&dyn Handler) + Send + 'static) {
    let handler = self.handler.clone();
    match &self.executor {
      | Some(ex) => ex.execute(Box::new(move || f(handler.as_ref()))),
      | None => f(handler.as_ref()),
    }
  }

  /// Deliver a notification, unless the sink already finished
  pub fn notify(&self, resp: Addrd<Resp>) {
    if !self.is_done() {
      self.dispatch(move |h| h.on_notification(resp));
    }
  }

  /// Deliver the outcome.
  ///
  /// Returns `false` (and does nothing) if an outcome was already delivered.
  pub fn finish(&self, outcome: Outcome) -> bool {
    if self.done.swap(true, Ordering::SeqCst) {
      return false;
    }

    self.dispatch(move |h| h.on_outcome(outcome));
    true
  }
}

impl core::fmt::Debug for Sink {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    f.debug_struct("Sink")
     .field("done", &self.is_done())
     .field("executor", &self.executor.is_some())
     .finish()
  }
}

/// State shared between an exchange and the handles given out for it
#[derive(Debug, Default)]
pub(crate) struct Shared {
  canceled: AtomicBool,
  completed: AtomicBool,
}

impl Shared {
  /// Mark canceled. Only the first caller gets `true`.
  pub(crate) fn cancel(&self) -> bool {
    self.canceled
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
  }

  pub(crate) fn is_canceled(&self) -> bool {
    self.canceled.load(Ordering::SeqCst)
  }

  /// Mark completed. Only the first caller gets `true`.
  pub(crate) fn complete(&self) -> bool {
    !self.completed.swap(true, Ordering::SeqCst)
  }

  pub(crate) fn is_completed(&self) -> bool {
    self.completed.load(Ordering::SeqCst)
  }
}

/// Observe state of an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserveState {
  Off,
  /// Registration sent (or received) but not confirmed yet
  Pending,
  /// Notifications flow until the relation ends
  Active,
}

/// One request and its response(s)
#[derive(Debug)]
pub(crate) struct Exchange<C: Clock> {
  pub(crate) id: ExchangeId,
  pub(crate) origin: Origin,
  pub(crate) peer: SocketAddr,
  pub(crate) context: SecurityContext,
  /// The request as the application sees it (body reassembled)
  pub(crate) request: Message,
  /// The last request message on the wire
  pub(crate) current_request: Option<Message>,
  /// The last response as the application sees it
  pub(crate) response: Option<Message>,
  /// The last response message on the wire
  pub(crate) current_response: Option<Message>,
  pub(crate) retransmissions: u16,
  pub(crate) first_sent_at: Option<Instant<C>>,
  pub(crate) sent_at: Option<Instant<C>>,
  /// Round-trip time (first transmission to first response)
  pub(crate) rtt: Option<u64>,
  pub(crate) shared: Arc<Shared>,
  pub(crate) policy: ExecutionPolicy,
  pub(crate) sink: Option<Sink>,
  /// A received CON request was ACKed separately
  pub(crate) accepted: bool,
  pub(crate) observe: ObserveState,
  /// Message ids of the CON / NON messages sent for this exchange, oldest first
  pub(crate) mids: Vec<Id>,
}

impl<C: Clock> Exchange<C> {
  pub(crate) fn new(id: ExchangeId,
                    origin: Origin,
                    request: Addrd<Message>,
                    context: SecurityContext)
                    -> Self {
    let Addrd(request, peer) = request;
    Self { id,
           origin,
           peer,
           context,
           current_request: match origin {
             | Origin::Remote => Some(request.clone()),
             | Origin::Local => None,
           },
           request,
           response: None,
           current_response: None,
           retransmissions: 0,
           first_sent_at: None,
           sent_at: None,
           rtt: None,
           shared: Arc::new(Shared::default()),
           policy: ExecutionPolicy::default(),
           sink: None,
           accepted: false,
           observe: ObserveState::Off,
           mids: Vec::new() }
  }

  /// Remember a message id sent for this exchange.
  ///
  /// Returns the id evicted to make room, if any.
  pub(crate) fn push_mid(&mut self, mid: Id) -> Option<Id> {
    if self.mids.contains(&mid) {
      return None;
    }

    self.mids.push(mid);
    match self.mids.len() > MAX_MIDS {
      | true => Some(self.mids.remove(0)),
      | false => None,
    }
  }

  pub(crate) fn is_observing(&self) -> bool {
    self.observe != ObserveState::Off
  }
}
