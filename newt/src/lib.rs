//! `newt` is the message-exchange engine of a CoAP stack.
//!
//! It sits between an application sending & answering requests and a
//! [`Connector`](crate::net::Connector) moving raw bytes, and does everything
//! in between:
//! - matching responses to requests by token, and ACKs & RSTs by message id
//! - deduplicating requests, replaying the cached reply to duplicates
//! - retransmitting CON messages with exponential backoff
//! - splitting & reassembling large bodies ([RFC 7959](https://www.rfc-editor.org/rfc/rfc7959) blockwise transfer)
//! - observing resources ([RFC 7641](https://www.rfc-editor.org/rfc/rfc7641))
//!
//! ## Layout
//! The protocol logic lives in [`Core`](crate::core::Core), which never performs
//! IO or reads a clock: it is given the current time and returns
//! [`Effect`](crate::core::Effect)s to carry out.
//!
//! [`Endpoint`](crate::endpoint::Endpoint) owns a core, a clock and a connector,
//! funnels all protocol work through a single task queue and performs the effects.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use newt::config::Config;
//! use newt::endpoint::Endpoint;
//! use newt::net::Addrd;
//! use newt::req::Req;
//!
//! let sock = newt::std::bind("0.0.0.0:0").unwrap();
//! let ep = Endpoint::new(Config::default(), newt::std::Clock::new(), sock).unwrap();
//! ep.start().unwrap();
//!
//! let resp = ep.send_blocking(Addrd(Req::get("hello"), "127.0.0.1:5683".parse().unwrap()),
//!                             Duration::from_secs(10))
//!              .unwrap();
//! println!("{:?}", resp.data().payload_string());
//! ```

// style
#![allow(clippy::unused_unit)]
// -
// deny
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![deny(missing_copy_implementations)]
#![cfg_attr(not(test), deny(unsafe_code))]
// -
// warnings
#![cfg_attr(not(test), warn(unreachable_pub))]


pub(crate) mod logging;

/// customizable retrying of fallible operations
pub mod retry;

/// responses
pub mod resp;

/// requests
pub mod req;

/// runtime configuration
pub mod config;

/// errors surfaced to the application
pub mod error;

/// network abstractions
pub mod net;

/// time abstractions
pub mod time;

/// exchanges & the callbacks they end in
pub mod exchange;

/// the deterministic protocol core
pub mod core;

/// # Endpoint
///
/// Drives a [`Core`](crate::core::Core) with a clock & a
/// [`Connector`](crate::net::Connector).
///
/// Every piece of protocol work (received bytes, timer ticks, cancellations,
/// queued responses) is a task on a single FIFO queue, processed one at a
/// time by whoever drives the endpoint.
pub mod endpoint;

/// `std` platform support: UDP sockets & a monotonic clock
pub mod std;

pub(crate) mod matcher;

pub(crate) mod layer;

pub(crate) mod stack;

macro_rules! code {
  (rfc7252($section:literal) $name:ident = $c:literal * $d:literal) => {
    #[doc = toad_macros::rfc_7252_doc!($section)]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: newt_msg::Code = newt_msg::Code::new($c, $d);
  };
  (#[doc = $doc:expr] $name:ident = $c:literal * $d:literal) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: newt_msg::Code = newt_msg::Code::new($c, $d);
  };
  (#[doc = $doc:expr] $name:ident = $newtype:tt($c:literal * $d:literal)) => {
    #[doc = $doc]
    #[allow(clippy::zero_prefixed_literal)]
    pub const $name: $newtype = $newtype(newt_msg::Code::new($c, $d));
  };
}

pub(crate) use code;
