pub use std::net::SocketAddr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Largest datagram we expect to read off the wire
pub const MAX_DGRAM: usize = 2048;

/// Data that came from (or is headed to) a network socket
#[derive(PartialEq, PartialOrd, Eq, Ord, Hash, Debug, Clone, Copy)]
pub struct Addrd<T>(pub T, pub SocketAddr);

impl<T> Addrd<T> {
  /// Borrow the contents of this Addressed
  pub fn as_ref(&self) -> Addrd<&T> {
    Addrd(self.data(), self.addr())
  }

  /// Discard the socket and get the data in this Addressed
  pub fn unwrap(self) -> T {
    self.0
  }

  /// Map the data contained in this Addressed
  pub fn map<R>(self, f: impl FnOnce(T) -> R) -> Addrd<R> {
    Addrd(f(self.0), self.1)
  }

  /// Map the data contained in this Addressed (with a copy of the address)
  pub fn map_with_addr<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> Addrd<R> {
    Addrd(f(self.0, self.1), self.1)
  }

  /// Borrow the contents of the addressed item
  pub fn data(&self) -> &T {
    &self.0
  }

  /// Mutably borrow the contents of the addressed item
  pub fn data_mut(&mut self) -> &mut T {
    &mut self.0
  }

  /// Copy the socket address for the data
  pub fn addr(&self) -> SocketAddr {
    self.1
  }

  /// Turn the entire structure into something else
  pub fn fold<R>(self, f: impl FnOnce(T, SocketAddr) -> R) -> R {
    f(self.0, self.1)
  }
}

impl<T> AsMut<T> for Addrd<T> {
  fn as_mut(&mut self) -> &mut T {
    &mut self.0
  }
}

/// Can messages be sent to this address?
///
/// ```
/// use newt::net::is_deliverable;
///
/// assert!(is_deliverable("127.0.0.1:5683".parse().unwrap()));
/// assert!(!is_deliverable("0.0.0.0:5683".parse().unwrap()));
/// assert!(!is_deliverable("127.0.0.1:0".parse().unwrap()));
/// ```
pub fn is_deliverable(addr: SocketAddr) -> bool {
  !addr.ip().is_unspecified() && addr.port() != 0
}

/// The kind of transport messages travel over.
///
/// This decides the wire framing, how responses are correlated with
/// requests and whether messages are retransmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Transport {
  /// Unreliable & unordered (UDP, DTLS).
  ///
  /// Messages carry a type & message id, CON messages are
  /// retransmitted and responses are matched by peer + token.
  Datagram,
  /// Reliable & ordered (TCP, TLS, WebSockets).
  ///
  /// Messages are length-prefixed, nothing is retransmitted and
  /// responses are matched by token alone.
  Stream,
}

/// Opaque handle to whatever security association (e.g. a DTLS session)
/// a datagram arrived over.
///
/// It is stored on the exchange the datagram belongs to
/// and handed back to the connector with every reply.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SecurityContext(pub Option<u64>);

/// Bytes received by a [`Connector`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
  /// The bytes & who sent them
  pub dgram: Addrd<Vec<u8>>,
  /// See [`SecurityContext`]
  pub context: SecurityContext,
}

/// Bytes to be sent by a [`Connector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outbound<'a> {
  /// The bytes & who to send them to
  pub bytes: Addrd<&'a [u8]>,
  /// See [`SecurityContext`]
  pub context: SecurityContext,
}

/// The transport boundary.
///
/// A connector moves raw bytes; it knows nothing about messages.
/// Sending reports its result directly: `Ok` once the bytes were
/// handed to the network, `Err` otherwise.
pub trait Connector: Send + Sync + 'static {
  /// The error yielded by connector operations
  type Error: core::fmt::Debug;

  /// Get the local address this connector is bound to
  fn local_addr(&self) -> SocketAddr;

  /// Send bytes to a remote address
  fn send(&self, out: Outbound<'_>) -> nb::Result<(), Self::Error>;

  /// Pull a buffered datagram from the connector, along with the address of the sender.
  ///
  /// It is expected that (like [`std::net::UdpSocket`]) if the datagram is larger
  /// than the buffer, the excess bytes are dropped and this is not considered an error.
  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error>;

  /// Poll for bytes from any peer
  fn poll(&self) -> Result<Option<Inbound>, Self::Error> {
    let mut buf = vec![0u8; MAX_DGRAM];

    match self.recv(&mut buf) {
      | Ok(Addrd(n, addr)) => {
        buf.truncate(n);
        Ok(Some(Inbound { dgram: Addrd(buf, addr),
                          context: SecurityContext::default() }))
      },
      | Err(nb::Error::WouldBlock) => Ok(None),
      | Err(nb::Error::Other(e)) => Err(e),
    }
  }
}
