use std::io;
use std::net::{ToSocketAddrs, UdpSocket};

use embedded_time::rate::Fraction;

use crate::net::{Addrd, Connector, Outbound, SocketAddr};

fn io_to_nb(err: io::Error) -> nb::Error<io::Error> {
  match err.kind() {
    | io::ErrorKind::WouldBlock => nb::Error::WouldBlock,
    | _ => nb::Error::Other(err),
  }
}

/// Bind a non-blocking UDP socket usable as a [`Connector`]
///
/// ```no_run
/// let sock = newt::std::bind("0.0.0.0:5683").unwrap();
/// ```
pub fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<UdpSocket> {
  let sock = UdpSocket::bind(addr)?;
  sock.set_nonblocking(true)?;
  Ok(sock)
}

impl Connector for UdpSocket {
  type Error = io::Error;

  fn local_addr(&self) -> SocketAddr {
    UdpSocket::local_addr(self).unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)))
  }

  fn send(&self, out: Outbound<'_>) -> nb::Result<(), Self::Error> {
    self.send_to(out.bytes.data(), out.bytes.addr())
        .map(|_| ())
        .map_err(io_to_nb)
  }

  fn recv(&self, buffer: &mut [u8]) -> nb::Result<Addrd<usize>, Self::Error> {
    self.recv_from(buffer)
        .map(|(n, addr)| Addrd(n, addr))
        .map_err(io_to_nb)
  }
}

/// Implement [`embedded_time::Clock`] using [`std::time`] primitives
#[derive(Debug, Clone, Copy)]
pub struct Clock(std::time::Instant);

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

impl Clock {
  /// Create a new clock
  pub fn new() -> Self {
    Self(std::time::Instant::now())
  }
}

impl embedded_time::Clock for Clock {
  type T = u64;

  // microseconds
  const SCALING_FACTOR: Fraction = Fraction::new(1, 1_000_000);

  fn try_now(&self) -> Result<embedded_time::Instant<Self>, embedded_time::clock::Error> {
    let elapsed = std::time::Instant::now().duration_since(self.0);
    Ok(embedded_time::Instant::new(elapsed.as_micros() as u64))
  }
}
