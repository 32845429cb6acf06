use newt_msg::Token;

use crate::net::{SocketAddr, Transport};

/// What a response is correlated to its request by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TokenKey {
  /// Datagram transports: message ids and tokens are only
  /// meaningful in the scope of one peer
  Peer(SocketAddr, Token),
  /// Stream transports: the connection already scopes the token
  Bare(Token),
}

impl TokenKey {
  pub(crate) fn new(transport: Transport, peer: SocketAddr, token: Token) -> Self {
    match transport {
      | Transport::Datagram => TokenKey::Peer(peer, token),
      | Transport::Stream => TokenKey::Bare(token),
    }
  }

  pub(crate) fn token(&self) -> Token {
    match self {
      | TokenKey::Peer(_, t) | TokenKey::Bare(t) => *t,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::test;

  #[test]
  fn datagram_keys_include_peer() {
    let t = Token::from_bytes(&[1]);
    let a = TokenKey::new(Transport::Datagram, test::addr(1), t);
    let b = TokenKey::new(Transport::Datagram, test::addr(2), t);
    assert_ne!(a, b);

    let a = TokenKey::new(Transport::Stream, test::addr(1), t);
    let b = TokenKey::new(Transport::Stream, test::addr(2), t);
    assert_eq!(a, b);
    assert_eq!(a.token(), t);
  }
}
