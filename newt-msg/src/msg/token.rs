use toad_macros::rfc_7252_doc;

#[doc = rfc_7252_doc!("5.3.1")]
#[derive(Copy, Clone, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct Token(pub tinyvec::ArrayVec<[u8; 8]>);

impl Token {
  /// Take an arbitrary-length sequence of bytes and turn it into an opaque message token
  ///
  /// Currently uses the BLAKE2 hashing algorithm, but this may change in the future.
  ///
  /// ```
  /// use newt_msg::Token;
  ///
  /// let my_token = Token::opaque(&[0, 1, 2]);
  /// assert_eq!(my_token.0.len(), 8);
  /// ```
  pub fn opaque(data: &[u8]) -> Token {
    use blake2::digest::consts::U8;
    use blake2::{Blake2b, Digest};

    let mut digest = Blake2b::<U8>::new();
    digest.update(data);
    Token(Into::<[u8; 8]>::into(digest.finalize()).into())
  }

  /// Copy up to 8 bytes into a token, dropping any excess
  ///
  /// ```
  /// use newt_msg::Token;
  ///
  /// assert_eq!(Token::from_bytes(&[0x37]).0.as_slice(), &[0x37]);
  /// assert_eq!(Token::from_bytes(&[1; 9]).0.len(), 8);
  /// ```
  pub fn from_bytes(bytes: &[u8]) -> Token {
    let mut arr = tinyvec::ArrayVec::<[u8; 8]>::new();
    arr.extend(bytes.iter().copied().take(8));
    Token(arr)
  }

  /// Is this the zero-length token?
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
