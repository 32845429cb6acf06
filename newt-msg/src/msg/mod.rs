use std::collections::BTreeMap;

use toad_macros::rfc_7252_doc;

/// Message Code
pub mod code;

/// Message parsing errors
pub mod parse_error;

/// Message ID
pub mod id;

/// Message Options
pub mod opt;

/// Message Type
pub mod ty;

/// Message Token
pub mod token;

/// Message Version
pub mod ver;

pub use code::*;
pub use id::*;
pub use opt::known::observe::Action;
pub use opt::known::Block;
pub use opt::*;
pub use parse_error::*;
pub use token::*;
pub use ty::*;
pub use ver::*;

use toad_cursor::Cursor;
use crate::from_bytes::TryConsumeBytes;
use crate::TryFromBytes;

/// Options in a message, keyed by number and kept in ascending order.
///
/// Repeated options store their values in the order they appeared.
pub type OptionMap = BTreeMap<OptNumber, Vec<OptValue>>;

#[doc = rfc_7252_doc!("5.5")]
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Payload(pub Vec<u8>);

/// Struct representing the first byte of a message.
///
/// ```text
/// CoAP version
/// |
/// |  Message type (request, response, empty)
/// |  |
/// |  |  Length of token, in bytes. (4-bit integer)
/// |  |  |
/// vv vv vvvv
/// 01 00 0000
/// ```
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub(crate) struct Byte1 {
  pub(crate) ver: Version,
  pub(crate) ty: Type,
  pub(crate) tkl: u8,
}

impl From<u8> for Byte1 {
  fn from(b: u8) -> Self {
    let ver = b >> 6; // bits 0 & 1
    let ty = b >> 4 & 0b11; // bits 2 & 3
    let tkl = b & 0b1111u8; // last 4 bits

    Byte1 { ver: Version(ver),
            ty: Type::from(ty),
            tkl }
  }
}

/// The fixed 4-byte header of a datagram message.
///
/// Decoding only the header allows the receiver of a message whose
/// options or payload are malformed to still see whether it was
/// Confirmable, and which message id to reject.
///
/// ```
/// use newt_msg::{Header, Id, Type};
///
/// // CON, tkl 8 but no token bytes follow
/// let garbage = [0b0100_1000, 0b0000_0001, 0, 17];
/// let header = Header::try_from_bytes(&garbage).unwrap();
/// assert_eq!(header.ty, Type::Con);
/// assert_eq!(header.id, Id(17));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
  /// see [`Version`]
  pub ver: Version,
  /// see [`Type`]
  pub ty: Type,
  /// token length
  pub tkl: u8,
  /// see [`Code`]
  pub code: Code,
  /// see [`Id`]
  pub id: Id,
}

impl Header {
  /// Decode the fixed header, ignoring everything after it
  pub fn try_from_bytes(bytes: &[u8]) -> Result<Self, MessageParseError> {
    match bytes {
      | &[b1, code, id_a, id_b, ..] => {
        let Byte1 { ver, ty, tkl } = Byte1::from(b1);
        Ok(Header { ver,
                    ty,
                    tkl,
                    code: code.into(),
                    id: Id::from_be_bytes([id_a, id_b]) })
      },
      | _ => Err(MessageParseError::eof()),
    }
  }
}

/// # `Message` struct
/// Low-level representation of a message that has been parsed from the raw binary format.
///
/// Messages support both serializing to bytes and from bytes, by using the provided [`TryFromBytes`] and [`TryIntoBytes`](crate::TryIntoBytes) traits.
///
/// <details>
/// <summary><b>RFC7252 - CoAP Messaging Model</b></summary>
#[doc = concat!("\n#", rfc_7252_doc!("2.1"))]
/// </details>
/// <details>
/// <summary><b>RFC7252 - CoAP Message Binary Format</b></summary>
#[doc = concat!("\n#", rfc_7252_doc!("3"))]
/// </details>
///
/// ```
/// use std::collections::BTreeMap;
///
/// use newt_msg::TryFromBytes;
/// use newt_msg::*;
/// # //                       version  token len  code (2.05 Content)
/// # //                       |        |          /
/// # //                       |  type  |         /  message ID
/// # //                       |  |     |        |   |
/// # //                       vv vv vvvv vvvvvvvv vvvvvvvvvvvvvvvv
/// # let header: [u8; 4] = 0b_01_00_0001_01000101_0000000000000001u32.to_be_bytes();
/// # let token: [u8; 1] = [254u8];
/// # let content_format: &[u8] = b"application/json";
/// # let options: [&[u8]; 2] = [&[0b_1100_1101u8, 0b00000011u8], content_format];
/// # let payload: [&[u8]; 2] = [&[0b_11111111u8], b"hello, world!"];
/// let packet: Vec<u8> = /* bytes! */
/// # [header.as_ref(), token.as_ref(), options.concat().as_ref(), payload.concat().as_ref()].concat();
///
/// let msg = Message::try_from_bytes(&packet).unwrap();
///
/// let expected = Message {
///   id: Id(1),
///   ty: Type::Con,
///   ver: Version(1),
///   token: Token(tinyvec::array_vec!([u8; 8] => 254)),
///   opts: BTreeMap::from([(OptNumber(12), vec![OptValue(content_format.to_vec())])]),
///   code: Code {class: 2, detail: 5},
///   payload: Payload(b"hello, world!".to_vec()),
/// };
///
/// assert_eq!(msg, expected);
/// ```
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Message {
  /// see [`Id`] for details
  pub id: Id,
  /// see [`Type`] for details
  pub ty: Type,
  /// see [`Version`] for details
  pub ver: Version,
  /// see [`Token`] for details
  pub token: Token,
  /// see [`Code`] for details
  pub code: Code,
  /// see [`OptionMap`] for details
  pub opts: OptionMap,
  /// see [`Payload`]
  pub payload: Payload,
}

impl Message {
  /// Create a message with no options and no payload
  pub fn new(ty: Type, code: Code, id: Id, token: Token) -> Self {
    Self { id,
           ty,
           ver: Version::default(),
           token,
           code,
           opts: OptionMap::default(),
           payload: Payload::default() }
  }

  /// Create an Empty (0.00) message, e.g. a CoAP ping or a bare ACK / RST
  pub fn empty(ty: Type, id: Id) -> Self {
    Self::new(ty, Code::EMPTY, id, Token::default())
  }

  /// Create an empty message that ACKnowledges this one.
  ///
  /// ```
  /// use newt_msg::{Code, Id, Message, Token, Type};
  ///
  /// let req = Message::new(Type::Con, Code::GET, Id(7), Token::from_bytes(&[1]));
  /// let ack = req.ack();
  ///
  /// assert_eq!(ack.ty, Type::Ack);
  /// assert_eq!(ack.id, Id(7));
  /// assert!(ack.token.0.is_empty());
  /// ```
  pub fn ack(&self) -> Self {
    Self::empty(Type::Ack, self.id)
  }

  /// Create an empty message that rejects this one
  pub fn reset(&self) -> Self {
    Self::empty(Type::Reset, self.id)
  }

  /// Is this message an Empty (0.00) message?
  pub fn is_empty(&self) -> bool {
    self.code.kind() == CodeKind::Empty
  }

  /// Rough number of bytes this message will occupy on the wire
  pub fn get_size(&self) -> usize {
    let header_size = 4;
    let payload_size = match self.payload.0.len() {
      | 0 => 0,
      | n => n + 1,
    };
    let opts_size: usize = self.opts
                               .values()
                               .flatten()
                               .map(|v| v.0.len() + 5)
                               .sum();

    header_size + self.token.0.len() + opts_size + payload_size
  }

  /// Get all values of an option
  pub fn get(&self, n: OptNumber) -> Option<&Vec<OptValue>> {
    self.opts.get(&n)
  }

  /// Get the first value of an option
  pub fn get_first(&self, n: OptNumber) -> Option<&OptValue> {
    self.get(n).and_then(|vs| vs.first())
  }

  /// Get the first value of an option interpreted as an unsigned integer
  pub fn get_u32(&self, n: OptNumber) -> Option<u32> {
    self.get_first(n).map(OptValue::as_u32)
  }

  /// Replace all values of an option with a single value
  pub fn set(&mut self, n: OptNumber, v: OptValue) -> Option<Vec<OptValue>> {
    self.opts.insert(n, vec![v])
  }

  /// Replace all values of an option with an unsigned integer
  pub fn set_u32(&mut self, n: OptNumber, v: u32) {
    self.set(n, OptValue::from_u32(v));
  }

  /// Add a value to a (repeatable) option
  pub fn add(&mut self, n: OptNumber, v: OptValue) {
    self.opts.entry(n).or_default().push(v);
  }

  /// Remove an option entirely
  pub fn remove(&mut self, n: OptNumber) -> Option<Vec<OptValue>> {
    self.opts.remove(&n)
  }

  /// Get the Block1 option (describes the request body)
  pub fn block1(&self) -> Option<Block> {
    self.get_u32(known::BLOCK1).map(Block::from)
  }

  /// Set the Block1 option
  pub fn set_block1(&mut self, size: u16, num: u32, more: bool) {
    self.set_u32(known::BLOCK1, Block::new(size, num, more).into());
  }

  /// Get the Block2 option (describes the response body)
  pub fn block2(&self) -> Option<Block> {
    self.get_u32(known::BLOCK2).map(Block::from)
  }

  /// Set the Block2 option
  pub fn set_block2(&mut self, size: u16, num: u32, more: bool) {
    self.set_u32(known::BLOCK2, Block::new(size, num, more).into());
  }

  /// Get the Observe option.
  ///
  /// In requests this is an [`Action`], in notifications a sequence number.
  pub fn observe(&self) -> Option<u32> {
    self.get_u32(known::OBSERVE)
  }

  /// Get the Observe option of a request as an [`Action`]
  pub fn observe_action(&self) -> Option<Action> {
    self.observe().and_then(|n| Action::try_from(n).ok())
  }

  /// Set the Observe option
  pub fn set_observe(&mut self, n: u32) {
    self.set_u32(known::OBSERVE, n & 0xFF_FF_FF);
  }

  /// Get the first ETag option value
  pub fn etag(&self) -> Option<&[u8]> {
    self.get_first(known::repeat::ETAG).map(|v| v.0.as_slice())
  }

  /// Set the ETag option
  pub fn set_etag(&mut self, tag: impl Into<Vec<u8>>) {
    self.set(known::repeat::ETAG, OptValue(tag.into()));
  }

  /// Get the Size1 option (total request body size)
  pub fn size1(&self) -> Option<u32> {
    self.get_u32(known::no_repeat::SIZE1)
  }

  /// Get the Size2 option (total response body size)
  pub fn size2(&self) -> Option<u32> {
    self.get_u32(known::no_repeat::SIZE2)
  }

  /// Replace the Uri-Path options with the segments of `path`
  ///
  /// ```
  /// use newt_msg::{Code, Id, Message, Token, Type};
  ///
  /// let mut req = Message::new(Type::Con, Code::GET, Id(1), Token::default());
  /// req.set_path("/a/b/");
  /// assert_eq!(req.path(), vec!["a", "b"]);
  /// ```
  pub fn set_path(&mut self, path: &str) {
    self.remove(known::no_repeat::PATH);
    path.split('/')
        .filter(|s| !s.is_empty())
        .for_each(|seg| self.add(known::no_repeat::PATH, OptValue(seg.as_bytes().to_vec())));
  }

  /// Get the Uri-Path segments, skipping any that are not utf8
  pub fn path(&self) -> Vec<&str> {
    self.get(known::no_repeat::PATH)
        .map(|vs| {
          vs.iter()
            .filter_map(|v| core::str::from_utf8(&v.0).ok())
            .collect()
        })
        .unwrap_or_default()
  }

  /// Get the Uri-Query values, skipping any that are not utf8
  pub fn query(&self) -> Vec<&str> {
    self.get(known::repeat::QUERY)
        .map(|vs| {
          vs.iter()
            .filter_map(|v| core::str::from_utf8(&v.0).ok())
            .collect()
        })
        .unwrap_or_default()
  }

  /// The resource this message targets, as `path?query`.
  ///
  /// ```
  /// use newt_msg::{known, Code, Id, Message, OptValue, Token, Type};
  ///
  /// let mut req = Message::new(Type::Con, Code::GET, Id(1), Token::default());
  /// req.set_path("fw/image");
  /// assert_eq!(req.uri_key(), "fw/image");
  ///
  /// req.add(known::repeat::QUERY, OptValue(b"v=2".to_vec()));
  /// assert_eq!(req.uri_key(), "fw/image?v=2");
  /// ```
  pub fn uri_key(&self) -> String {
    let path = self.path().join("/");
    match self.query() {
      | q if q.is_empty() => path,
      | q => format!("{}?{}", path, q.join("&")),
    }
  }
}

impl<Bytes: AsRef<[u8]>> TryFromBytes<Bytes> for Message {
  type Error = MessageParseError;

  fn try_from_bytes(bytes: Bytes) -> Result<Self, Self::Error> {
    let mut bytes = Cursor::new(bytes);

    let Byte1 { tkl, ty, ver } = bytes.next().ok_or_else(MessageParseError::eof)?.into();

    if ver != Version::default() {
      return Err(Self::Error::InvalidVersion(ver.0));
    }

    if tkl > 8 {
      return Err(Self::Error::InvalidTokenLength(tkl));
    }

    let code: Code = bytes.next().ok_or_else(MessageParseError::eof)?.into();
    let id: Id = Id::try_consume_bytes(&mut bytes)?;

    let token = bytes.take_exact(tkl as usize)
                     .ok_or_else(MessageParseError::eof)?;
    let token = Token::from_bytes(token);

    let (opts, payload) = parse_opts_and_payload(&mut bytes)?;

    let msg = Message { id,
                        ty,
                        ver,
                        code,
                        token,
                        opts,
                        payload };

    if msg.is_empty()
       && (!msg.token.0.is_empty() || !msg.opts.is_empty() || !msg.payload.0.is_empty())
    {
      return Err(Self::Error::EmptyMessageWithContent);
    }

    Ok(msg)
  }
}

/// Parse the options & payload section shared by datagram and stream framing
pub(crate) fn parse_opts_and_payload<A: AsRef<[u8]>>(
  bytes: &mut Cursor<A>)
  -> Result<(OptionMap, Payload), MessageParseError> {
  let (opts, marker) = opt::consume_opts(bytes).map_err(MessageParseError::OptParseError)?;

  match (marker, bytes.remaining()) {
    | (true, 0) => Err(MessageParseError::PayloadMarkerWithoutPayload),
    | (true, _) => Ok((opts, Payload(bytes.take_until_end().to_vec()))),
    | (false, _) => Ok((opts, Payload::default())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::TryIntoBytes;

  #[test]
  fn parse_msg() {
    let (expect, msg) = crate::test_msg();
    assert_eq!(Message::try_from_bytes(&msg).unwrap(), expect)
  }

  #[test]
  fn parse_byte1() {
    let byte = 0b_01_10_0011u8;
    let byte = Byte1::from(byte);
    assert_eq!(byte,
               Byte1 { ver: Version(1),
                       ty: Type::Ack,
                       tkl: 3 })
  }

  #[test]
  fn parse_id() {
    let mut id_bytes = Cursor::new(34u16.to_be_bytes());
    let id = Id::try_consume_bytes(&mut id_bytes).unwrap();
    assert_eq!(id, Id(34));
  }

  #[test]
  fn parse_rejects_long_token() {
    let bytes = [0b0100_1001u8, 1, 0, 1];
    assert_eq!(Message::try_from_bytes(bytes),
               Err(MessageParseError::InvalidTokenLength(9)));
  }

  #[test]
  fn parse_rejects_other_versions() {
    let bytes = [0b1000_0000u8, 1, 0, 1];
    assert_eq!(Message::try_from_bytes(bytes),
               Err(MessageParseError::InvalidVersion(2)));
  }

  #[test]
  fn parse_rejects_dangling_payload_marker() {
    let bytes = [0b0101_0000u8, 0b0100_0101, 0, 1, 0xFF];
    assert_eq!(Message::try_from_bytes(bytes),
               Err(MessageParseError::PayloadMarkerWithoutPayload));
  }

  #[test]
  fn parse_rejects_empty_with_token() {
    let bytes = [0b0100_0001u8, 0, 0, 1, 12];
    assert_eq!(Message::try_from_bytes(bytes),
               Err(MessageParseError::EmptyMessageWithContent));
  }

  #[test]
  fn header_of_truncated_message() {
    let bytes = [0b0100_0100u8, 1, 0, 17, 1, 2];
    assert!(Message::try_from_bytes(bytes).is_err());

    let header = Header::try_from_bytes(&bytes).unwrap();
    assert_eq!(header.ty, Type::Con);
    assert_eq!(header.id, Id(17));
    assert_eq!(header.tkl, 4);
    assert_eq!(Header::try_from_bytes(&bytes[..3]),
               Err(MessageParseError::UnexpectedEndOfStream));
  }

  #[test]
  fn known_options() {
    let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token::from_bytes(&[1, 2]));
    msg.set_block2(512, 3, true);
    msg.set_observe(0);
    msg.set_etag([1, 2, 3, 4]);

    let msg = Message::try_from_bytes(msg.try_into_bytes().unwrap()).unwrap();
    let block = msg.block2().unwrap();
    assert_eq!((block.size(), block.num(), block.more()), (512, 3, true));
    assert_eq!(msg.observe_action(), Some(Action::Register));
    assert_eq!(msg.etag(), Some([1u8, 2, 3, 4].as_ref()));
    assert_eq!(msg.block1(), None);
  }

  #[test]
  fn ack_and_reset_are_empty() {
    let msg = Message::new(Type::Con, Code::GET, Id(9), Token::from_bytes(&[3]));
    assert!(msg.ack().is_empty());
    assert_eq!(msg.reset().ty, Type::Reset);
    assert_eq!(msg.reset().id, Id(9));
  }
}
