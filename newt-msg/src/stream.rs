//! Messages exchanged over reliable, ordered transports (TCP, TLS, WebSockets)
//! drop the type & message id and prefix each message with its length:
//!
//! ```text
//!   0   1   2   3   4   5   6   7
//! +---------------+---------------+
//! |      Len      |      TKL      |
//! +---------------+---------------+
//! |    Extended Length (if any, 0, 1, 2 or 4 bytes)
//! +-------------------------------+
//! |             Code              |
//! +-------------------------------+
//! | Token (if any, TKL bytes) ...
//! +-------------------------------+
//! | Options (if any) ...
//! +---+---+---+---+---+---+---+---+
//! | 1 | 1 | 1 | 1 | 1 | 1 | 1 | 1 |  Payload (if any) ...
//! +---+---+---+---+---+---+---+---+
//! ```
//!
//! `Len` counts only the options & payload.
//!
//! ```
//! use newt_msg::{stream, Code, Id, Message, Token, Type};
//!
//! let mut msg = Message::new(Type::Con, Code::GET, Id(42), Token::from_bytes(&[7]));
//! msg.set_path("temp");
//!
//! let frame = stream::try_into_bytes(&msg).unwrap();
//! assert_eq!(stream::frame_len(&frame), Some(frame.len()));
//!
//! // type and id do not survive the trip
//! let parsed = stream::try_from_bytes(&frame).unwrap();
//! assert_eq!(parsed.ty, Type::Non);
//! assert_eq!(parsed.id, Id(0));
//! assert_eq!(parsed.path(), vec!["temp"]);
//! ```

use toad_cursor::Cursor;
use crate::msg::parse_opts_and_payload;
use crate::to_bytes::extend_opts_and_payload;
use crate::{Code, Id, Message, MessageParseError, MessageToBytesError, Token, Type, Version};

const EXT_1: usize = 13;
const EXT_2: usize = 269;
const EXT_4: usize = 65805;

fn len_nibble(len: usize) -> (u8, Vec<u8>) {
  match len {
    | n if n >= EXT_4 => (15, ((n - EXT_4) as u32).to_be_bytes().to_vec()),
    | n if n >= EXT_2 => (14, ((n - EXT_2) as u16).to_be_bytes().to_vec()),
    | n if n >= EXT_1 => (13, vec![(n - EXT_1) as u8]),
    | n => (n as u8, vec![]),
  }
}

/// Serialize a message using stream framing.
///
/// The message's type & id are not part of the frame.
pub fn try_into_bytes(msg: &Message) -> Result<Vec<u8>, MessageToBytesError> {
  let mut body = Vec::with_capacity(msg.get_size());
  extend_opts_and_payload(&msg.opts, &msg.payload, &mut body)?;

  let (len, ext) = len_nibble(body.len());
  let tkl = msg.token.0.len() as u8;

  let mut bytes = Vec::with_capacity(2 + ext.len() + tkl as usize + body.len());
  bytes.push((len << 4) | tkl);
  bytes.extend(ext);
  bytes.push(msg.code.into());
  bytes.extend(msg.token.0);
  bytes.extend(body);

  Ok(bytes)
}

/// Read the header of a frame at the start of `bytes`, yielding
/// `(header length including code & token, options & payload length)`.
fn header(bytes: &[u8]) -> Option<(usize, usize)> {
  let first = *bytes.first()?;
  let tkl = (first & 0b1111) as usize;

  let (ext_len, body_len) = match first >> 4 {
    | 13 => (1, *bytes.get(1)? as usize + EXT_1),
    | 14 => {
      let ext = bytes.get(1..3)?;
      (2, u16::from_be_bytes([ext[0], ext[1]]) as usize + EXT_2)
    },
    | 15 => {
      let ext = bytes.get(1..5)?;
      (4, u32::from_be_bytes([ext[0], ext[1], ext[2], ext[3]]) as usize + EXT_4)
    },
    | n => (0, n as usize),
  };

  Some((1 + ext_len + 1 + tkl, body_len))
}

/// Total length of the frame starting at `bytes[0]`, if enough of the
/// header has arrived to know it.
///
/// Used by stream readers to split a byte stream into messages.
pub fn frame_len(bytes: &[u8]) -> Option<usize> {
  header(bytes).map(|(head, body)| head + body)
}

/// Parse exactly one stream frame.
///
/// Stream frames carry no type or message id; the parsed message
/// has type [`Type::Non`] and id `0`.
pub fn try_from_bytes(bytes: &[u8]) -> Result<Message, MessageParseError> {
  let (head, body) = header(bytes).ok_or_else(MessageParseError::eof)?;
  let tkl = (bytes[0] & 0b1111) as usize;

  if tkl > 8 {
    return Err(MessageParseError::InvalidTokenLength(tkl as u8));
  }

  if bytes.len() != head + body {
    return Err(MessageParseError::FrameLengthMismatch { expected: head + body,
                                                        actual: bytes.len() });
  }

  let code: Code = bytes[head - tkl - 1].into();
  let token = Token::from_bytes(&bytes[head - tkl..head]);

  let mut cursor = Cursor::new(&bytes[head..]);
  let (opts, payload) = parse_opts_and_payload(&mut cursor)?;

  Ok(Message { id: Id(0),
               ty: Type::Non,
               ver: Version::default(),
               token,
               code,
               opts,
               payload })
}
