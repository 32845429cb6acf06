//! Low-level representation of CoAP messages.
//!
//! The most notable item in `newt_msg` is [`Message`];
//! a CoAP message very close to the actual byte layout.
//!
//! ## Framing
//! The same message can be put on the wire two ways:
//! - [`TryIntoBytes`] / [`TryFromBytes`] use the datagram layout from RFC 7252
//!   (version, type, token length, code, message id, token, options, payload)
//! - [`stream`] uses the length-prefixed layout from RFC 8323, which has no
//!   type or message id but shares the option & payload encoding.
//!
//! ```rust
//! use newt_msg::{Code, Id, Message, Token, TryFromBytes, TryIntoBytes, Type};
//!
//! let mut msg = Message::new(Type::Con, Code::GET, Id(1), Token::from_bytes(&[254]));
//! msg.set_path("sensors/temp");
//!
//! let bytes: Vec<u8> = msg.clone().try_into_bytes().unwrap();
//! assert_eq!(Message::try_from_bytes(&bytes).unwrap(), msg);
//! ```

#![cfg_attr(not(test), forbid(missing_debug_implementations, unreachable_pub))]
#![cfg_attr(not(test), deny(unsafe_code, missing_copy_implementations))]
#![cfg_attr(any(docsrs, feature = "docs"), feature(doc_cfg))]
#![deny(missing_docs)]


#[doc(hidden)]
pub mod from_bytes;

/// Message structs
pub mod msg;

/// RFC 8323 (CoAP over reliable transports) framing
pub mod stream;

#[doc(hidden)]
pub mod to_bytes;

#[doc(inline)]
pub use from_bytes::TryFromBytes;
#[doc(inline)]
pub use msg::*;
#[doc(inline)]
pub use to_bytes::{MessageToBytesError, TryIntoBytes};

#[cfg(test)]
pub(crate) fn test_msg() -> (Message, Vec<u8>) {
  use std::collections::BTreeMap;

  let header: [u8; 4] = 0b0100_0001_0100_0101_0000_0000_0000_0001_u32.to_be_bytes();
  let token: [u8; 1] = [254u8];
  let content_format: &[u8] = b"application/json";
  let options: [&[u8]; 2] = [&[0b_1100_1101u8, 0b00000011u8], content_format];
  let payload: [&[u8]; 2] = [&[0b1111_1111_u8], b"hello, world!"];
  let bytes = [header.as_ref(),
               token.as_ref(),
               options.concat().as_ref(),
               payload.concat().as_ref()].concat();

  let msg = Message { id: Id(1),
                      ty: Type::Con,
                      ver: Version(1),
                      token: Token(tinyvec::array_vec!([u8; 8] => 254)),
                      opts: BTreeMap::from([(OptNumber(12),
                                             vec![OptValue(content_format.to_vec())])]),
                      code: Code { class: 2,
                                   detail: 5 },
                      payload: Payload(b"hello, world!".to_vec()) };
  (msg, bytes)
}
