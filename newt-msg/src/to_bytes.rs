use tinyvec::ArrayVec;

use crate::*;

/// Largest value that fits the extended option delta / length encoding
pub(crate) const MAX_OPT_EXT: u32 = 65535 + 269;

/// Trait allowing fallible conversion into bytes
pub trait TryIntoBytes {
  /// Error type yielded if conversion fails
  type Error;

  /// Try to convert into a collection of bytes
  ///
  /// ```
  /// use newt_msg::{Code, Id, Message, Token, TryIntoBytes, Type};
  ///
  /// let msg = Message::new(Type::Con, Code::GET, Id(0), Token(Default::default()));
  /// let bytes: Vec<u8> = msg.try_into_bytes().unwrap();
  /// assert_eq!(bytes, vec![0b0100_0000, 0b0000_0001, 0, 0]);
  /// ```
  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error>;
}

/// Errors encounterable serializing to bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageToBytesError {
  /// An option value was longer than the option encoding can express
  OptionValueTooLong {
    /// the option
    number: OptNumber,
    /// length of the value
    len: usize,
  },
  /// The gap between two consecutive option numbers was too large to encode
  OptionDeltaTooLarge(OptNumber),
}

impl core::fmt::Display for MessageToBytesError {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match self {
      | Self::OptionValueTooLong { number, len } => {
        write!(f, "value of option {} is {} bytes long", number.0, len)
      },
      | Self::OptionDeltaTooLarge(n) => write!(f, "option {} cannot be delta-encoded", n.0),
    }
  }
}

impl std::error::Error for MessageToBytesError {}

impl TryIntoBytes for Message {
  type Error = MessageToBytesError;

  fn try_into_bytes(self) -> Result<Vec<u8>, Self::Error> {
    let mut bytes = Vec::with_capacity(self.get_size());

    let byte1: u8 = Byte1 { tkl: self.token.0.len() as u8,
                            ver: self.ver,
                            ty: self.ty }.into();
    let code: u8 = self.code.into();
    let id: [u8; 2] = self.id.into();

    bytes.push(byte1);
    bytes.push(code);
    bytes.extend(id);
    bytes.extend(self.token.0);

    extend_opts_and_payload(&self.opts, &self.payload, &mut bytes)?;

    Ok(bytes)
  }
}

/// Serialize the options & payload section shared by datagram and stream framing
pub(crate) fn extend_opts_and_payload(opts: &OptionMap,
                                      payload: &Payload,
                                      bytes: &mut Vec<u8>)
                                      -> Result<(), MessageToBytesError> {
  let mut prev = 0u32;
  for (number, values) in opts {
    for value in values {
      let delta = number.0 - prev;
      if delta > MAX_OPT_EXT {
        return Err(MessageToBytesError::OptionDeltaTooLarge(*number));
      }
      if value.0.len() as u32 > MAX_OPT_EXT {
        return Err(MessageToBytesError::OptionValueTooLong { number: *number,
                                                             len: value.0.len() });
      }

      Opt { delta: OptDelta(delta),
            value: value.clone() }.extend_bytes(bytes);
      prev = number.0;
    }
  }

  if !payload.0.is_empty() {
    bytes.push(0b11111111);
    bytes.extend(&payload.0);
  }

  Ok(())
}

pub(crate) fn opt_len_or_delta(val: u32) -> (u8, Option<ArrayVec<[u8; 2]>>) {
  match val {
    | n if n >= 269 => {
      let mut bytes = ArrayVec::new();
      bytes.extend(((n - 269) as u16).to_be_bytes());
      (14, Some(bytes))
    },
    | n if n >= 13 => {
      let mut bytes = ArrayVec::new();
      bytes.push((n as u8) - 13);
      (13, Some(bytes))
    },
    | n => (n as u8, None),
  }
}

impl From<Id> for [u8; 2] {
  fn from(id: Id) -> [u8; 2] {
    id.0.to_be_bytes()
  }
}

impl From<Type> for u8 {
  fn from(t: Type) -> u8 {
    use Type::*;
    match t {
      | Con => 0,
      | Non => 1,
      | Ack => 2,
      | Reset => 3,
    }
  }
}

impl From<Byte1> for u8 {
  fn from(b: Byte1) -> u8 {
    let ver = b.ver.0 << 6;
    let ty = u8::from(b.ty) << 4;
    let tkl = b.tkl;

    ver | ty | tkl
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{assert_eqb, assert_eqb_iter};

  #[test]
  fn msg() {
    let (msg, expected) = test_msg();
    let actual: Vec<u8> = msg.try_into_bytes().unwrap();
    assert_eqb_iter!(actual, expected);
  }

  #[test]
  fn byte_1() {
    let byte = Byte1 { ver: Version(1),
                       ty: Type::Ack,
                       tkl: 3 };
    let actual: u8 = byte.into();
    let expected = 0b_01_10_0011u8;
    assert_eqb!(actual, expected)
  }

  #[test]
  fn code() {
    let code = Code { class: 2,
                      detail: 5 };
    let actual: u8 = code.into();
    let expected = 0b0100_0101_u8;
    assert_eqb!(actual, expected)
  }

  #[test]
  fn id() {
    let id = Id(16);
    let actual = u16::from_be_bytes(id.into());
    assert_eqb!(actual, 16)
  }

  #[test]
  fn opt() {
    use core::iter::repeat;
    let cases: [(u32, Vec<u8>, Vec<u8>); 4] =
      [(24,
        repeat(1).take(100).collect(),
        [[0b1101_1101u8, 24 - 13, 100 - 13].as_ref(),
         repeat(1).take(100).collect::<Vec<u8>>().as_ref()].concat()),
       (1, vec![1], vec![0b0001_0001, 1]),
       (24, vec![1], vec![0b1101_0001, 11, 1]),
       (24,
        repeat(1).take(300).collect(),
        [[0b1101_1110, 24 - 13].as_ref(),
         (300u16 - 269).to_be_bytes().as_ref(),
         repeat(1).take(300).collect::<Vec<u8>>().as_ref()].concat())];

    cases.into_iter().for_each(|(delta, values, expected)| {
                       let opt = Opt { delta: OptDelta(delta),
                                       value: OptValue(values) };
                       let mut actual = Vec::<u8>::new();
                       opt.extend_bytes(&mut actual);
                       assert_eqb_iter!(actual, expected)
                     });
  }

  #[test]
  fn repeated_options_use_zero_delta() {
    let mut msg = Message::new(Type::Con, Code::GET, Id(0), Token(Default::default()));
    msg.set_path("a/b");

    let bytes = msg.try_into_bytes().unwrap();
    assert_eq!(&bytes[4..], &[0b1011_0001, b'a', 0b0000_0001, b'b']);
  }

  #[test]
  fn no_payload_marker() {
    let msg = Message { id: Id(0),
                        ty: Type::Con,
                        ver: Default::default(),
                        code: Code { class: 2,
                                     detail: 5 },
                        token: Token(Default::default()),
                        opts: Default::default(),
                        payload: Payload(Default::default()) };

    assert_ne!(msg.try_into_bytes().unwrap().last(), Some(&0b11111111));
  }

  #[test]
  fn option_value_too_long() {
    let mut msg = Message::new(Type::Non, Code::POST, Id(0), Token(Default::default()));
    msg.set(OptNumber(2048), OptValue(vec![0; MAX_OPT_EXT as usize + 1]));

    assert_eq!(msg.try_into_bytes(),
               Err(MessageToBytesError::OptionValueTooLong { number: OptNumber(2048),
                                                             len: MAX_OPT_EXT as usize + 1 }));
  }

  #[test]
  fn option_delta_limit() {
    let mut msg = Message::new(Type::Non, Code::POST, Id(0), Token(Default::default()));
    msg.set(OptNumber(MAX_OPT_EXT), OptValue(vec![1]));

    let bytes = msg.clone().try_into_bytes().unwrap();
    assert_eq!(&bytes[4..7], &[0b1110_0001, 0xFF, 0xFF]);
    assert_eq!(Message::try_from_bytes(&bytes), Ok(msg));

    let mut msg = Message::new(Type::Non, Code::POST, Id(0), Token(Default::default()));
    msg.set(OptNumber(MAX_OPT_EXT + 1), OptValue(vec![1]));
    assert_eq!(msg.try_into_bytes(),
               Err(MessageToBytesError::OptionDeltaTooLarge(OptNumber(MAX_OPT_EXT + 1))));
  }
}
