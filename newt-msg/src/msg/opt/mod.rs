use toad_macros::rfc_7252_doc;

use toad_cursor::Cursor;
use crate::from_bytes::*;
use crate::OptionMap;

/// Option parsing errors
pub mod parse_error;
pub use parse_error::*;

/// Option numbers & value types that this crate knows about
pub mod known;

pub(crate) fn parse_opt_len_or_delta<A: AsRef<[u8]>>(head: u8,
                                                     bytes: &mut Cursor<A>,
                                                     reserved_err: OptParseError)
                                                     -> Result<u32, OptParseError> {
  match head {
    | 13 => {
      let n = bytes.next().ok_or_else(OptParseError::eof)?;
      Ok((n as u32) + 13)
    },
    | 14 => match bytes.take_exact(2) {
      | Some(&[a, b]) => Ok(u16::from_be_bytes([a, b]) as u32 + 269),
      | _ => Err(OptParseError::eof()),
    },
    | 15 => Err(reserved_err),
    | _ => Ok(head as u32),
  }
}

#[doc = rfc_7252_doc!("5.4")]
/// <details><summary><b>RFC7252 Section 3.1 Option binary format</b></summary>
#[doc = concat!("\n#", rfc_7252_doc!("3.1"))]
/// </details>
///
/// # `Opt` struct
/// Low-level representation of a freshly parsed CoAP Option
///
/// This struct just stores data parsed directly from the message on the wire,
/// and does not compute or store the Option Number. Messages keep their
/// options in an [`OptionMap`] keyed by number instead.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct Opt {
  /// See [`OptDelta`]
  pub delta: OptDelta,
  /// See [`OptValue`]
  pub value: OptValue,
}

impl Opt {
  /// Given a collection to [`Extend`] and an Opt, add that Opt's bytes to the collection.
  pub fn extend_bytes(self, bytes: &mut impl Extend<u8>) {
    let (del, del_bytes) = crate::to_bytes::opt_len_or_delta(self.delta.0);
    let (len, len_bytes) = crate::to_bytes::opt_len_or_delta(self.value.0.len() as u32);
    let del = del << 4;

    let header = del | len;

    bytes.extend(Some(header));

    if let Some(bs) = del_bytes {
      bytes.extend(bs);
    }

    if let Some(bs) = len_bytes {
      bytes.extend(bs);
    }

    bytes.extend(self.value.0);
  }
}

/// The "Option Delta" is the difference between this Option's Number
/// and the previous Option's number.
///
/// This is just used to compute the Option Number, identifying which
/// Option is being set (e.g. Content-Format has a Number of 12)
///
/// # Related
/// - [RFC7252#section-3.1 Option Format](https://datatracker.ietf.org/doc/html/rfc7252#section-3.1)
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Debug, Default)]
pub struct OptDelta(pub u32);

#[doc = rfc_7252_doc!("5.4.6")]
/// <details><summary><b>RFC7252 Section 12.2 Core CoAP Option Numbers</b></summary>
#[doc = concat!("\n#", rfc_7252_doc!("12.2"))]
/// </details>
#[derive(Copy, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct OptNumber(pub u32);

#[doc = rfc_7252_doc!("5.4.1")]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OptionMustBeProcessed {
  /// This option must be processed,
  /// and a response that ignores it
  /// will be rejected.
  ///
  /// Corresponds to the option being "critical"
  /// in strict CoAP terms
  Yes,
  /// This option does not _need_ to
  /// be processed,
  /// and a response that ignores it
  /// will be processed anyway.
  ///
  /// Corresponds to the option being "elective"
  /// in strict CoAP terms
  No,
}

#[doc = rfc_7252_doc!("5.4.2")]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum WhenOptionChanges {
  /// Different values for this option yield different responses.
  ///
  /// Corresponds to the option being not "NoCacheKey"
  /// in strict CoAP terms
  ResponseChanges,
  /// Different values for this option should
  /// yield the same response.
  ///
  /// Corresponds to the option being "NoCacheKey"
  /// in strict CoAP terms
  ResponseDoesNotChange,
}

impl OptNumber {
  /// Whether or not this option may be ignored by a server
  pub fn must_be_processed(&self) -> OptionMustBeProcessed {
    match self.0 & 0b1 {
      | 1 => OptionMustBeProcessed::Yes,
      | _ => OptionMustBeProcessed::No,
    }
  }

  /// Whether or not different values for this option should
  /// yield the same response
  pub fn when_option_changes(&self) -> WhenOptionChanges {
    match (self.0 & 0b11100) >> 2 {
      | 0b111 => WhenOptionChanges::ResponseDoesNotChange,
      | _ => WhenOptionChanges::ResponseChanges,
    }
  }
}

#[doc = rfc_7252_doc!("3.2")]
#[derive(Default, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct OptValue(pub Vec<u8>);

impl OptValue {
  /// Encode an unsigned integer using as few bytes as possible
  /// (zero is the empty value)
  ///
  /// ```
  /// use newt_msg::OptValue;
  ///
  /// assert_eq!(OptValue::from_u32(0).0, Vec::<u8>::new());
  /// assert_eq!(OptValue::from_u32(0x0102).0, vec![1, 2]);
  /// assert_eq!(OptValue::from_u32(0x0102).as_u32(), 0x0102);
  /// ```
  pub fn from_u32(n: u32) -> Self {
    let bytes = n.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    OptValue(bytes[skip..].to_vec())
  }

  /// Decode an unsigned integer, ignoring bytes beyond the last 4
  pub fn as_u32(&self) -> u32 {
    self.0
        .iter()
        .rev()
        .take(4)
        .rev()
        .fold(0u32, |n, b| (n << 8) | *b as u32)
  }
}

impl<Bytes: AsRef<[u8]>> TryConsumeBytes<Bytes> for OptionMap {
  type Error = OptParseError;

  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error> {
    consume_opts(bytes).map(|(opts, _)| opts)
  }
}

/// Read options until the end of the buffer or the payload marker.
///
/// The payload marker is consumed; the returned flag says whether it was seen.
pub(crate) fn consume_opts<Bytes: AsRef<[u8]>>(bytes: &mut Cursor<Bytes>)
                                               -> Result<(OptionMap, bool), OptParseError> {
  let mut opts = OptionMap::default();
  let mut number = 0u32;

  loop {
    if bytes.remaining() == 0 {
      break Ok((opts, false));
    }

    match Opt::try_consume_bytes(bytes) {
      | Ok(Opt { delta, value }) => {
        number = number.checked_add(delta.0)
                       .ok_or(OptParseError::OptionNumberOverflow)?;
        opts.entry(OptNumber(number)).or_default().push(value);
      },
      | Err(OptParseError::OptionsExhausted) => break Ok((opts, true)),
      | Err(e) => break Err(e),
    }
  }
}

impl<Bytes: AsRef<[u8]>> TryConsumeBytes<Bytes> for Opt {
  type Error = OptParseError;

  fn try_consume_bytes(bytes: &mut Cursor<Bytes>) -> Result<Self, Self::Error> {
    let byte1 = bytes.next()
                     .ok_or(OptParseError::OptionsExhausted)
                     .and_then(|b| {
                       if b == 0b11111111 {
                         Err(OptParseError::OptionsExhausted)
                       } else {
                         Ok(b)
                       }
                     })?;

    // NOTE: Delta **MUST** be consumed before Value.
    let delta = parse_opt_len_or_delta(byte1 >> 4,
                                       bytes,
                                       OptParseError::OptionDeltaReservedValue(15))?;
    let delta = OptDelta(delta);

    let len = parse_opt_len_or_delta(byte1 & 0b00001111,
                                     bytes,
                                     OptParseError::ValueLengthReservedValue(15))?
              as usize;

    let value = bytes.take_exact(len)
                     .ok_or(OptParseError::UnexpectedEndOfStream)?
                     .to_vec();

    Ok(Opt { delta,
             value: OptValue(value) })
  }
}
