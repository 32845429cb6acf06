use toad_macros::rfc_7252_doc;

#[doc = rfc_7252_doc!("12.1")]
/// <details><summary><b>RFC7252 Section 3 Code</b></summary>
///
/// 8-bit unsigned integer, split into a 3-bit class (most
/// significant bits) and a 5-bit detail (least significant bits),
/// documented as "c.dd" where "c" is a digit from 0 to 7 for the
/// 3-bit subfield and "dd" are two digits from 00 to 31 for the 5-bit
/// subfield.
/// </details>
///
/// ```
/// use newt_msg::Code;
///
/// assert_eq!(Code { class: 2, detail: 5 }.to_string(), "2.05".to_string());
/// ```
#[derive(Copy, Clone, Hash, Eq, Ord, PartialEq, PartialOrd, Debug, Default)]
pub struct Code {
  /// The "class" of message codes identify it as a request or response, and provides the class of response status:
  ///
  /// |class|meaning|
  /// |---|---|
  /// |`0`|Message is a request|
  /// |`2`|Message is a success response|
  /// |`4`|Message is a client error response|
  /// |`5`|Message is a server error response|
  pub class: u8,

  /// 2-digit integer (range `[0, 32)`) that provides granular information about the response status.
  ///
  /// Will always be `0` for requests.
  pub detail: u8,
}

/// Whether a code is for a request, response, or empty message
#[derive(Copy, Clone, Hash, Eq, Ord, PartialEq, PartialOrd, Debug)]
pub enum CodeKind {
  /// A request code (0.xx)
  Request,
  /// A response code ([2-5].xx)
  Response,
  /// EMPTY (0.00)
  Empty,
  /// Classes 1, 6 and 7 are reserved (7.xx carries RFC 8323 signaling)
  Reserved,
}

impl Code {
  /// Create a new Code
  ///
  /// ```
  /// use newt_msg::Code;
  ///
  /// let content = Code::new(2, 05);
  /// ```
  pub const fn new(class: u8, detail: u8) -> Self {
    Self { class, detail }
  }

  /// EMPTY (0.00)
  pub const EMPTY: Self = Self::new(0, 0);
  /// GET (0.01)
  pub const GET: Self = Self::new(0, 1);
  /// POST (0.02)
  pub const POST: Self = Self::new(0, 2);
  /// PUT (0.03)
  pub const PUT: Self = Self::new(0, 3);
  /// DELETE (0.04)
  pub const DELETE: Self = Self::new(0, 4);

  /// Get the human string representation of a message code
  ///
  /// # Returns
  /// A `char` array
  ///
  /// This is to avoid unnecessary heap allocation,
  /// you can create a `String` with `FromIterator::<String>::from_iter`,
  /// or if the `alloc` feature of `newt` is enabled there is a `ToString` implementation provided for Code.
  /// ```
  /// use newt_msg::Code;
  ///
  /// let code = Code { class: 2,
  ///                   detail: 5 };
  /// let chars = code.to_human();
  /// let string = String::from_iter(chars);
  /// assert_eq!(string, "2.05".to_string());
  /// ```
  pub fn to_human(&self) -> [char; 4] {
    let to_char = |d: u8| char::from_digit(d.into(), 10).unwrap_or('?');
    [to_char(self.class),
     '.',
     to_char(self.detail / 10),
     to_char(self.detail % 10)]
  }

  /// Get whether this code is for a request, response, or empty message
  ///
  /// ```
  /// use newt_msg::{Code, CodeKind};
  ///
  /// let empty: Code = Code::new(0, 0);
  /// assert_eq!(empty.kind(), CodeKind::Empty);
  ///
  /// let req = Code::new(0, 1); // GET
  /// assert_eq!(req.kind(), CodeKind::Request);
  ///
  /// let resp = Code::new(2, 5); // OK CONTENT
  /// assert_eq!(resp.kind(), CodeKind::Response);
  /// ```
  pub fn kind(&self) -> CodeKind {
    match (self.class, self.detail) {
      | (0, 0) => CodeKind::Empty,
      | (0, _) => CodeKind::Request,
      | (2..=5, _) => CodeKind::Response,
      | _ => CodeKind::Reserved,
    }
  }

  /// Is this a 2.xx code?
  pub fn is_success(&self) -> bool {
    self.class == 2
  }
}

impl core::fmt::Display for Code {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    write!(f, "{}", String::from_iter(self.to_human()))
  }
}

impl From<u8> for Code {
  fn from(b: u8) -> Self {
    // xxx => class
    let class = b >> 5;

    // xxxxx => detail
    let detail = b & 0b00011111;

    Code { class, detail }
  }
}

impl From<Code> for u8 {
  fn from(code: Code) -> u8 {
    let class = code.class << 5;
    let detail = code.detail;

    class | detail
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::assert_eqb;

  #[test]
  fn parse_code() {
    let byte = 0b_01_000101_u8;
    let code = Code::from(byte);
    assert_eq!(code,
               Code { class: 2,
                      detail: 5 })
  }

  #[test]
  fn serialize_code() {
    let code = Code { class: 2,
                      detail: 31 };
    let actual: u8 = code.into();
    assert_eqb!(actual, 0b010_11111u8)
  }

  #[test]
  fn code_kinds() {
    assert_eq!(Code::new(1, 0).kind(), CodeKind::Reserved);
    assert_eq!(Code::new(7, 1).kind(), CodeKind::Reserved);
    assert_eq!(Code::new(4, 4).kind(), CodeKind::Response);
    assert_eq!(Code::new(4, 8).to_string(), "4.08");
  }
}
