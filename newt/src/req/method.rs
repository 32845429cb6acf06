use newt_msg::Code;

use crate::code;

/// Request method
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Method(pub(super) Code);

impl Method {
  /// The code this method is encoded as
  pub fn code(&self) -> Code {
    self.0
  }

  code!(#[doc = "Retrieve a representation of a resource"] GET = Method(0 * 01));
  code!(#[doc = "Process the enclosed representation"] POST = Method(0 * 02));
  code!(#[doc = "Create or replace a resource with the enclosed representation"] PUT = Method(0 * 03));
  code!(#[doc = "Delete a resource"] DELETE = Method(0 * 04));
}

impl core::fmt::Display for Method {
  fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
    match *self {
      | Method::GET => write!(f, "GET"),
      | Method::POST => write!(f, "POST"),
      | Method::PUT => write!(f, "PUT"),
      | Method::DELETE => write!(f, "DELETE"),
      | Method(other) => write!(f, "{}", other),
    }
  }
}
