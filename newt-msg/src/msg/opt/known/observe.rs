/// Value of the Observe option in a GET request
/// ([RFC 7641 section 2](https://www.rfc-editor.org/rfc/rfc7641#section-2)).
///
/// In responses the option carries a notification sequence number instead.
///
/// ```
/// use newt_msg::Action;
///
/// assert_eq!(Action::try_from(1u32), Ok(Action::Deregister));
/// assert_eq!(Action::try_from(2u32), Err(2));
/// assert_eq!(u32::from(Action::Register), 0);
/// ```
#[derive(Hash, Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum Action {
  /// Add the sender (and the request's token) to the resource's observers
  Register,
  /// Remove the sender from the resource's observers
  Deregister,
}

impl TryFrom<u32> for Action {
  type Error = u32;

  fn try_from(n: u32) -> Result<Self, u32> {
    match n {
      | 0 => Ok(Action::Register),
      | 1 => Ok(Action::Deregister),
      | other => Err(other),
    }
  }
}

impl From<Action> for u32 {
  fn from(a: Action) -> Self {
    match a {
      | Action::Register => 0,
      | Action::Deregister => 1,
    }
  }
}

impl From<Action> for u8 {
  fn from(a: Action) -> Self {
    u32::from(a) as u8
  }
}
