use std::string::FromUtf8Error;

use newt_msg::{Code, Id, Message, Payload, Token, Type};

use crate::req::Req;

/// Response codes
pub mod code;

/// A CoAP response
///
/// ```
/// use newt::req::Req;
/// use newt::resp::{code, Resp};
///
/// start_server(|req| {
///   let mut resp = Resp::for_request(&req).unwrap();
///
///   resp.set_code(code::CONTENT);
///   resp.set_payload(r#"{"foo": "bar"}"#.bytes());
///
///   resp
/// });
///
/// fn start_server(f: impl FnOnce(Req) -> Resp) {
///   // servery things
/// # f(Req::get(""));
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Resp(Message);

impl Resp {
  /// Obtain a reference to the inner message
  pub fn msg(&self) -> &Message {
    &self.0
  }

  /// Obtain a mutable reference to the inner message
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.0
  }

  /// Create a new response for a given request.
  ///
  /// If the request is CONfirmable, this will return Some(ACK).
  ///
  /// If the request is NONconfirmable, this will return Some(NON).
  ///
  /// If the request is an ACK or RESET, this will return None.
  ///
  /// ```
  /// use newt::req::Req;
  /// use newt::resp::Resp;
  /// use newt_msg::{Token, Type};
  ///
  /// // pretend this is an incoming request
  /// let mut req = Req::get("/hello");
  /// req.set_token(Token::from_bytes(&[1, 2]));
  ///
  /// let resp = Resp::for_request(&req).unwrap();
  ///
  /// // Req's default type is CON, so the response piggybacks on an ACK
  /// // carrying the request's id & token.
  /// assert_eq!(resp.msg_type(), Type::Ack);
  /// assert_eq!(resp.msg_id(), req.msg_id());
  /// assert_eq!(resp.token(), req.token());
  /// ```
  pub fn for_request(req: &Req) -> Option<Self> {
    match req.msg_type() {
      | Type::Con => Some(Self::ack(req)),
      | Type::Non => Some(Self::non(req)),
      | _ => None,
    }
  }

  /// Create a response piggybacked on the ACK of a CON request
  pub fn ack(req: &Req) -> Self {
    Self(Message::new(Type::Ack, code::CONTENT, req.msg_id(), req.token()))
  }

  /// Create a CONfirmable response for an incoming request.
  ///
  /// It is retransmitted until the client acknowledges it.
  /// When answering a CON request this way, the request should
  /// be [accepted](crate::endpoint::Endpoint::accept) first.
  pub fn con(req: &Req) -> Self {
    Self(Message::new(Type::Con, code::CONTENT, Id(0), req.token()))
  }

  /// Create a NONconfirmable response for an incoming request.
  pub fn non(req: &Req) -> Self {
    Self(Message::new(Type::Non, code::CONTENT, Id(0), req.token()))
  }

  /// Get the message type
  pub fn msg_type(&self) -> Type {
    self.0.ty
  }

  /// Get the message id
  pub fn msg_id(&self) -> Id {
    self.0.id
  }

  /// Get the message token
  pub fn token(&self) -> Token {
    self.0.token
  }

  /// Get the response code
  ///
  /// ```
  /// use newt::req::Req;
  /// use newt::resp::{code, Resp};
  ///
  /// let req = Req::get("/hello");
  /// let resp = Resp::for_request(&req).unwrap();
  ///
  /// assert_eq!(resp.code(), code::CONTENT);
  /// ```
  pub fn code(&self) -> Code {
    self.0.code
  }

  /// Change the response code
  pub fn set_code(&mut self, code: Code) {
    self.0.code = code;
  }

  /// The Observe sequence number, if this is a notification
  pub fn observe(&self) -> Option<u32> {
    self.0.observe()
  }

  /// Get the payload's raw bytes
  pub fn payload(&self) -> &[u8] {
    &self.0.payload.0
  }

  /// Get the payload and attempt to interpret it as a utf8 string
  pub fn payload_string(&self) -> Result<String, FromUtf8Error> {
    String::from_utf8(self.payload().to_vec())
  }

  /// Add a payload to this response
  ///
  /// ```
  /// use newt::req::Req;
  /// use newt::resp::Resp;
  ///
  /// let req = Req::get("/hello");
  /// let mut resp = Resp::for_request(&req).unwrap();
  ///
  /// // Maybe you have some bytes:
  /// resp.set_payload(vec![1, 2, 3]);
  ///
  /// // Or a string:
  /// resp.set_payload("hello!".bytes());
  /// ```
  pub fn set_payload<Bytes: IntoIterator<Item = u8>>(&mut self, payload: Bytes) {
    self.0.payload = Payload(payload.into_iter().collect());
  }
}

impl AsRef<Message> for Resp {
  fn as_ref(&self) -> &Message {
    &self.0
  }
}

impl AsMut<Message> for Resp {
  fn as_mut(&mut self) -> &mut Message {
    &mut self.0
  }
}

impl From<Resp> for Message {
  fn from(rep: Resp) -> Self {
    rep.0
  }
}

impl From<Message> for Resp {
  fn from(msg: Message) -> Self {
    Self(msg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn for_request() {
    let req = Req::get("a").non();
    let resp = Resp::for_request(&req).unwrap();
    assert_eq!(resp.msg_type(), Type::Non);
    assert_eq!(resp.code(), code::CONTENT);

    let mut ack = Message::new(Type::Ack, Code::EMPTY, Id(1), Token::default());
    ack.code = Code::GET;
    assert_eq!(Resp::for_request(&Req::from(ack)), None);
  }

  #[test]
  fn con() {
    let mut req = Req::get("a");
    req.set_token(Token::from_bytes(&[9]));
    let resp = Resp::con(&req);
    assert_eq!(resp.msg_type(), Type::Con);
    assert_eq!(resp.token(), req.token());
  }
}
