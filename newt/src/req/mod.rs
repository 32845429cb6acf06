use newt_msg::{known, Action, Id, Message, OptNumber, OptValue, Payload, Token, Type};

/// Request methods
pub mod method;

#[doc(inline)]
pub use method::Method;

/// A CoAP request
///
/// ```
/// use newt::req::Req;
/// use newt::resp::Resp;
///
/// let mut req = Req::post("hello");
/// req.set_payload("john".bytes());
///
/// let resp = send(&req);
/// assert_eq!(resp.payload_string().unwrap(), "Hello, john!".to_string());
///
/// # fn send(req: &Req) -> Resp {
/// #   let body = req.payload_str().unwrap().to_string();
/// #   let mut resp = Resp::for_request(req).unwrap();
/// #   resp.set_payload(format!("Hello, {}!", body).bytes());
/// #   resp
/// # }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Req(Message);

impl Req {
  /// Create a CONfirmable request
  pub fn new(method: Method, path: impl AsRef<str>) -> Self {
    let mut msg = Message::new(Type::Con, method.0, Id(0), Token::default());
    msg.set_path(path.as_ref());
    Self(msg)
  }

  /// Creates a new GET request
  ///
  /// ```
  /// use newt::req::{Method, Req};
  ///
  /// let req = Req::get("/hello");
  /// assert_eq!(req.method(), Method::GET);
  /// assert_eq!(req.path(), vec!["hello"]);
  /// ```
  pub fn get(path: impl AsRef<str>) -> Self {
    Self::new(Method::GET, path)
  }

  /// Creates a new POST request
  pub fn post(path: impl AsRef<str>) -> Self {
    Self::new(Method::POST, path)
  }

  /// Creates a new PUT request
  pub fn put(path: impl AsRef<str>) -> Self {
    Self::new(Method::PUT, path)
  }

  /// Creates a new DELETE request
  pub fn delete(path: impl AsRef<str>) -> Self {
    Self::new(Method::DELETE, path)
  }

  /// Make this request NONconfirmable; it will be sent once
  /// and never retransmitted.
  pub fn non(mut self) -> Self {
    self.0.ty = Type::Non;
    self
  }

  /// Obtain a reference to the inner message
  pub fn msg(&self) -> &Message {
    &self.0
  }

  /// Obtain a mutable reference to the inner message
  pub fn msg_mut(&mut self) -> &mut Message {
    &mut self.0
  }

  /// Get the request method
  pub fn method(&self) -> Method {
    Method(self.0.code)
  }

  /// Get the request type (CON or NON)
  pub fn msg_type(&self) -> Type {
    self.0.ty
  }

  /// Get the message id
  pub fn msg_id(&self) -> Id {
    self.0.id
  }

  /// Get the token of this request.
  ///
  /// Requests sent without a token are given a unique one
  /// before they go out.
  pub fn token(&self) -> Token {
    self.0.token
  }

  /// Use a specific token for this request
  pub fn set_token(&mut self, token: Token) {
    self.0.token = token;
  }

  /// Get the Uri-Path segments of this request
  pub fn path(&self) -> Vec<&str> {
    self.0.path()
  }

  /// Replace the Uri-Path of this request
  pub fn set_path(&mut self, path: impl AsRef<str>) {
    self.0.set_path(path.as_ref());
  }

  /// Add a Uri-Query value
  pub fn add_query(&mut self, query: impl AsRef<str>) {
    self.0
        .add(known::repeat::QUERY, OptValue(query.as_ref().as_bytes().to_vec()));
  }

  /// Set a custom option for this request
  ///
  /// ```
  /// use newt::req::Req;
  /// use newt_msg::{OptNumber, OptValue};
  ///
  /// let mut req = Req::get("/hello");
  /// req.set(OptNumber(17), OptValue(vec![50])); // Accept: application/json
  /// assert_eq!(req.get_opt(OptNumber(17)), Some(&OptValue(vec![50])));
  /// ```
  pub fn set(&mut self, number: OptNumber, value: OptValue) {
    self.0.set(number, value);
  }

  /// Read the first value of an option
  pub fn get_opt(&self, number: OptNumber) -> Option<&OptValue> {
    self.0.get_first(number)
  }

  /// Register (or deregister) interest in the resource
  ///
  /// ```
  /// use newt::req::Req;
  /// use newt_msg::Action;
  ///
  /// let mut req = Req::get("/temperature");
  /// req.observe(Action::Register);
  /// assert_eq!(req.observe_action(), Some(Action::Register));
  /// ```
  pub fn observe(&mut self, action: Action) {
    self.0.set_observe(action.into());
  }

  /// The Observe action of this request, if any
  pub fn observe_action(&self) -> Option<Action> {
    self.0.observe_action()
  }

  /// Add a payload to this request
  pub fn set_payload<Bytes: IntoIterator<Item = u8>>(&mut self, payload: Bytes) {
    self.0.payload = Payload(payload.into_iter().collect());
  }

  /// Get the payload's raw bytes
  pub fn payload(&self) -> &[u8] {
    &self.0.payload.0
  }

  /// Get the payload and attempt to interpret it as a utf8 string
  ///
  /// ```
  /// use newt::req::Req;
  ///
  /// let mut req = Req::post("/hello");
  /// req.set_payload("Hi!".bytes());
  ///
  /// assert_eq!(req.payload_str().unwrap(), "Hi!")
  /// ```
  pub fn payload_str(&self) -> Result<&str, core::str::Utf8Error> {
    core::str::from_utf8(self.payload())
  }
}

impl AsRef<Message> for Req {
  fn as_ref(&self) -> &Message {
    &self.0
  }
}

impl AsMut<Message> for Req {
  fn as_mut(&mut self) -> &mut Message {
    &mut self.0
  }
}

impl From<Req> for Message {
  fn from(req: Req) -> Self {
    req.0
  }
}

impl From<Message> for Req {
  fn from(msg: Message) -> Self {
    Self(msg)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn non() {
    let req = Req::put("a/b").non();
    assert_eq!(req.msg_type(), Type::Non);
    assert_eq!(req.method(), Method::PUT);
    assert_eq!(req.msg().uri_key(), "a/b");
  }

  #[test]
  fn query() {
    let mut req = Req::get("fw");
    req.add_query("v=1");
    req.add_query("arch=arm");
    assert_eq!(req.msg().uri_key(), "fw?v=1&arch=arm");
  }

  #[test]
  fn method_display() {
    assert_eq!(Method::DELETE.to_string(), "DELETE");
    assert_eq!(Req::from(Message::new(Type::Con,
                                      newt_msg::Code::new(0, 7),
                                      Id(0),
                                      Token::default())).method()
                                                        .to_string(),
               "0.07");
  }
}
