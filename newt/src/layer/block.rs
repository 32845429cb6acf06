use std::collections::{BTreeMap, HashMap};

use newt_msg::known::no_repeat::{SIZE1, SIZE2};
use newt_msg::known::{BLOCK1, BLOCK2, OBSERVE};
use newt_msg::{Block as BlockOpt, Code, CodeKind, Id, Message, Payload, Token, Type};

use super::{Action, Actions, Flow, Layer, Snapshot};
use crate::error::Error;
use crate::exchange::{Exchange, ExchangeId, Origin};
use crate::net::SocketAddr;
use crate::resp::code::{BAD_OPTION, CONTINUE, REQUEST_ENTITY_INCOMPLETE, REQUEST_ENTITY_TOO_LARGE};
use crate::time::{Clock, Stamped};

/// A resource on a peer
type ResourceKey = (SocketAddr, String);

/// The `num`th block of `body`, and whether more follow it
fn chunk(body: &[u8], size: u16, num: u32) -> (&[u8], bool) {
  let start = (num as usize * size as usize).min(body.len());
  let end = (start + size as usize).min(body.len());
  (&body[start..end], end < body.len())
}

/// Request body we are sending in pieces
#[derive(Debug)]
struct Upload {
  template: Message,
  body: Vec<u8>,
  size: u16,
  /// Last block sent
  num: u32,
}

impl Upload {
  fn block(&self) -> Message {
    let (bytes, more) = chunk(&self.body, self.size, self.num);
    let mut msg = self.template.clone();
    msg.payload = Payload(bytes.to_vec());
    msg.set_block1(self.size, self.num, more);
    if self.num == 0 {
      msg.set_u32(SIZE1, self.body.len() as u32);
    }
    msg
  }
}

/// Response body we are receiving in pieces
#[derive(Debug)]
struct Download {
  first: Message,
  body: Vec<u8>,
}

/// Response body we are serving in pieces
#[derive(Debug)]
struct Serving {
  template: Message,
  body: Vec<u8>,
}

impl Serving {
  fn block(&self, size: u16, num: u32) -> Message {
    let (bytes, more) = chunk(&self.body, size, num);
    let mut msg = self.template.clone();
    msg.payload = Payload(bytes.to_vec());
    msg.set_block2(size, num, more);
    msg.set_u32(SIZE2, self.body.len() as u32);
    msg
  }
}

/// Splits bodies larger than a block into pieces, and puts
/// pieces received from peers back together.
///
/// Client side:
/// - request bodies larger than `block.default_size` are uploaded
///   one Block1 block at a time, advancing on every 2.31 Continue
/// - responses carrying Block2 are reassembled by requesting
///   each following block, verifying offsets & ETags as they arrive
///
/// Server side:
/// - Block1 requests are reassembled per (peer, resource)
///   and answered with 2.31 until the last one arrives
/// - large responses are served one Block2 block at a time
#[derive(Debug)]
pub(crate) struct Block<C: Clock> {
  uploads: BTreeMap<ExchangeId, Upload>,
  downloads: BTreeMap<ExchangeId, Download>,
  receiving: HashMap<ResourceKey, Stamped<C, Vec<u8>>>,
  serving: HashMap<ResourceKey, Stamped<C, Serving>>,
  /// Block size a client asked for up front (Block2 num 0 in a request)
  preferred: BTreeMap<ExchangeId, u16>,
  /// Last Block1 of a reassembled request, echoed in the response
  received: BTreeMap<ExchangeId, BlockOpt>,
}

impl<C: Clock> Default for Block<C> {
  fn default() -> Self {
    Self { uploads: BTreeMap::new(),
           downloads: BTreeMap::new(),
           receiving: HashMap::new(),
           serving: HashMap::new(),
           preferred: BTreeMap::new(),
           received: BTreeMap::new() }
  }
}

fn fail(id: ExchangeId, e: Error, out: &mut Actions) -> Flow {
  log::debug!("{} blockwise transfer aborted: {}", id, e);
  out.push((id, Action::Fail(e)));
  Flow::Stop
}

/// A response to the request of a remote exchange.
///
/// ACK-typed; the reliability layer turns it into whatever fits.
fn reply<C: Clock>(ex: &Exchange<C>, code: Code) -> Message {
  let token = ex.current_request.as_ref().unwrap_or(&ex.request).token;
  Message::new(Type::Ack, code, Id(0), token)
}

fn respond<C: Clock>(ex: &Exchange<C>, msg: Message, out: &mut Actions) -> Flow {
  out.push((ex.id, Action::Send(msg)));
  Flow::Stop
}

impl<C: Clock> Block<C> {
  fn start_upload(&mut self, snap: &Snapshot<'_, C>, ex: &Exchange<C>, mut msg: Message) -> Flow {
    let body = core::mem::take(&mut msg.payload.0);
    let upload = Upload { template: msg,
                          body,
                          size: snap.config.block.default_size,
                          num: 0 };

    log::debug!("{} uploading {} bytes in blocks of {}",
                ex.id,
                upload.body.len(),
                upload.size);

    let first = upload.block();
    self.uploads.insert(ex.id, upload);
    Flow::Forward(first)
  }

  fn continue_upload(&mut self, ex: &Exchange<C>, msg: Message, out: &mut Actions) -> Flow {
    let up = match self.uploads.get_mut(&ex.id) {
      | Some(up) => up,
      | None => return Flow::Forward(msg),
    };

    let sent = (up.num as usize + 1) * up.size as usize;
    if sent >= up.body.len() {
      log::warn!("{} peer asked for more after the last block", ex.id);
      self.uploads.remove(&ex.id);
      return Flow::Forward(msg);
    }

    let size = msg.block1()
                  .filter(BlockOpt::is_valid)
                  .map(|b| b.size().min(up.size))
                  .unwrap_or(up.size);

    up.size = size;
    up.num = (sent / size as usize) as u32;
    log::trace!("{} sending block {} ({} bytes)", ex.id, up.num, size);

    out.push((ex.id, Action::Send(up.block())));
    Flow::Stop
  }

  fn download(&mut self,
              snap: &Snapshot<'_, C>,
              ex: &Exchange<C>,
              msg: Message,
              block: BlockOpt,
              out: &mut Actions)
              -> Flow {
    let max = snap.config.block.max_body_size;

    if !self.downloads.contains_key(&ex.id) {
      if block.num() == 0 && !block.more() {
        return Flow::Forward(msg);
      }

      if block.num() != 0 {
        return fail(ex.id,
                    Error::BlockOutOfOrder { expected: 0,
                                             got: block.num() },
                    out);
      }

      if let Some(size) = msg.size2().map(|n| n as usize).filter(|n| *n > max) {
        return fail(ex.id, Error::BodyTooLarge { size, max }, out);
      }

      self.downloads.insert(ex.id,
                            Download { first: msg.clone(),
                                       body: Vec::new() });
    }

    let dl = match self.downloads.get_mut(&ex.id) {
      | Some(dl) => dl,
      | None => return Flow::Forward(msg),
    };

    if block.offset() != dl.body.len() {
      let expected = (dl.body.len() / block.size() as usize) as u32;
      self.downloads.remove(&ex.id);
      return fail(ex.id,
                  Error::BlockOutOfOrder { expected,
                                           got: block.num() },
                  out);
    }

    if msg.etag() != dl.first.etag() {
      self.downloads.remove(&ex.id);
      return fail(ex.id, Error::TransferConflict, out);
    }

    dl.body.extend_from_slice(&msg.payload.0);
    if dl.body.len() > max {
      let size = dl.body.len();
      self.downloads.remove(&ex.id);
      return fail(ex.id, Error::BodyTooLarge { size, max }, out);
    }

    if block.more() {
      let size = block.size().min(snap.config.block.max_size);
      let num = (dl.body.len() / size as usize) as u32;

      let mut next = ex.request.clone();
      next.payload = Payload::default();
      [BLOCK1, SIZE1, OBSERVE].into_iter().for_each(|n| {
                                            next.remove(n);
                                          });
      next.set_block2(size, num, false);

      log::trace!("{} requesting block {} ({} bytes so far)",
                  ex.id,
                  num,
                  dl.body.len());
      out.push((ex.id, Action::Send(next)));
      return Flow::Stop;
    }

    match self.downloads.remove(&ex.id) {
      | Some(Download { mut first, body }) => {
        log::debug!("{} reassembled {} byte body", ex.id, body.len());
        first.payload = Payload(body);
        first.remove(BLOCK2);
        first.remove(SIZE2);
        Flow::Forward(first)
      },
      | None => Flow::Forward(msg),
    }
  }

  fn client_inbound(&mut self,
                    snap: &Snapshot<'_, C>,
                    ex: &Exchange<C>,
                    msg: Message,
                    out: &mut Actions)
                    -> Flow {
    if self.uploads.contains_key(&ex.id) {
      if msg.code == CONTINUE {
        return self.continue_upload(ex, msg, out);
      }

      self.uploads.remove(&ex.id);
    }

    match msg.block2() {
      | Some(b) if b.is_valid() => self.download(snap, ex, msg, b, out),
      | _ => Flow::Forward(msg),
    }
  }

  fn serve_next(&mut self, ex: &Exchange<C>, msg: Message, block: BlockOpt, out: &mut Actions) -> Flow {
    if !block.is_valid() {
      return respond(ex, reply(ex, BAD_OPTION), out);
    }

    let serving = match self.serving.get(&(ex.peer, msg.uri_key())) {
      | Some(s) => s.data(),
      | None => return Flow::Forward(msg),
    };

    if block.offset() >= serving.body.len() {
      return respond(ex, reply(ex, BAD_OPTION), out);
    }

    let mut resp = serving.block(block.size(), block.num());
    resp.ty = Type::Ack;
    resp.token = msg.token;
    resp.remove(OBSERVE);

    log::trace!("{} serving block {}", ex.id, block.num());
    respond(ex, resp, out)
  }

  fn receive(&mut self,
             snap: &Snapshot<'_, C>,
             ex: &Exchange<C>,
             mut msg: Message,
             block: BlockOpt,
             out: &mut Actions)
             -> Flow {
    let max = snap.config.block.max_body_size;
    let too_large = |ex: &Exchange<C>, out: &mut Actions| {
      let mut resp = reply(ex, REQUEST_ENTITY_TOO_LARGE);
      resp.set_u32(SIZE1, max as u32);
      respond(ex, resp, out)
    };

    if !block.is_valid() {
      return respond(ex, reply(ex, BAD_OPTION), out);
    }

    let key = (ex.peer, msg.uri_key());

    if block.num() == 0 {
      if msg.size1().map(|n| n as usize > max).unwrap_or(false) {
        return too_large(ex, out);
      }

      self.receiving.insert(key.clone(), Stamped::new(Vec::new(), snap.time));
    }

    let mut body = match self.receiving.remove(&key) {
      | Some(s) if s.data().len() == block.offset() => s.discard_timestamp(),
      | _ => {
        log::debug!("{} block {} of {:?} arrived out of order",
                    ex.id,
                    block.num(),
                    key.1);
        return respond(ex, reply(ex, REQUEST_ENTITY_INCOMPLETE), out);
      },
    };

    body.extend_from_slice(&msg.payload.0);
    if body.len() > max {
      return too_large(ex, out);
    }

    if block.more() {
      self.receiving.insert(key, Stamped::new(body, snap.time));

      let mut resp = reply(ex, CONTINUE);
      resp.set_block1(block.size().min(snap.config.block.max_size),
                      block.num(),
                      true);
      return respond(ex, resp, out);
    }

    log::debug!("{} reassembled {} byte request body", ex.id, body.len());
    self.received.insert(ex.id, block);
    msg.payload = Payload(body);
    msg.remove(BLOCK1);
    msg.remove(SIZE1);
    Flow::Forward(msg)
  }

  fn server_inbound(&mut self,
                    snap: &Snapshot<'_, C>,
                    ex: &Exchange<C>,
                    msg: Message,
                    out: &mut Actions)
                    -> Flow {
    match msg.block2() {
      | Some(b) if b.num() > 0 => return self.serve_next(ex, msg, b, out),
      | Some(b) if b.is_valid() => {
        self.preferred.insert(ex.id, b.size());
      },
      | _ => (),
    }

    match msg.block1() {
      | Some(b) => self.receive(snap, ex, msg, b, out),
      | None => Flow::Forward(msg),
    }
  }

  fn serve(&mut self, snap: &Snapshot<'_, C>, ex: &Exchange<C>, mut msg: Message) -> Flow {
    let default = snap.config.block.default_size;
    let size = self.preferred
                   .get(&ex.id)
                   .map(|p| (*p).min(default))
                   .unwrap_or(default);

    if let Some(b) = self.received.remove(&ex.id) {
      msg.set_block1(b.size(), b.num(), false);
    }

    if msg.payload.0.len() <= size as usize || msg.block2().is_some() {
      return Flow::Forward(msg);
    }

    let etag = msg.etag()
                  .map(|t| t.to_vec())
                  .unwrap_or_else(|| Token::opaque(&msg.payload.0).0.to_vec());
    msg.set_etag(etag);

    let body = core::mem::take(&mut msg.payload.0);
    let serving = Serving { template: msg,
                            body };
    let first = serving.block(size, 0);

    log::debug!("{} serving {} byte body in blocks of {}",
                ex.id,
                serving.body.len(),
                size);
    self.serving
        .insert((ex.peer, ex.request.uri_key()), Stamped::new(serving, snap.time));

    Flow::Forward(first)
  }
}

impl<C: Clock> Layer<C> for Block<C> {
  fn outbound(&mut self,
              snap: &Snapshot<'_, C>,
              ex: &mut Exchange<C>,
              msg: Message,
              _: &mut Actions)
              -> Flow {
    match (ex.origin, msg.code.kind()) {
      | (Origin::Local, CodeKind::Request)
        if msg.payload.0.len() > snap.config.block.default_size as usize
           && msg.block1().is_none() =>
      {
        self.start_upload(snap, ex, msg)
      },
      | (Origin::Remote, CodeKind::Response) => self.serve(snap, ex, msg),
      | _ => Flow::Forward(msg),
    }
  }

  fn inbound(&mut self,
             snap: &Snapshot<'_, C>,
             ex: &mut Exchange<C>,
             msg: Message,
             out: &mut Actions)
             -> Flow {
    match (ex.origin, msg.code.kind()) {
      | (Origin::Local, CodeKind::Response) => self.client_inbound(snap, ex, msg, out),
      | (Origin::Remote, CodeKind::Request) => self.server_inbound(snap, ex, msg, out),
      | _ => Flow::Forward(msg),
    }
  }

  fn tick(&mut self, snap: &Snapshot<'_, C>, _: &mut Actions) {
    let lifetime = snap.config.exchange_lifetime_millis();
    let now = snap.time;

    self.receiving
        .retain(|(_, uri), s| match s.older_than(now, lifetime) {
          | true => {
            log::debug!("abandoning incomplete upload of {:?}", uri);
            false
          },
          | false => true,
        });
    self.serving.retain(|_, s| !s.older_than(now, lifetime));
  }

  fn forget(&mut self, id: ExchangeId) {
    self.uploads.remove(&id);
    self.downloads.remove(&id);
    self.preferred.remove(&id);
    self.received.remove(&id);
  }
}
