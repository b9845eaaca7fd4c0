//! # Messages
//!
//! A `Message` is a typed payload plus the handles and descriptors travelling
//! with it. It is built with the write half of the b1pack codec, sealed, and
//! sent; received messages arrive sealed and are read with the decoder half.
//!
//! ## Lifecycle
//!
//! - **Writing**: `begin_*`/`end_*`, `write`, `append_handle`, `append_fd`.
//!   The payload must follow the message's signature exactly.
//! - **Sealed**: `seal` checks every declared type was written and every
//!   container closed. From then on the payload and attachments are frozen
//!   and only the read half works. `send` seals implicitly.
//!
//! A received payload that fails validation still yields a `Message`, so
//! dispatch can answer its sender. Reading it reports the validation error.
//!
//! Appending a handle takes a reference owned by the message. Sending hands
//! a copy of the capability to each receiver; the message's own reference
//! is released when it drops.

use std::fmt;
use std::os::fd::AsFd;
use std::os::fd::BorrowedFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use b1pack::Decoder;
use b1pack::Encoder;
use b1pack::Error as PackError;
use b1pack::Signature;
use b1pack::Type;
use b1pack::Value;
use b1wire::Frame;
use b1wire::MessageType;
use b1wire::Meta;
use tracing::debug;
use tracing::trace;

use crate::channel::ChannelError;
use crate::channel::Credentials;
use crate::channel::Delivery;
use crate::error::Error;
use crate::error::Result;
use crate::handle::Handle;
use crate::node::Node;
use crate::node::NodeState;
use crate::peer::Peer;
use crate::peer::PeerInner;
use crate::reply::CallError;
use crate::reply::Outcome;
use crate::reply::Pending;
use crate::reply::ReplySlot;

enum Body {
    Writing(Encoder),
    Sealed(Decoder),
    /// Received bytes that do not match their signature.
    Malformed { signature: Signature, error: PackError },
}

impl Body {
    fn signature(&self) -> &Signature {
        match self {
            Body::Writing(enc) => enc.signature(),
            Body::Sealed(dec) => dec.signature(),
            Body::Malformed { signature, .. } => signature,
        }
    }
}

pub struct Message {
    peer: Weak<PeerInner>,
    kind: MessageType,
    call_id: u64,
    meta: Option<Meta>,
    body: Body,
    handles: Vec<Handle>,
    fds: Vec<OwnedFd>,
    destination: Option<u64>,
    credentials: Option<Credentials>,
    pub(crate) expected_reply: Option<Signature>,
    pub(crate) responded: bool,
    seed_nodes: Vec<Node>,
}

impl Message {
    fn blank(peer: &Peer, meta: Meta, call_id: u64, signature: Signature) -> Message {
        Message {
            peer: Arc::downgrade(&peer.inner),
            kind: meta.kind(),
            call_id,
            meta: Some(meta),
            body: Body::Writing(Encoder::new(signature)),
            handles: Vec::new(),
            fds: Vec::new(),
            destination: None,
            credentials: None,
            expected_reply: None,
            responded: false,
            seed_nodes: Vec::new(),
        }
    }

    /// A one-way CALL of `interface.member` with payload signature `input`.
    pub fn new_call(peer: &Peer, interface: &str, member: &str, input: &str) -> Result<Message> {
        peer.check_open()?;
        if interface.is_empty() || member.is_empty() {
            return Err(Error::InvalidArgument("interface and member names must be non-empty".into()));
        }
        let signature = Signature::parse(input)?;
        let meta = Meta::Call { interface: interface.to_string(), member: member.to_string(), reply_handle: None };
        Ok(Message::blank(peer, meta, peer.inner.next_call_id(), signature))
    }

    /// A CALL expecting an answer of signature `output`.
    ///
    /// A fresh reply node is created and its handle attached at index 0. The
    /// call is pending as soon as this returns; `callback` runs exactly once
    /// when it completes.
    pub fn new_call_with_reply<F>(
        peer: &Peer,
        interface: &str,
        member: &str,
        input: &str,
        output: &str,
        callback: F,
    ) -> Result<(Message, ReplySlot)>
    where
        F: FnOnce(Outcome<'_>) + Send + 'static,
    {
        let expected = Signature::parse(output)?;
        let mut message = Message::new_call(peer, interface, member, input)?;
        let reply_node = Node::new(peer, None)?;

        message.handles.push(reply_node.handle());
        if let Some(Meta::Call { reply_handle, .. }) = &mut message.meta {
            *reply_handle = Some(0);
        }

        let pending = Pending { expected, reply_node, destination: None, callback: Mutex::new(Some(Box::new(callback))) };
        peer.inner.pending.insert(message.call_id, pending);
        let slot = ReplySlot { peer: Arc::downgrade(&peer.inner), call_id: message.call_id };
        Ok((message, slot))
    }

    /// A REPLY with payload signature `signature`. Send it with `Message::reply`.
    pub fn new_reply(peer: &Peer, signature: &str) -> Result<Message> {
        peer.check_open()?;
        Ok(Message::blank(peer, Meta::Reply, 0, Signature::parse(signature)?))
    }

    /// An ERROR named `name`, such as `org.example.Error.NotFound`.
    pub fn new_error(peer: &Peer, name: &str, signature: &str) -> Result<Message> {
        peer.check_open()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("error name is empty".into()));
        }
        Ok(Message::blank(peer, Meta::Error { name: name.to_string() }, 0, Signature::parse(signature)?))
    }

    /// A SEED naming `roots`, nodes owned by `peer`.
    ///
    /// Sending the seed stores it on the connection and transfers the nodes to
    /// whoever calls `Peer::recv_seed` there.
    pub fn new_seed(peer: &Peer, roots: &[(&str, &Node)], signature: &str) -> Result<Message> {
        peer.check_open()?;
        let signature = Signature::parse(signature)?;
        let mut names: Vec<(String, u32)> = Vec::with_capacity(roots.len());
        let mut nodes = Vec::with_capacity(roots.len());
        for (index, (name, node)) in roots.iter().enumerate() {
            if name.is_empty() {
                return Err(Error::InvalidArgument("root name is empty".into()));
            }
            if names.iter().any(|(n, _)| n == name) {
                return Err(Error::DuplicateName(name.to_string()));
            }
            if !node.handle().belongs_to(&peer.inner) {
                return Err(Error::ForeignObject);
            }
            let state = node.state();
            if state != NodeState::Active {
                return Err(Error::NodeUnavailable(state));
            }
            names.push((name.to_string(), index as u32));
            nodes.push((*node).clone());
        }

        let mut message = Message::blank(peer, Meta::Seed { roots: names }, 0, signature);
        message.handles = nodes.iter().map(Node::handle).collect();
        message.seed_nodes = nodes;
        Ok(message)
    }

    fn notice(inner: &Arc<PeerInner>, kind: MessageType, handle: u64) -> Result<Message> {
        Ok(Message {
            peer: Arc::downgrade(inner),
            kind,
            call_id: 0,
            meta: None,
            body: Body::Sealed(Decoder::new(Signature::empty(), Vec::new())?),
            handles: Vec::new(),
            fds: Vec::new(),
            destination: Some(handle),
            credentials: None,
            expected_reply: None,
            responded: false,
            seed_nodes: Vec::new(),
        })
    }

    /// Builds a received message, taking over the references the delivery added.
    pub(crate) fn from_delivery(inner: &Arc<PeerInner>, delivery: Delivery) -> Result<Message> {
        let (destination, bytes, fds, credentials) = match delivery {
            Delivery::Data { destination, frame, fds, credentials } => (destination, frame, fds, credentials),
            Delivery::NodeDestroy { handle } => return Message::notice(inner, MessageType::NodeDestroy, handle),
            Delivery::NodeRelease { handle } => return Message::notice(inner, MessageType::NodeRelease, handle),
        };

        // Wrapped first so a malformed payload still releases them.
        let ids = b1wire::handle_table(&bytes)?;
        let handles: Vec<Handle> = ids.iter().map(|&id| inner.acquire_handle(id)).collect();

        let frame = Frame::decode(&bytes)?;
        if frame.kind() == MessageType::Seed {
            return Err(ChannelError::Malformed("seed delivered to a node".into()).into());
        }
        if frame.n_fds as usize != fds.len() {
            return Err(ChannelError::Malformed(format!("{} descriptors framed, {} attached", frame.n_fds, fds.len())).into());
        }
        let body = match Decoder::new(frame.signature.clone(), frame.body) {
            Ok(dec) => Body::Sealed(dec),
            Err(error) => {
                debug!(peer = %inner.name, call_id = frame.call_id, kind = ?frame.meta.kind(), %error, "malformed payload");
                Body::Malformed { signature: frame.signature, error }
            }
        };
        Ok(Message {
            peer: Arc::downgrade(inner),
            kind: frame.meta.kind(),
            call_id: frame.call_id,
            meta: Some(frame.meta),
            body,
            handles,
            fds,
            destination: Some(destination),
            credentials: Some(credentials),
            expected_reply: None,
            responded: false,
            seed_nodes: Vec::new(),
        })
    }

    /// Builds a received seed. Its roots are node ids of the receiving
    /// connection, so no handles are attached; the names and ids are returned.
    pub(crate) fn from_seed(inner: &Arc<PeerInner>, delivery: Delivery) -> Result<(Message, Vec<(String, u64)>)> {
        let Delivery::Data { frame: bytes, fds, credentials, .. } = delivery else {
            return Err(ChannelError::Malformed("seed is not a data delivery".into()).into());
        };
        let frame = Frame::decode(&bytes)?;
        let Meta::Seed { roots } = &frame.meta else {
            return Err(Error::WrongMessageType { expected: MessageType::Seed, found: frame.kind() });
        };
        let mut named = Vec::with_capacity(roots.len());
        for (name, index) in roots {
            let id = frame
                .handles
                .get(*index as usize)
                .ok_or(Error::IndexOutOfRange { index: *index as usize, len: frame.handles.len() })?;
            named.push((name.clone(), *id));
        }
        let message = Message {
            peer: Arc::downgrade(inner),
            kind: MessageType::Seed,
            call_id: frame.call_id,
            body: Body::Sealed(Decoder::new(frame.signature, frame.body)?),
            meta: Some(frame.meta),
            handles: Vec::new(),
            fds,
            destination: None,
            credentials: Some(credentials),
            expected_reply: None,
            responded: false,
            seed_nodes: Vec::new(),
        };
        Ok((message, named))
    }

    // ------------------------------------------------------------------------
    //  Accessors
    // ------------------------------------------------------------------------

    pub fn kind(&self) -> MessageType { self.kind }
    pub fn call_id(&self) -> u64 { self.call_id }
    pub fn signature(&self) -> &Signature { self.body.signature() }
    pub fn is_sealed(&self) -> bool { !matches!(self.body, Body::Writing(_)) }

    /// Why a received payload failed validation, if it did.
    pub fn payload_error(&self) -> Option<&PackError> {
        match &self.body {
            Body::Malformed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Sender credentials, on received messages.
    pub fn credentials(&self) -> Option<Credentials> { self.credentials }

    /// Handle id the message was delivered to, on received messages.
    pub fn destination(&self) -> Option<u64> { self.destination }

    /// Output signature of the member servicing this CALL, during dispatch.
    pub fn expected_reply(&self) -> Option<&Signature> { self.expected_reply.as_ref() }

    pub fn peer(&self) -> Option<Peer> {
        self.peer.upgrade().map(Peer::from_inner)
    }

    pub fn interface(&self) -> Option<&str> {
        match &self.meta {
            Some(Meta::Call { interface, .. }) => Some(interface),
            _ => None,
        }
    }

    pub fn member(&self) -> Option<&str> {
        match &self.meta {
            Some(Meta::Call { member, .. }) => Some(member),
            _ => None,
        }
    }

    pub fn error_name(&self) -> Option<&str> {
        match &self.meta {
            Some(Meta::Error { name }) => Some(name),
            _ => None,
        }
    }

    /// The handle a CALL's answer goes to, if it expects one.
    pub fn reply_handle(&self) -> Option<&Handle> {
        match &self.meta {
            Some(Meta::Call { reply_handle: Some(index), .. }) => self.handles.get(*index as usize),
            _ => None,
        }
    }

    pub fn handles(&self) -> &[Handle] { &self.handles }

    pub fn handle(&self, index: usize) -> Result<&Handle> {
        self.handles.get(index).ok_or(Error::IndexOutOfRange { index, len: self.handles.len() })
    }

    pub fn n_fds(&self) -> usize { self.fds.len() }

    pub fn fd(&self, index: usize) -> Result<BorrowedFd<'_>> {
        self.fds.get(index).map(|fd| fd.as_fd()).ok_or(Error::IndexOutOfRange { index, len: self.fds.len() })
    }

    // ------------------------------------------------------------------------
    //  Writing
    // ------------------------------------------------------------------------

    /// The encoder, for scalar writes. Fails once sealed.
    pub fn encoder(&mut self) -> Result<&mut Encoder> {
        match &mut self.body {
            Body::Writing(enc) => Ok(enc),
            Body::Sealed(_) | Body::Malformed { .. } => Err(Error::Sealed),
        }
    }

    pub fn begin_array(&mut self) -> Result<()> { Ok(self.encoder()?.begin_array()?) }
    pub fn begin_tuple(&mut self) -> Result<()> { Ok(self.encoder()?.begin_tuple()?) }
    pub fn begin_maybe(&mut self) -> Result<()> { Ok(self.encoder()?.begin_maybe()?) }
    pub fn begin_variant(&mut self, inner: &Type) -> Result<()> { Ok(self.encoder()?.begin_variant(inner)?) }
    pub fn end_array(&mut self) -> Result<()> { Ok(self.encoder()?.end_array()?) }
    pub fn end_tuple(&mut self) -> Result<()> { Ok(self.encoder()?.end_tuple()?) }
    pub fn end_maybe(&mut self) -> Result<()> { Ok(self.encoder()?.end_maybe()?) }
    pub fn end_variant(&mut self) -> Result<()> { Ok(self.encoder()?.end_variant()?) }

    /// Writes `values` against `signature`, all or nothing.
    pub fn write(&mut self, signature: &str, values: &[Value]) -> Result<()> {
        Ok(self.encoder()?.write(signature, values)?)
    }

    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        Ok(self.encoder()?.write_value(value)?)
    }

    /// Appends pre-encoded bytes of one complete type.
    pub fn insert(&mut self, signature: &str, bytes: &[u8]) -> Result<()> {
        let ty = Type::parse(signature)?;
        Ok(self.encoder()?.insert(&ty, bytes)?)
    }

    /// Attaches `handle` and returns its index. Attaching the same handle
    /// twice returns the first index.
    pub fn append_handle(&mut self, handle: &Handle) -> Result<u32> {
        if self.is_sealed() {
            return Err(Error::Sealed);
        }
        if !Weak::ptr_eq(&handle.shared.peer, &self.peer) {
            return Err(Error::ForeignObject);
        }
        let index = match self.handles.iter().position(|h| h == handle) {
            Some(index) => index,
            None => {
                self.handles.push(handle.clone());
                self.handles.len() - 1
            }
        };
        u32::try_from(index).map_err(|_| Error::IndexOutOfRange { index, len: u32::MAX as usize })
    }

    /// Attaches `handle` and writes its index as the next `h` value.
    pub fn write_handle(&mut self, handle: &Handle) -> Result<()> {
        let index = self.append_handle(handle)?;
        Ok(self.encoder()?.handle(index)?)
    }

    /// Attaches a duplicate of `fd` and returns its index.
    pub fn append_fd(&mut self, fd: BorrowedFd<'_>) -> Result<u32> {
        if self.is_sealed() {
            return Err(Error::Sealed);
        }
        let owned = fd.try_clone_to_owned().map_err(|e| Error::Io(e.to_string()))?;
        self.fds.push(owned);
        let index = self.fds.len() - 1;
        u32::try_from(index).map_err(|_| Error::IndexOutOfRange { index, len: u32::MAX as usize })
    }

    /// Freezes the payload. Idempotent.
    ///
    /// # Errors
    /// Fails if a container is still open or a declared type is unwritten;
    /// the message then stays writable.
    pub fn seal(&mut self) -> Result<()> {
        let Body::Writing(enc) = &self.body else { return Ok(()) };
        enc.check_complete()?;
        let placeholder = Body::Writing(Encoder::new(Signature::empty()));
        let Body::Writing(enc) = std::mem::replace(&mut self.body, placeholder) else { return Ok(()) };
        let signature = enc.signature().clone();
        let bytes = enc.finish()?;
        self.body = Body::Sealed(Decoder::new(signature, bytes)?);
        Ok(())
    }

    // ------------------------------------------------------------------------
    //  Reading
    // ------------------------------------------------------------------------

    /// The decoder, for scalar reads. Requires a sealed, well-formed message.
    pub fn decoder(&mut self) -> Result<&mut Decoder> {
        match &mut self.body {
            Body::Sealed(dec) => Ok(dec),
            Body::Writing(_) => Err(Error::NotSealed),
            Body::Malformed { error, .. } => Err(Error::Pack(error.clone())),
        }
    }

    pub fn enter_array(&mut self) -> Result<u32> { Ok(self.decoder()?.enter_array()?) }
    pub fn enter_tuple(&mut self) -> Result<u32> { Ok(self.decoder()?.enter_tuple()?) }
    pub fn enter_maybe(&mut self) -> Result<bool> { Ok(self.decoder()?.enter_maybe()?) }
    pub fn enter_variant(&mut self) -> Result<Type> { Ok(self.decoder()?.enter_variant()?) }
    pub fn exit_array(&mut self) -> Result<()> { Ok(self.decoder()?.exit_array()?) }
    pub fn exit_tuple(&mut self) -> Result<()> { Ok(self.decoder()?.exit_tuple()?) }
    pub fn exit_maybe(&mut self) -> Result<()> { Ok(self.decoder()?.exit_maybe()?) }
    pub fn exit_variant(&mut self) -> Result<()> { Ok(self.decoder()?.exit_variant()?) }

    /// Reads values matching `signature`, all or nothing.
    pub fn read(&mut self, signature: &str) -> Result<Vec<Value>> {
        Ok(self.decoder()?.read(signature)?)
    }

    pub fn read_value(&mut self) -> Result<Value> {
        Ok(self.decoder()?.read_value()?)
    }

    /// Reads the next `h` value and resolves it to the attached handle.
    pub fn read_handle(&mut self) -> Result<Handle> {
        let index = self.decoder()?.handle()? as usize;
        self.handle(index).cloned()
    }

    pub fn skip(&mut self) -> Result<()> {
        Ok(self.decoder()?.skip()?)
    }

    /// Element count of the array about to be entered.
    pub fn peek_count(&mut self) -> Result<u32> {
        Ok(self.decoder()?.peek_count()?)
    }

    /// The next type to write or read.
    pub fn peek_type(&self) -> Option<Type> {
        match &self.body {
            Body::Writing(enc) => enc.peek_type().cloned(),
            Body::Sealed(dec) => dec.peek_type().cloned(),
            Body::Malformed { .. } => None,
        }
    }

    /// Moves the read cursor back to the start of the payload.
    pub fn rewind(&mut self) -> Result<()> {
        self.decoder()?.rewind();
        Ok(())
    }

    // ------------------------------------------------------------------------
    //  Sending
    // ------------------------------------------------------------------------

    fn encode(&self) -> Result<Vec<u8>> {
        let dec = match &self.body {
            Body::Sealed(dec) => dec,
            Body::Writing(_) => return Err(Error::NotSealed),
            Body::Malformed { error, .. } => return Err(Error::Pack(error.clone())),
        };
        let meta = self.meta.clone().ok_or(Error::NotTransmittable(self.kind))?;
        let n_fds = u32::try_from(self.fds.len()).map_err(|_| Error::InvalidArgument("too many descriptors".into()))?;
        let frame = Frame {
            call_id: self.call_id,
            meta,
            signature: dec.signature().clone(),
            body: dec.as_bytes().to_vec(),
            handles: self.handles.iter().map(Handle::id).collect(),
            n_fds,
        };
        Ok(frame.encode()?)
    }

    /// Seals the message and delivers it to every destination.
    ///
    /// A SEED takes no destinations; it is stored on the sending connection.
    /// REPLY and ERROR messages are refused here; they go out through
    /// `Message::reply` or `ReplyTarget::send`, which address them.
    ///
    /// # Errors
    /// Nothing is delivered if any check fails. For a CALL with a reply slot
    /// the slot stays pending on failure; cancel it to complete it.
    pub fn send(&mut self, destinations: &[&Handle]) -> Result<()> {
        if matches!(self.kind, MessageType::Reply | MessageType::Error) {
            return Err(Error::WrongMessageType { expected: MessageType::Call, found: self.kind });
        }
        self.deliver(destinations)
    }

    fn deliver(&mut self, destinations: &[&Handle]) -> Result<()> {
        let inner = self.peer.upgrade().ok_or(Error::ConnectionClosed)?;
        if inner.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if !self.kind.is_framed() {
            return Err(Error::NotTransmittable(self.kind));
        }
        self.seal()?;

        if self.kind == MessageType::Seed {
            if !destinations.is_empty() {
                return Err(Error::InvalidArgument("a seed has no destinations".into()));
            }
            let frame = self.encode()?;
            inner.channel.send_seed(&frame, &self.fds)?;
            for node in self.seed_nodes.drain(..) {
                node.shared.transfer(&inner);
            }
            return Ok(());
        }

        if destinations.is_empty() {
            return Err(Error::InvalidArgument("no destinations".into()));
        }
        let mut ids = Vec::with_capacity(destinations.len());
        for handle in destinations {
            if !handle.belongs_to(&inner) {
                return Err(Error::ForeignObject);
            }
            if ids.contains(&handle.id()) {
                return Err(Error::DuplicateDestination(handle.id()));
            }
            ids.push(handle.id());
        }

        let frame = self.encode()?;
        inner.channel.send(&ids, &frame, &self.fds)?;
        trace!(peer = %inner.name, kind = ?self.kind, call_id = self.call_id, destinations = ids.len(), "sent");

        if self.kind == MessageType::Call {
            if let [destination] = destinations {
                self.track(&inner, destination);
            }
        }
        Ok(())
    }

    /// Records where a pending call went, failing it at once if that node is
    /// already known to be gone.
    fn track(&self, inner: &PeerInner, destination: &Handle) {
        let Some(mut pending) = inner.pending.get_mut(&self.call_id) else { return };
        pending.destination = Some(destination.id());
        drop(pending);
        if destination.is_stale() {
            if let Some((_, pending)) = inner.pending.remove(&self.call_id) {
                pending.resolve(inner, Outcome::Failed(CallError::Unreachable));
            }
        }
    }

    fn answer_target(&self) -> Result<ReplyTarget> {
        if self.kind != MessageType::Call {
            return Err(Error::WrongMessageType { expected: MessageType::Call, found: self.kind });
        }
        if self.responded {
            return Err(Error::AlreadyReplied);
        }
        let handle = self.reply_handle().cloned().ok_or(Error::NoReplyExpected)?;
        Ok(ReplyTarget { handle, call_id: self.call_id, expected: self.expected_reply.clone() })
    }

    /// Answers this CALL with `reply`, a REPLY or ERROR message.
    ///
    /// A REPLY must match the member's output signature.
    pub fn reply(&mut self, reply: &mut Message) -> Result<()> {
        self.answer_target()?.send(reply)?;
        self.responded = true;
        Ok(())
    }

    /// Detaches the answer address so the CALL can be answered after its
    /// handler returns. The call counts as answered from here on.
    pub fn reply_target(&mut self) -> Result<ReplyTarget> {
        let target = self.answer_target()?;
        self.responded = true;
        Ok(target)
    }

    /// Runs the peer's dispatch for this received message.
    pub fn dispatch(&mut self) -> Result<()> {
        let inner = self.peer.upgrade().ok_or(Error::ConnectionClosed)?;
        inner.dispatch(self)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("call_id", &self.call_id)
            .field("meta", &self.meta)
            .field("signature", &self.signature().as_str())
            .field("sealed", &self.is_sealed())
            .field("handles", &self.handles)
            .field("fds", &self.fds.len())
            .field("destination", &self.destination)
            .finish()
    }
}

/// Where and how to answer a CALL, detached from the CALL itself.
#[derive(Debug, Clone)]
pub struct ReplyTarget {
    handle: Handle,
    call_id: u64,
    expected: Option<Signature>,
}

impl ReplyTarget {
    pub fn handle(&self) -> &Handle { &self.handle }
    pub fn call_id(&self) -> u64 { self.call_id }
    pub fn expected(&self) -> Option<&Signature> { self.expected.as_ref() }

    /// Sends `reply` as the answer.
    pub fn send(self, reply: &mut Message) -> Result<()> {
        if !matches!(reply.kind, MessageType::Reply | MessageType::Error) {
            return Err(Error::WrongMessageType { expected: MessageType::Reply, found: reply.kind });
        }
        reply.seal()?;
        if reply.kind == MessageType::Reply {
            if let Some(expected) = &self.expected {
                if reply.signature() != expected {
                    return Err(Error::SignatureMismatch { expected: expected.clone(), found: reply.signature().clone() });
                }
            }
        }
        reply.call_id = self.call_id;
        reply.deliver(&[&self.handle])
    }
}
