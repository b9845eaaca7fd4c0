//! # Interfaces
//!
//! An `Interface` is a named, ordered registry of members. Each member pairs
//! an input and output signature with the handler that services it.
//!
//! ## Invariants
//! - Member names are unique within an interface.
//! - Once a node implements the interface it is frozen; `add_member` then
//!   fails and leaves the registry untouched.

use std::fmt;
use std::sync::Arc;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use b1pack::Signature;

use crate::error::Error;
use crate::error::Result;
use crate::message::Message;
use crate::node::Node;

/// Services one inbound CALL. It may answer through `Message::reply`,
/// detach a `ReplyTarget` to answer later, or send nothing.
pub type MemberFn = Arc<dyn Fn(&Node, &mut Message) -> Result<()> + Send + Sync>;

#[derive(Clone)]
pub struct Member {
    name: String,
    input: Signature,
    output: Signature,
    handler: MemberFn,
}

impl Member {
    pub fn name(&self) -> &str { &self.name }
    pub fn input(&self) -> &Signature { &self.input }
    pub fn output(&self) -> &Signature { &self.output }

    pub(crate) fn call(&self, node: &Node, message: &mut Message) -> Result<()> {
        (self.handler)(node, message)
    }
}

impl fmt::Debug for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Member")
            .field("name", &self.name)
            .field("input", &self.input.as_str())
            .field("output", &self.output.as_str())
            .finish()
    }
}

struct InterfaceInner {
    name: String,
    members: RwLock<Vec<Member>>,
    frozen: AtomicBool,
}

#[derive(Clone)]
pub struct Interface {
    inner: Arc<InterfaceInner>,
}

impl Interface {
    pub fn new(name: &str) -> Result<Interface> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("interface name is empty".into()));
        }
        let inner = InterfaceInner { name: name.to_string(), members: RwLock::new(Vec::new()), frozen: AtomicBool::new(false) };
        Ok(Interface { inner: Arc::new(inner) })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registers a member.
    ///
    /// # Errors
    /// `InterfaceInUse` once frozen, `DuplicateMember` for a repeated name,
    /// `Pack` for a malformed signature.
    pub fn add_member<F>(&self, name: &str, input: &str, output: &str, handler: F) -> Result<()>
    where
        F: Fn(&Node, &mut Message) -> Result<()> + Send + Sync + 'static,
    {
        if name.is_empty() {
            return Err(Error::InvalidArgument("member name is empty".into()));
        }
        let input = Signature::parse(input)?;
        let output = Signature::parse(output)?;

        let mut members = self.inner.members.write().unwrap_or_else(PoisonError::into_inner);
        if self.is_frozen() {
            return Err(Error::InterfaceInUse);
        }
        if members.iter().any(|m| m.name == name) {
            return Err(Error::DuplicateMember(name.to_string()));
        }
        members.push(Member { name: name.to_string(), input, output, handler: Arc::new(handler) });
        Ok(())
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        let members = self.inner.members.read().unwrap_or_else(PoisonError::into_inner);
        members.iter().find(|m| m.name == name).cloned()
    }

    /// Members in registration order.
    pub fn members(&self) -> Vec<Member> {
        self.inner.members.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::Acquire)
    }

    pub(crate) fn freeze(&self) {
        // Taking the write lock orders the flag after any add_member in flight.
        let _members = self.inner.members.write().unwrap_or_else(PoisonError::into_inner);
        self.inner.frozen.store(true, Ordering::Release);
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.inner.name)
            .field("members", &self.members())
            .field("frozen", &self.is_frozen())
            .finish()
    }
}
