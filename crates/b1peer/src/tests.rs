use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use b1pack::Signature;
use b1wire::Frame;
use b1wire::Meta;

use crate::BusConfig;
use crate::Channel;
use crate::ChannelError;
use crate::Delivery;
use crate::DestroyReason;
use crate::Error;
use crate::ErrorKind;
use crate::Interface;
use crate::LocalBus;
use crate::Message;
use crate::MessageType;
use crate::MulticastGroup;
use crate::Node;
use crate::NodeState;
use crate::Peer;
use crate::Result;
use crate::Userdata;
use crate::Value;
use crate::names;
use crate::bus::Connection;
use crate::reply::CallError;

fn peer_on(bus: &LocalBus, name: &str) -> Peer {
    Peer::from_channel(name, Box::new(bus.connect()))
}

/// Server with one node, and a client connection holding a handle to it.
fn linked(bus: &LocalBus) -> Result<(Peer, Node, Peer, crate::Handle)> {
    let server = peer_on(bus, "server");
    let node = Node::new(&server, None)?;
    let (client, target) = server.clone_peer(&node.handle())?;
    Ok((server, node, client, target))
}

/// A string claiming five bytes and carrying one.
const SHORT_STRING: [u8; 5] = [5, 0, 0, 0, b'a'];

fn raw_call(handles: Vec<u64>) -> Result<Vec<u8>> {
    let frame = Frame {
        call_id: 1,
        meta: Meta::Call { interface: "org.example.Test".into(), member: "ping".into(), reply_handle: None },
        signature: Signature::empty(),
        body: Vec::new(),
        handles,
        n_fds: 0,
    };
    Ok(frame.encode()?)
}

// ============================================================================
//  Bus
// ============================================================================

#[test]
fn test_bus_clone_hands_out_handle() -> Result<()> {
    let bus = LocalBus::new("/unit/clone", BusConfig::default());
    let a = bus.connect();
    let node = a.node_new()?;
    let (child, handle) = a.clone_peer(node)?;

    assert_eq!(bus.peer_count(), 2);
    assert_eq!(bus.node_count(), 1);
    assert_ne!(child.descriptor(), a.descriptor());

    child.send(&[handle], &raw_call(vec![])?, &[])?;
    match a.try_recv()? {
        Some(Delivery::Data { destination, credentials, .. }) => {
            assert_eq!(destination, node);
            assert_eq!(credentials.pid, std::process::id());
        }
        other => panic!("Expected data delivery, got {:?}", other.is_some()),
    }
    Ok(())
}

#[test]
fn test_bus_release_waits_for_holders() -> Result<()> {
    let bus = LocalBus::new("/unit/release", BusConfig::default());
    let a = bus.connect();
    let node = a.node_new()?;
    let (child, handle) = a.clone_peer(node)?;

    a.node_release(node)?;
    match child.try_recv()? {
        Some(Delivery::NodeDestroy { handle: h }) => assert_eq!(h, handle),
        _ => panic!("Expected NODE_DESTROY for the holder"),
    }
    assert!(a.try_recv()?.is_none());
    assert_eq!(bus.node_count(), 1);

    child.handle_release(handle)?;
    match a.try_recv()? {
        Some(Delivery::NodeRelease { handle: h }) => assert_eq!(h, node),
        _ => panic!("Expected NODE_RELEASE for the owner"),
    }
    assert_eq!(bus.node_count(), 0);
    Ok(())
}

#[test]
fn test_bus_release_without_holders_is_immediate() -> Result<()> {
    let bus = LocalBus::new("/unit/release-now", BusConfig::default());
    let a = bus.connect();
    let node = a.node_new()?;
    a.node_release(node)?;

    assert!(matches!(a.try_recv()?, Some(Delivery::NodeRelease { .. })));
    assert_eq!(bus.node_count(), 0);
    match a.node_release(node) {
        Err(ChannelError::InvalidHandle(_)) => {}
        other => panic!("Expected InvalidHandle, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_bus_destroy_notifies_and_skips_sends() -> Result<()> {
    let bus = LocalBus::new("/unit/destroy", BusConfig::default());
    let a = bus.connect();
    let node = a.node_new()?;
    let (child, handle) = a.clone_peer(node)?;

    a.node_destroy(node)?;
    a.node_destroy(node)?;
    assert!(matches!(child.try_recv()?, Some(Delivery::NodeDestroy { .. })));
    assert!(child.try_recv()?.is_none());

    // Sending to a dead node succeeds and delivers nothing.
    child.send(&[handle], &raw_call(vec![])?, &[])?;
    assert!(a.try_recv()?.is_none());

    child.handle_release(handle)?;
    assert_eq!(bus.node_count(), 0);
    assert!(a.try_recv()?.is_none());
    Ok(())
}

#[test]
fn test_bus_only_owner_may_release() -> Result<()> {
    let bus = LocalBus::new("/unit/owner", BusConfig::default());
    let a = bus.connect();
    let node = a.node_new()?;
    let (child, handle) = a.clone_peer(node)?;

    match child.node_release(handle) {
        Err(ChannelError::NotOwner(h)) => assert_eq!(h, handle),
        other => panic!("Expected NotOwner, got {:?}", other),
    }
    match child.node_destroy(handle) {
        Err(ChannelError::NotOwner(_)) => {}
        other => panic!("Expected NotOwner, got {:?}", other),
    }

    // The owner's handle stays valid however often it is released.
    a.handle_release(node)?;
    a.handle_release(node)?;
    child.send(&[handle], &raw_call(vec![])?, &[])?;
    assert!(a.try_recv()?.is_some());
    Ok(())
}

#[test]
fn test_bus_rejects_oversized_frames() -> Result<()> {
    let config = BusConfig { max_frame_size: 32, queue_limit: None };
    let bus = LocalBus::new("/unit/size", config);
    let a = bus.connect();
    let node = a.node_new()?;

    match a.send(&[node], &raw_call(vec![])?, &[]) {
        Err(ChannelError::FrameTooLarge { limit, .. }) => assert_eq!(limit, 32),
        other => panic!("Expected FrameTooLarge, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_bus_queue_limit() -> Result<()> {
    let config = BusConfig { queue_limit: Some(1), ..BusConfig::default() };
    let bus = LocalBus::new("/unit/quota", config);
    let a = bus.connect();
    let node = a.node_new()?;
    let (child, handle) = a.clone_peer(node)?;

    let frame = raw_call(vec![])?;
    child.send(&[handle], &frame, &[])?;
    match child.send(&[handle], &frame, &[]) {
        Err(ChannelError::QuotaExceeded { queued, limit }) => {
            assert_eq!(queued, 1);
            assert_eq!(limit, 1);
        }
        other => panic!("Expected QuotaExceeded, got {:?}", other),
    }

    a.try_recv()?;
    child.send(&[handle], &frame, &[])?;
    Ok(())
}

#[test]
fn test_bus_transfers_attached_handles() -> Result<()> {
    let bus = LocalBus::new("/unit/transfer", BusConfig::default());
    let a = bus.connect();
    let target = a.node_new()?;
    let (child, to_a) = a.clone_peer(target)?;
    let gift = child.node_new()?;

    child.send(&[to_a], &raw_call(vec![gift])?, &[])?;
    let Some(Delivery::Data { frame, .. }) = a.try_recv()? else { panic!("Expected data delivery") };
    let ids = b1wire::handle_table(&frame)?;
    assert_eq!(ids.len(), 1);
    assert_ne!(ids[0], gift);

    // The gifted handle reaches the child's node.
    a.send(&[ids[0]], &raw_call(vec![])?, &[])?;
    match child.try_recv()? {
        Some(Delivery::Data { destination, .. }) => assert_eq!(destination, gift),
        _ => panic!("Expected delivery to the gifted node"),
    }

    // Handles the sender does not hold are rejected.
    match child.send(&[to_a], &raw_call(vec![999])?, &[]) {
        Err(ChannelError::InvalidHandle(999)) => {}
        other => panic!("Expected InvalidHandle, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_bus_disconnect_destroys_owned_nodes() -> Result<()> {
    let bus = LocalBus::new("/unit/disconnect", BusConfig::default());
    let a = bus.connect();
    let node = a.node_new()?;
    let (child, handle) = a.clone_peer(node)?;

    drop(a);
    assert_eq!(bus.peer_count(), 1);
    match child.try_recv()? {
        Some(Delivery::NodeDestroy { handle: h }) => assert_eq!(h, handle),
        _ => panic!("Expected NODE_DESTROY after owner disconnect"),
    }
    child.handle_release(handle)?;
    assert_eq!(bus.node_count(), 0);

    child.disconnect();
    assert_eq!(bus.peer_count(), 0);
    match child.node_new() {
        Err(ChannelError::Disconnected) => {}
        other => panic!("Expected Disconnected, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_bus_seed_roundtrip() -> Result<()> {
    let bus = LocalBus::new("/unit/seed", BusConfig::default());
    let a = bus.connect();
    match a.recv_seed() {
        Err(ChannelError::NoSeed) => {}
        other => panic!("Expected NoSeed, got {:?}", other.is_ok()),
    }

    let root = a.node_new()?;
    let frame = Frame {
        call_id: 0,
        meta: Meta::Seed { roots: vec![("org.example.Root".into(), 0)] },
        signature: Signature::empty(),
        body: Vec::new(),
        handles: vec![root],
        n_fds: 0,
    }
    .encode()?;
    a.send_seed(&frame, &[])?;

    let Delivery::Data { frame: stored, .. } = a.recv_seed()? else { panic!("Expected stored seed") };
    assert_eq!(b1wire::handle_table(&stored)?, vec![root]);
    assert!(matches!(a.recv_seed(), Err(ChannelError::NoSeed)));

    // Only owned nodes can be seeded.
    let (child, held) = a.clone_peer(root)?;
    let frame = Frame {
        call_id: 0,
        meta: Meta::Seed { roots: vec![("org.example.Root".into(), 0)] },
        signature: Signature::empty(),
        body: Vec::new(),
        handles: vec![held],
        n_fds: 0,
    }
    .encode()?;
    match child.send_seed(&frame, &[]) {
        Err(ChannelError::NotOwner(_)) => {}
        other => panic!("Expected NotOwner, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_connection_from_descriptor() -> Result<()> {
    let bus = LocalBus::new("/unit/descriptor", BusConfig::default());
    let a = bus.connect();
    let shared = Connection::from_descriptor(a.descriptor())?;
    assert_eq!(shared.descriptor(), a.descriptor());

    let node = shared.node_new()?;
    a.node_destroy(node)?;

    // Closing one side leaves the link to the other.
    shared.disconnect();
    assert_eq!(bus.peer_count(), 1);
    a.node_new()?;

    let fd = a.descriptor();
    drop(a);
    drop(shared);
    match Connection::from_descriptor(fd) {
        Err(ChannelError::UnknownDescriptor(d)) => assert_eq!(d, fd),
        _ => panic!("Expected UnknownDescriptor"),
    }
    Ok(())
}

// ============================================================================
//  Interfaces and Nodes
// ============================================================================

#[test]
fn test_interface_members() -> Result<()> {
    let iface = Interface::new("org.example.Calc")?;
    iface.add_member("add", "(uu)", "u", |_, _| Ok(()))?;
    iface.add_member("neg", "i", "i", |_, _| Ok(()))?;

    match iface.add_member("add", "u", "u", |_, _| Ok(())) {
        Err(Error::DuplicateMember(name)) => assert_eq!(name, "add"),
        other => panic!("Expected DuplicateMember, got {:?}", other),
    }
    match iface.add_member("bad", "(u", "u", |_, _| Ok(())) {
        Err(Error::Pack(_)) => {}
        other => panic!("Expected Pack error, got {:?}", other),
    }
    assert!(matches!(Interface::new(""), Err(Error::InvalidArgument(_))));

    let names: Vec<String> = iface.members().iter().map(|m| m.name().to_string()).collect();
    assert_eq!(names, vec!["add", "neg"]);
    let add = iface.member("add").expect("add registered");
    assert_eq!(add.input().as_str(), "(uu)");
    assert_eq!(add.output().as_str(), "u");
    assert!(iface.member("sub").is_none());
    Ok(())
}

#[test]
fn test_implement_freezes_interface() -> Result<()> {
    let bus = LocalBus::new("/unit/freeze", BusConfig::default());
    let peer = peer_on(&bus, "freeze");
    let iface = Interface::new("org.example.Frozen")?;
    iface.add_member("ping", "", "", |_, _| Ok(()))?;

    let node = Node::new(&peer, None)?;
    node.implement(&iface)?;
    assert!(iface.is_frozen());
    assert_eq!(node.interface().map(Interface::name), Some("org.example.Frozen"));

    match iface.add_member("late", "", "", |_, _| Ok(())) {
        Err(Error::InterfaceInUse) => {}
        other => panic!("Expected InterfaceInUse, got {:?}", other),
    }
    match node.implement(&iface) {
        Err(Error::AlreadyImplemented) => {}
        other => panic!("Expected AlreadyImplemented, got {:?}", other),
    }

    let other = Node::new(&peer, None)?;
    other.destroy();
    match other.implement(&iface) {
        Err(Error::NodeUnavailable(NodeState::Destroyed)) => {}
        other => panic!("Expected NodeUnavailable, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_destroy_fn_runs_once() -> Result<()> {
    let bus = LocalBus::new("/unit/destroy-fn", BusConfig::default());
    let peer = peer_on(&bus, "destroy-fn");
    let reasons = Arc::new(Mutex::new(Vec::new()));

    let node = Node::new(&peer, Some(Arc::new(7u32) as Userdata))?;
    assert_eq!(node.userdata_as::<u32>(), Some(&7));
    let seen = reasons.clone();
    node.set_destroy_fn(move |d| {
        assert_eq!(d.userdata.as_ref().and_then(|u| u.downcast_ref::<u32>()), Some(&7));
        seen.lock().unwrap().push(d.reason);
    });

    let copy = node.clone();
    node.destroy();
    copy.destroy();
    drop(node);
    drop(copy);
    assert_eq!(*reasons.lock().unwrap(), vec![DestroyReason::Destroyed]);

    let seen = reasons.clone();
    let dropped = Node::new(&peer, None)?;
    dropped.set_destroy_fn(move |d| seen.lock().unwrap().push(d.reason));
    drop(dropped);
    assert_eq!(*reasons.lock().unwrap(), vec![DestroyReason::Destroyed, DestroyReason::Dropped]);
    assert_eq!(bus.node_count(), 0);
    Ok(())
}

#[test]
fn test_release_is_idempotent() -> Result<()> {
    let bus = LocalBus::new("/unit/release-twice", BusConfig::default());
    let peer = peer_on(&bus, "release-twice");
    let node = Node::new(&peer, None)?;

    node.release()?;
    node.release()?;
    assert_eq!(node.state(), NodeState::Released);
    assert!(node.handle().is_stale());

    // No holders, so the release notice is already queued.
    assert!(peer.try_dispatch()?);
    assert_eq!(node.state(), NodeState::Destroyed);
    Ok(())
}

#[test]
fn test_released_node_outlives_its_last_reference() -> Result<()> {
    let bus = LocalBus::new("/unit/release-drop", BusConfig::default());
    let (server, node, client, target) = linked(&bus)?;
    let served = Arc::new(AtomicUsize::new(0));
    let reasons = Arc::new(Mutex::new(Vec::new()));

    let iface = Interface::new("org.example.Test")?;
    let count = served.clone();
    iface.add_member("ping", "", "", move |_, _| {
        count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })?;
    node.implement(&iface)?;
    let seen = reasons.clone();
    node.set_destroy_fn(move |d| seen.lock().unwrap().push(d.reason));

    let mut ping = Message::new_call(&client, "org.example.Test", "ping", "")?;
    ping.send(&[&target])?;
    node.release()?;
    drop(node);
    assert!(reasons.lock().unwrap().is_empty());
    assert_eq!(bus.node_count(), 1);

    // The call queued before the release still runs.
    assert!(server.try_dispatch()?);
    assert_eq!(served.load(Ordering::SeqCst), 1);

    drop(target);
    assert!(server.try_dispatch()?);
    assert_eq!(*reasons.lock().unwrap(), vec![DestroyReason::Released]);
    assert_eq!(bus.node_count(), 0);
    drop(client);
    Ok(())
}

// ============================================================================
//  Handles and Subscriptions
// ============================================================================

#[test]
fn test_handle_identity() -> Result<()> {
    let bus = LocalBus::new("/unit/identity", BusConfig::default());
    let peer = peer_on(&bus, "identity");
    let node = Node::new(&peer, None)?;
    let other = Node::new(&peer, None)?;

    let mut set = HashSet::new();
    set.insert(node.handle());
    set.insert(node.handle());
    set.insert(other.handle());
    assert_eq!(set.len(), 2);
    assert!(node.handle().is_local());
    assert_eq!(node.handle().id(), node.id());
    assert!(node.handle().peer().is_some());
    Ok(())
}

#[test]
fn test_subscription_fires_once() -> Result<()> {
    let bus = LocalBus::new("/unit/subscribe", BusConfig::default());
    let peer = peer_on(&bus, "subscribe");
    let node = Node::new(&peer, None)?;
    let fired = Arc::new(AtomicUsize::new(0));

    let count = fired.clone();
    let sub = node.handle().subscribe(move |h| {
        assert!(h.is_stale());
        count.fetch_add(1, Ordering::SeqCst);
    });
    let count = fired.clone();
    let cancelled = node.handle().subscribe(move |_| {
        count.fetch_add(100, Ordering::SeqCst);
    });
    assert!(sub.is_active());
    drop(cancelled);

    node.destroy();
    node.destroy();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!sub.is_active());

    // Subscribing to a stale handle fires at once.
    let count = fired.clone();
    let late = node.handle().subscribe(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    assert!(!late.is_active());
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    Ok(())
}

// ============================================================================
//  Messages
// ============================================================================

#[test]
fn test_append_handle_dedups() -> Result<()> {
    let bus = LocalBus::new("/unit/append", BusConfig::default());
    let peer = peer_on(&bus, "append");
    let a = Node::new(&peer, None)?;
    let b = Node::new(&peer, None)?;

    let mut msg = Message::new_call(&peer, "org.example.Test", "take", "hhh")?;
    assert_eq!(msg.append_handle(&a.handle())?, 0);
    assert_eq!(msg.append_handle(&b.handle())?, 1);
    assert_eq!(msg.append_handle(&a.handle())?, 0);
    assert_eq!(msg.handles().len(), 2);

    msg.write_handle(&a.handle())?;
    msg.write_handle(&b.handle())?;
    msg.write_handle(&a.handle())?;
    msg.seal()?;
    assert_eq!(msg.read_handle()?, a.handle());
    assert_eq!(msg.read_handle()?, b.handle());
    assert_eq!(msg.read_handle()?, a.handle());
    Ok(())
}

#[test]
fn test_foreign_objects_rejected() -> Result<()> {
    let bus = LocalBus::new("/unit/foreign", BusConfig::default());
    let one = peer_on(&bus, "one");
    let two = peer_on(&bus, "two");
    let theirs = Node::new(&two, None)?;
    let ours = Node::new(&one, None)?;

    let mut msg = Message::new_call(&one, "org.example.Test", "take", "")?;
    assert!(matches!(msg.append_handle(&theirs.handle()), Err(Error::ForeignObject)));
    assert!(matches!(msg.send(&[&theirs.handle()]), Err(Error::ForeignObject)));
    assert!(matches!(Message::new_seed(&one, &[("Root", &theirs)], ""), Err(Error::ForeignObject)));

    let group = MulticastGroup::new(&one);
    assert!(matches!(group.add(theirs.handle()), Err(Error::ForeignObject)));
    assert!(group.add(ours.handle())?);
    assert!(!group.add(ours.handle())?);
    assert_eq!(group.len(), 1);
    assert!(group.remove(&ours.handle()));
    assert!(group.is_empty());
    Ok(())
}

#[test]
fn test_sealed_message_is_frozen() -> Result<()> {
    let bus = LocalBus::new("/unit/sealed", BusConfig::default());
    let peer = peer_on(&bus, "sealed");
    let node = Node::new(&peer, None)?;

    let mut msg = Message::new_call(&peer, "org.example.Test", "echo", "(us)")?;
    assert!(matches!(msg.read("u"), Err(Error::NotSealed)));
    msg.begin_tuple()?;
    msg.write("u", &[7u32.into()])?;
    assert!(msg.seal().is_err());
    assert!(!msg.is_sealed());

    msg.write("s", &["seven".into()])?;
    msg.end_tuple()?;
    msg.seal()?;
    msg.seal()?;
    assert!(msg.is_sealed());

    assert!(matches!(msg.write("u", &[1u32.into()]), Err(Error::Sealed)));
    assert!(matches!(msg.append_handle(&node.handle()), Err(Error::Sealed)));
    let null = std::fs::File::open("/dev/null").expect("open /dev/null");
    assert!(matches!(msg.append_fd(std::os::fd::AsFd::as_fd(&null)), Err(Error::Sealed)));

    assert_eq!(msg.enter_tuple()?, 2);
    assert_eq!(msg.read("us")?, vec![7u32.into(), "seven".into()]);
    msg.exit_tuple()?;
    msg.rewind()?;
    assert_eq!(msg.read_value()?, crate::Value::Tuple(vec![7u32.into(), "seven".into()]));
    Ok(())
}

#[test]
fn test_index_out_of_range() -> Result<()> {
    let bus = LocalBus::new("/unit/range", BusConfig::default());
    let peer = peer_on(&bus, "range");
    let msg = Message::new_call(&peer, "org.example.Test", "none", "")?;

    match msg.handle(0) {
        Err(Error::IndexOutOfRange { index, len }) => assert_eq!((index, len), (0, 0)),
        other => panic!("Expected IndexOutOfRange, got {:?}", other),
    }
    assert!(matches!(msg.fd(3), Err(Error::IndexOutOfRange { index: 3, len: 0 })));
    Ok(())
}

#[test]
fn test_send_argument_checks() -> Result<()> {
    let bus = LocalBus::new("/unit/send", BusConfig::default());
    let peer = peer_on(&bus, "send");
    let node = Node::new(&peer, None)?;
    let handle = node.handle();

    let mut msg = Message::new_call(&peer, "org.example.Test", "ping", "")?;
    assert!(matches!(msg.send(&[]), Err(Error::InvalidArgument(_))));
    match msg.send(&[&handle, &handle]) {
        Err(Error::DuplicateDestination(id)) => assert_eq!(id, handle.id()),
        other => panic!("Expected DuplicateDestination, got {:?}", other),
    }

    let mut seed = Message::new_seed(&peer, &[("Root", &node)], "")?;
    assert!(matches!(seed.send(&[&handle]), Err(Error::InvalidArgument(_))));
    assert!(matches!(Message::new_call(&peer, "", "ping", ""), Err(Error::InvalidArgument(_))));
    assert!(matches!(Message::new_error(&peer, "", ""), Err(Error::InvalidArgument(_))));
    Ok(())
}

#[test]
fn test_new_seed_validation() -> Result<()> {
    let bus = LocalBus::new("/unit/seed-check", BusConfig::default());
    let peer = peer_on(&bus, "seed-check");
    let a = Node::new(&peer, None)?;
    let b = Node::new(&peer, None)?;

    match Message::new_seed(&peer, &[("Root", &a), ("Root", &b)], "") {
        Err(Error::DuplicateName(name)) => assert_eq!(name, "Root"),
        other => panic!("Expected DuplicateName, got {:?}", other),
    }
    b.destroy();
    match Message::new_seed(&peer, &[("Root", &b)], "") {
        Err(Error::NodeUnavailable(NodeState::Destroyed)) => {}
        other => panic!("Expected NodeUnavailable, got {:?}", other),
    }

    let mut seed = Message::new_seed(&peer, &[("Root", &a)], "")?;
    assert_eq!(seed.kind(), MessageType::Seed);
    seed.send(&[])?;
    assert_eq!(a.state(), NodeState::Transferred);

    // A transferred node is not destroyed when it drops.
    drop(a);
    assert_eq!(bus.node_count(), 1);
    Ok(())
}

#[test]
fn test_reply_preconditions() -> Result<()> {
    let bus = LocalBus::new("/unit/reply", BusConfig::default());
    let peer = peer_on(&bus, "reply");

    let mut one_way = Message::new_call(&peer, "org.example.Test", "ping", "")?;
    let mut reply = Message::new_reply(&peer, "")?;
    assert!(matches!(one_way.reply(&mut reply), Err(Error::NoReplyExpected)));
    match reply.reply(&mut one_way) {
        Err(Error::WrongMessageType { expected: MessageType::Call, found: MessageType::Reply }) => {}
        other => panic!("Expected WrongMessageType, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_cancel_completes_slot() -> Result<()> {
    let bus = LocalBus::new("/unit/cancel", BusConfig::default());
    let peer = peer_on(&bus, "cancel");
    let outcomes = Arc::new(Mutex::new(Vec::new()));

    let seen = outcomes.clone();
    let (_call, slot) = Message::new_call_with_reply(&peer, "org.example.Test", "ping", "", "", move |outcome| {
        if let crate::Outcome::Failed(e) = outcome {
            seen.lock().unwrap().push(e);
        }
    })?;
    assert!(slot.is_pending());
    assert_eq!(peer.pending_calls(), 1);

    slot.cancel();
    assert_eq!(*outcomes.lock().unwrap(), vec![CallError::Cancelled]);
    assert_eq!(peer.pending_calls(), 0);
    Ok(())
}

#[test]
fn test_answers_go_through_reply() -> Result<()> {
    let bus = LocalBus::new("/unit/stray-answer", BusConfig::default());
    let peer = peer_on(&bus, "stray-answer");
    let node = Node::new(&peer, None)?;

    let mut reply = Message::new_reply(&peer, "")?;
    match reply.send(&[&node.handle()]) {
        Err(Error::WrongMessageType { expected: MessageType::Call, found: MessageType::Reply }) => {}
        other => panic!("Expected WrongMessageType, got {:?}", other),
    }
    let mut error = Message::new_error(&peer, "org.example.Error.Nope", "")?;
    assert!(matches!(error.send(&[&node.handle()]), Err(Error::WrongMessageType { found: MessageType::Error, .. })));
    assert!(peer.try_recv()?.is_none());
    Ok(())
}

#[test]
fn test_message_round_trip() -> Result<()> {
    let bus = LocalBus::new("/unit/round-trip", BusConfig::default());
    let (server, node, client, target) = linked(&bus)?;
    let sig = "a(v)ma(sh)xd(cn)";
    let values = vec![
        Value::Array(vec![
            Value::Tuple(vec![Value::variant(crate::Type::I16, i16::MIN)]),
            Value::Tuple(vec![Value::variant(crate::Type::parse("as")?, vec!["x", ""])]),
        ]),
        Value::just(Value::Array(vec![Value::Tuple(vec!["self".into(), Value::Handle(0)])])),
        i64::MIN.into(),
        f64::MAX.into(),
        Value::Tuple(vec![i8::MIN.into(), (-2i16).into()]),
    ];

    let mut call = Message::new_call(&client, "org.example.Test", "take", sig)?;
    assert_eq!(call.append_handle(&target)?, 0);
    call.write(sig, &values)?;
    call.seal()?;
    assert_eq!(call.read(sig)?, values);
    call.send(&[&target])?;

    let mut received = server.recv()?;
    assert_eq!(received.signature().as_str(), sig);
    assert_eq!(received.read(sig)?, values);
    assert_eq!(received.handle(0)?, &node.handle());
    Ok(())
}

#[test]
fn test_malformed_call_is_answered() -> Result<()> {
    let bus = LocalBus::new("/unit/malformed-call", BusConfig::default());
    let (server, _node, client, target) = linked(&bus)?;
    let errors = Arc::new(Mutex::new(Vec::new()));

    let seen = errors.clone();
    let (call, slot) = Message::new_call_with_reply(&client, "org.example.Test", "echo", "s", "s", move |outcome| {
        if let crate::Outcome::Error(error) = outcome {
            seen.lock().unwrap().push(error.error_name().map(String::from));
        }
    })?;
    let frame = Frame {
        call_id: slot.call_id(),
        meta: Meta::Call { interface: "org.example.Test".into(), member: "echo".into(), reply_handle: Some(0) },
        signature: Signature::parse("s")?,
        body: SHORT_STRING.to_vec(),
        handles: vec![call.handles()[0].id()],
        n_fds: 0,
    };
    client.inner.channel.send(&[target.id()], &frame.encode()?, &[])?;

    let mut received = server.recv()?;
    assert!(matches!(received.payload_error(), Some(b1pack::Error::UnexpectedEnd)));
    assert!(received.is_sealed());
    assert!(matches!(received.read("s"), Err(Error::Pack(b1pack::Error::UnexpectedEnd))));
    received.dispatch()?;

    assert!(client.try_dispatch()?);
    assert_eq!(*errors.lock().unwrap(), vec![Some(names::INVALID_PAYLOAD.to_string())]);
    assert!(!slot.is_pending());
    Ok(())
}

#[test]
fn test_malformed_reply_fails_call() -> Result<()> {
    let bus = LocalBus::new("/unit/malformed-reply", BusConfig::default());
    let (server, _node, client, target) = linked(&bus)?;
    let failures = Arc::new(Mutex::new(Vec::new()));

    let seen = failures.clone();
    let (mut call, slot) = Message::new_call_with_reply(&client, "org.example.Test", "echo", "s", "s", move |outcome| {
        if let crate::Outcome::Failed(e) = outcome {
            seen.lock().unwrap().push(e);
        }
    })?;
    call.write("s", &["hi".into()])?;
    call.send(&[&target])?;

    let received = server.recv()?;
    let reply_to = received.reply_handle().cloned().expect("call carries a reply handle");
    let frame = Frame {
        call_id: received.call_id(),
        meta: Meta::Reply,
        signature: Signature::parse("s")?,
        body: SHORT_STRING.to_vec(),
        handles: Vec::new(),
        n_fds: 0,
    };
    server.inner.channel.send(&[reply_to.id()], &frame.encode()?, &[])?;

    assert!(client.try_dispatch()?);
    match &failures.lock().unwrap()[..] {
        [CallError::Malformed(detail)] => assert!(!detail.is_empty()),
        other => panic!("Expected one Malformed failure, got {:?}", other),
    }
    assert!(!slot.is_pending());
    Ok(())
}

#[test]
fn test_closed_peer_rejects_work() -> Result<()> {
    let bus = LocalBus::new("/unit/closed", BusConfig::default());
    let peer = peer_on(&bus, "closed");
    let node = Node::new(&peer, None)?;

    peer.close();
    peer.close();
    assert!(peer.is_closed());
    assert_eq!(node.state(), NodeState::Destroyed);
    assert!(matches!(Node::new(&peer, None), Err(Error::ConnectionClosed)));
    assert!(matches!(Message::new_call(&peer, "org.example.Test", "ping", ""), Err(Error::ConnectionClosed)));
    assert!(matches!(peer.recv(), Err(Error::ConnectionClosed)));
    assert_eq!(bus.peer_count(), 0);
    Ok(())
}

// ============================================================================
//  Errors
// ============================================================================

#[test]
fn test_error_kinds() {
    assert_eq!(Error::Sealed.kind(), ErrorKind::Argument);
    assert_eq!(Error::ForeignObject.kind(), ErrorKind::Argument);
    assert_eq!(Error::DuplicateMember("x".into()).kind(), ErrorKind::Resource);
    assert_eq!(Error::NodeUnavailable(NodeState::Destroyed).kind(), ErrorKind::Resource);
    assert_eq!(Error::ConnectionClosed.kind(), ErrorKind::Connection);
    assert_eq!(Error::Call(CallError::ConnectionClosed).kind(), ErrorKind::Connection);
    assert_eq!(Error::Call(CallError::Unreachable).kind(), ErrorKind::Protocol);
    assert_eq!(Error::Call(CallError::Malformed("short".into())).kind(), ErrorKind::Protocol);
    assert_eq!(Error::Channel(ChannelError::Disconnected).kind(), ErrorKind::Connection);
    assert_eq!(Error::Channel(ChannelError::QuotaExceeded { queued: 1, limit: 1 }).kind(), ErrorKind::Resource);

    let remote = Error::Remote { name: crate::names::UNKNOWN_MEMBER.into(), detail: Some("Greet.nope".into()) };
    assert_eq!(remote.kind(), ErrorKind::Protocol);
    assert!(remote.to_string().contains("UnknownMember"));

    let from_channel: Error = ChannelError::InvalidHandle(4).into();
    assert_eq!(from_channel, Error::Channel(ChannelError::InvalidHandle(4)));
}
