//! Integration scenarios: two or three cache instances wired through a
//! recording messenger, with message delivery driven by the test.

use firehose::{
    Firehose, FirehoseConfig, Messenger, NodeId, PageBackend, PinRequestId, Region,
    RemotePinFlags, Request,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const B: u64 = 4096;

#[derive(Default)]
struct Sent {
    pin_requests: Vec<(NodeId, PinRequestId, Vec<Region>, Vec<Region>)>,
    pin_replies: Vec<(NodeId, PinRequestId, Vec<Region>)>,
    unpin_notifies: Vec<(NodeId, Vec<Region>)>,
    fail_sends: bool,
}

/// Captures outbound traffic; the test delivers it by hand.
#[derive(Clone, Default)]
struct RecordingMessenger {
    sent: Arc<Mutex<Sent>>,
}

impl RecordingMessenger {
    fn take_pin_requests(&self) -> Vec<(NodeId, PinRequestId, Vec<Region>, Vec<Region>)> {
        std::mem::take(&mut self.sent.lock().pin_requests)
    }

    fn take_pin_replies(&self) -> Vec<(NodeId, PinRequestId, Vec<Region>)> {
        std::mem::take(&mut self.sent.lock().pin_replies)
    }

    fn take_unpin_notifies(&self) -> Vec<(NodeId, Vec<Region>)> {
        std::mem::take(&mut self.sent.lock().unpin_notifies)
    }

    fn fail_sends(&self) {
        self.sent.lock().fail_sends = true;
    }

    fn check(&self) -> std::io::Result<()> {
        if self.sent.lock().fail_sends {
            Err(std::io::Error::other("send failure injected"))
        } else {
            Ok(())
        }
    }
}

impl Messenger for RecordingMessenger {
    fn send_pin_request(
        &self,
        node: NodeId,
        id: PinRequestId,
        pins: &[Region],
        unpins: &[Region],
    ) -> std::io::Result<()> {
        self.check()?;
        self.sent
            .lock()
            .pin_requests
            .push((node, id, pins.to_vec(), unpins.to_vec()));
        Ok(())
    }

    fn send_pin_reply(
        &self,
        node: NodeId,
        id: PinRequestId,
        pinned: &[Region],
    ) -> std::io::Result<()> {
        self.check()?;
        self.sent
            .lock()
            .pin_replies
            .push((node, id, pinned.to_vec()));
        Ok(())
    }

    fn send_unpin_notify(&self, node: NodeId, regions: &[Region]) -> std::io::Result<()> {
        self.check()?;
        self.sent
            .lock()
            .unpin_notifies
            .push((node, regions.to_vec()));
        Ok(())
    }
}

struct Node {
    id: NodeId,
    cache: Firehose<PageBackend, RecordingMessenger>,
    backend: PageBackend,
    messenger: RecordingMessenger,
}

fn node_with(id: NodeId, config: FirehoseConfig) -> Node {
    let backend = PageBackend::new(B, 1 << 30);
    let messenger = RecordingMessenger::default();
    let cache = Firehose::new(config, backend.clone(), messenger.clone()).unwrap();
    Node {
        id,
        cache,
        backend,
        messenger,
    }
}

fn node(id: NodeId, nodes: u16) -> Node {
    node_with(id, FirehoseConfig::new(id, nodes))
}

/// Push everything `from` has sent into `to`'s inbound handlers.
fn deliver(from: &Node, to: &Node) {
    for (target, id, pins, unpins) in from.messenger.take_pin_requests() {
        assert_eq!(target, to.id);
        to.cache.handle_pin_request(from.id, id, pins, unpins);
    }
    for (target, id, pinned) in from.messenger.take_pin_replies() {
        assert_eq!(target, to.id);
        to.cache.handle_pin_reply(from.id, id, &pinned);
    }
    for (target, regions) in from.messenger.take_unpin_notifies() {
        assert_eq!(target, to.id);
        to.cache.handle_unpin_notify(from.id, &regions);
    }
}

/// Run a full remote-pin round trip to completion and return the request.
fn pin_remote(a: &Node, b: &Node, addr: u64, len: u64) -> Request {
    let got = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&got);
    let immediate = a
        .cache
        .remote_pin(b.id, addr, len, RemotePinFlags::return_if_pinned(), move |r| {
            *sink.lock() = Some(r.unwrap());
        })
        .unwrap();
    if let Some(request) = immediate {
        return request;
    }
    deliver(a, b);
    b.cache.poll().unwrap();
    deliver(b, a);
    a.cache.poll().unwrap();
    let request = got.lock().take().expect("completion did not fire");
    request
}

// ---- local pins ----

#[test]
fn test_local_pin_release_reclaim() {
    let n = node(0, 1);
    let pin = n.cache.local_pin(0x10000, B).unwrap();
    assert_eq!(n.backend.pin_calls(), 1);
    assert_eq!(pin.addr(), 0x10000);
    assert_eq!(pin.len(), B);

    n.cache.release(pin);
    let stats = n.cache.stats();
    assert_eq!(stats.local_victims, 1);
    assert_eq!(stats.local_pinned, 1);

    // Re-pinning the same page is a reclaim: no backend traffic since init.
    let pin = n.cache.local_pin(0x10000, B).unwrap();
    assert_eq!(n.backend.pin_calls(), 1);
    assert_eq!(n.cache.stats().local_victims, 0);
    n.cache.release(pin);
}

#[test]
fn test_local_pin_batches_one_backend_call() {
    let n = node(0, 1);
    // Four buckets, unaligned span: one vectorized pin call.
    let pin = n.cache.local_pin(0x10010, 3 * B + 32).unwrap();
    assert_eq!(n.backend.pin_calls(), 1);
    assert_eq!(n.backend.pinned_granules(), 4);
    n.cache.release(pin);
}

#[test]
fn test_try_local_pin_never_pins() {
    let n = node(0, 1);
    assert!(n.cache.try_local_pin(0x10000, B).unwrap().is_none());
    assert_eq!(n.backend.pin_calls(), 0);

    let pin = n.cache.local_pin(0x10000, 2 * B).unwrap();
    n.cache.release(pin);

    // Fully resident (as victims): try succeeds without a backend call.
    let pin = n.cache.try_local_pin(0x10000, 2 * B).unwrap().unwrap();
    assert_eq!(n.backend.pin_calls(), 1);

    // Partially resident: try refuses and changes nothing.
    assert!(n.cache.try_local_pin(0x10000, 3 * B).unwrap().is_none());
    assert_eq!(n.backend.pin_calls(), 1);
    n.cache.release(pin);
}

#[test]
fn test_partial_local_pin_prefix() {
    let n = node(0, 1);
    let pin = n.cache.local_pin(0x10000, 2 * B).unwrap();

    // First two buckets resident, third not: the prefix comes back clipped.
    let partial = n.cache.partial_local_pin(0x10000, 3 * B).unwrap().unwrap();
    assert_eq!(partial.addr(), 0x10000);
    assert_eq!(partial.len(), 2 * B);
    assert_eq!(n.backend.pin_calls(), 1);

    // Nothing resident at the start: no partial.
    assert!(n.cache.partial_local_pin(0x40000, B).unwrap().is_none());

    n.cache.release_all([pin, partial]);
}

#[test]
fn test_local_eviction_is_fifo() {
    let n = node_with(0, FirehoseConfig::new(0, 1).with_max_local_buckets(2));
    let a = n.cache.local_pin(0x10000, B).unwrap();
    n.cache.release(a);
    let b = n.cache.local_pin(0x20000, B).unwrap();
    n.cache.release(b);

    // Capacity forces one eviction: the oldest victim (a) goes first.
    let c = n.cache.local_pin(0x30000, B).unwrap();
    assert_eq!(n.backend.unpin_calls(), 1);
    assert_eq!(n.backend.resident_granules(), 2);
    assert!(n.cache.try_local_pin(0x20000, B).unwrap().is_some());
    assert!(n.cache.try_local_pin(0x10000, B).unwrap().is_none());
    n.cache.release(c);
}

#[test]
fn test_local_cache_pressure_is_typed() {
    let n = node_with(0, FirehoseConfig::new(0, 1).with_max_local_buckets(1));
    let held = n.cache.local_pin(0x10000, B).unwrap();
    let err = n.cache.local_pin(0x20000, B).unwrap_err();
    assert!(matches!(err, firehose::FirehoseError::CachePressure));
    n.cache.release(held);
}

#[test]
fn test_empty_region_rejected() {
    let n = node(0, 2);
    assert!(matches!(
        n.cache.local_pin(0x1000, 0),
        Err(firehose::FirehoseError::EmptyRegion)
    ));
    assert!(matches!(
        n.cache.remote_pin(0, 0x1000, B, RemotePinFlags::default(), |_| {}),
        Err(firehose::FirehoseError::LocalNode)
    ));
}

// ---- remote pins ----

#[test]
fn test_remote_pin_round_trip() {
    let a = node(0, 2);
    let b = node(1, 2);

    let fired = Arc::new(AtomicUsize::new(0));
    let got = Arc::new(Mutex::new(None));
    let (fired2, got2) = (Arc::clone(&fired), Arc::clone(&got));

    let immediate = a
        .cache
        .remote_pin(1, 0x10000, 4 * B, RemotePinFlags::default(), move |r| {
            fired2.fetch_add(1, Ordering::SeqCst);
            *got2.lock() = Some(r.unwrap());
        })
        .unwrap();
    assert!(immediate.is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    // The target pins on our behalf when it polls, then replies.
    deliver(&a, &b);
    assert_eq!(b.backend.pin_calls(), 0);
    b.cache.poll().unwrap();
    assert_eq!(b.backend.pin_calls(), 1);
    assert_eq!(b.backend.pinned_granules(), 4);

    // The completion fires from our poll, exactly once.
    deliver(&b, &a);
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    a.cache.poll().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    a.cache.poll().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    let request = got.lock().take().unwrap();
    assert_eq!(request.node(), 1);
    assert_eq!(request.len(), 4 * B);

    let stats = a.cache.stats();
    assert_eq!(stats.peers.len(), 1);
    assert_eq!(stats.peers[0].tracked, 4);
    assert_eq!(stats.peers[0].victims, 0);

    a.cache.release(request);
    let stats = a.cache.stats();
    assert_eq!(stats.peers[0].tracked, 4);
    assert_eq!(stats.peers[0].victims, 4);
}

#[test]
fn test_remote_pin_hit_paths() {
    let a = node(0, 2);
    let b = node(1, 2);

    let first = pin_remote(&a, &b, 0x10000, 2 * B);
    a.cache.release(first);

    // Fully resident: return_if_pinned hands the request straight back.
    let hit = a
        .cache
        .remote_pin(1, 0x10000, 2 * B, RemotePinFlags::return_if_pinned(), |_| {
            panic!("callback must not run on the return path")
        })
        .unwrap()
        .expect("full hit");
    assert!(a.messenger.take_pin_requests().is_empty());
    a.cache.release(hit);

    // Without the flag the callback runs synchronously instead.
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let got = Arc::new(Mutex::new(None));
    let got2 = Arc::clone(&got);
    let out = a
        .cache
        .remote_pin(1, 0x10000, 2 * B, RemotePinFlags::default(), move |r| {
            fired2.fetch_add(1, Ordering::SeqCst);
            *got2.lock() = Some(r.unwrap());
        })
        .unwrap();
    assert!(out.is_none());
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    a.cache.release(got.lock().take().unwrap());

    // Probe-only variants hit the same resident buckets.
    let t = a.cache.try_remote_pin(1, 0x10000, 2 * B).unwrap().unwrap();
    a.cache.release(t);
    let p = a.cache.partial_remote_pin(1, 0x10000, 4 * B).unwrap().unwrap();
    assert_eq!(p.len(), 2 * B);
    a.cache.release(p);
    assert!(a.cache.try_remote_pin(1, 0x40000, B).unwrap().is_none());
    assert!(a.messenger.take_pin_requests().is_empty());
}

#[test]
fn test_remote_budget_evicts_fifo_head() {
    let a = node_with(0, FirehoseConfig::new(0, 2).with_per_peer_buckets(2));
    let b = node(1, 2);

    let x = pin_remote(&a, &b, 0x10000, B);
    a.cache.release(x);
    let y = pin_remote(&a, &b, 0x20000, B);
    a.cache.release(y);
    assert_eq!(a.cache.stats().peers[0].tracked, 2);

    // A third distinct bucket must evict the oldest victim (x), and the
    // unpin rides the outbound pin request.
    let out = a
        .cache
        .remote_pin(1, 0x30000, B, RemotePinFlags::default(), |r| {
            r.unwrap();
        })
        .unwrap();
    assert!(out.is_none());
    let requests = a.messenger.take_pin_requests();
    assert_eq!(requests.len(), 1);
    let (target, id, pins, unpins) = &requests[0];
    assert_eq!(*target, 1);
    assert_eq!(pins.as_slice(), &[Region::new(0x30000, B)]);
    assert_eq!(unpins.as_slice(), &[Region::new(0x10000, B)]);
    assert_eq!(a.cache.stats().peers[0].tracked, 2);

    // The target drops its pin for the evicted bucket while serving the new
    // one.
    b.cache.handle_pin_request(0, *id, pins.clone(), unpins.clone());
    b.cache.poll().unwrap();
    let stats = b.cache.stats();
    assert_eq!(stats.local_victims, 1); // x, parked for reclaim
    deliver(&b, &a);
    a.cache.poll().unwrap();
}

#[test]
fn test_remote_budget_exhausted_is_typed() {
    let a = node_with(0, FirehoseConfig::new(0, 2).with_per_peer_buckets(1));
    let b = node(1, 2);

    let held = pin_remote(&a, &b, 0x10000, B);
    let err = a
        .cache
        .remote_pin(1, 0x20000, B, RemotePinFlags::default(), |_| {})
        .unwrap_err();
    assert!(matches!(
        err,
        firehose::FirehoseError::PeerBudget { node: 1 }
    ));
    a.cache.release(held);
}

#[test]
fn test_concurrent_misses_share_one_round_trip() {
    let a = node(0, 2);
    let b = node(1, 2);

    let fired = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let fired = Arc::clone(&fired);
        let out = a
            .cache
            .remote_pin(1, 0x10000, B, RemotePinFlags::default(), move |r| {
                r.unwrap();
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(out.is_none());
    }
    // The second request joined the first round trip.
    assert_eq!(a.messenger.sent.lock().pin_requests.len(), 1);

    deliver(&a, &b);
    b.cache.poll().unwrap();
    deliver(&b, &a);
    a.cache.poll().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
    assert_eq!(a.cache.stats().peers[0].tracked, 1);
}

#[test]
fn test_threaded_misses_share_one_round_trip() {
    let a = Arc::new(node(0, 2));
    let b = node(1, 2);

    let fired = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let a = Arc::clone(&a);
        let fired = Arc::clone(&fired);
        handles.push(std::thread::spawn(move || {
            let fired = Arc::clone(&fired);
            a.cache
                .remote_pin(1, 0x10000, B, RemotePinFlags::default(), move |r| {
                    r.unwrap();
                    fired.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(a.messenger.sent.lock().pin_requests.len(), 1);
    deliver(&a, &b);
    b.cache.poll().unwrap();
    deliver(&b, &a);
    a.cache.poll().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[test]
fn test_peer_under_pressure_declines() {
    let a = node(0, 2);
    let b = node_with(1, FirehoseConfig::new(1, 2).with_max_local_buckets(1));

    // Every bucket on b is held: it cannot serve the peer.
    let held = b.cache.local_pin(0x90000, B).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    a.cache
        .remote_pin(1, 0x10000, B, RemotePinFlags::default(), move |r| {
            assert!(matches!(
                r,
                Err(firehose::FirehoseError::PeerDeclined { node: 1 })
            ));
            fired2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    deliver(&a, &b);
    b.cache.poll().unwrap();
    deliver(&b, &a);
    a.cache.poll().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    // The failed request leaked nothing.
    let stats = a.cache.stats();
    assert_eq!(stats.buckets, 0);
    assert_eq!(stats.live_requests, 0);
    assert_eq!(stats.peers[0].tracked, 0);
    b.cache.release(held);
}

#[test]
fn test_dispatch_failure_rolls_back() {
    let a = node(0, 2);
    a.messenger.fail_sends();

    let err = a
        .cache
        .remote_pin(1, 0x10000, B, RemotePinFlags::default(), |_| {
            panic!("callback must not run when dispatch fails")
        })
        .unwrap_err();
    assert!(matches!(err, firehose::FirehoseError::Transport(_)));

    let stats = a.cache.stats();
    assert_eq!(stats.buckets, 0);
    assert_eq!(stats.live_requests, 0);
    assert_eq!(stats.peers[0].tracked, 0);
}

// ---- shutdown ----

#[test]
fn test_fini_notifies_peers_and_unpins() {
    let a = node(0, 2);
    let b = node(1, 2);

    let remote = pin_remote(&a, &b, 0x10000, 2 * B);
    let local = a.cache.local_pin(0x50000, B).unwrap();
    a.cache.release_all([remote, local]);

    let backend = a.backend.clone();
    let messenger = a.messenger.clone();
    a.cache.fini().unwrap();

    let notifies = messenger.take_unpin_notifies();
    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].0, 1);
    assert_eq!(notifies[0].1.as_slice(), &[Region::new(0x10000, 2 * B)]);
    assert_eq!(backend.resident_granules(), 0);
}

// ---- prepinned seeding ----

#[test]
fn test_prepinned_regions_reclaim_free() {
    let backend = PageBackend::new(B, 1 << 30);
    backend.preregister(&[Region::new(0x10000, 4 * B)]);
    let config = FirehoseConfig::new(0, 1).with_prepinned(vec![Region::new(0x10000, 4 * B)]);
    let cache = Firehose::new(config, backend.clone(), RecordingMessenger::default()).unwrap();

    assert_eq!(cache.stats().local_victims, 4);
    let pin = cache.local_pin(0x10000, 4 * B).unwrap();
    // Seeded regions never cost a pin call.
    assert_eq!(backend.pin_calls(), 0);
    cache.release(pin);
}
