use super::{BuildCancelled, Generation, Lookup, Reservation};
use crate::address::{AddressKey, SocketType};
use crate::common::{Provision, ScriptedProvisioner};
use crate::provision::{ProvisionError, ProvisionStep, SystemProvisioner};
use proptest::prelude::*;
use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use tokio_util::sync::CancellationToken;

fn local(dir: &Path, name: &str) -> AddressKey {
    AddressKey::local_path(SocketType::Datagram, &dir.join(name)).unwrap()
}

fn numbered(keys: &[AddressKey]) -> Vec<Reservation> {
    keys.iter()
        .enumerate()
        .map(|(i, key)| Reservation::new(i + 1, key.clone()))
        .collect()
}

fn build(
    id: u64,
    keys: &[AddressKey],
    previous: &Arc<Generation>,
    provisioner: &Arc<ScriptedProvisioner>,
) -> Arc<Generation> {
    let generation = Generation::build(
        id,
        &numbered(keys),
        previous,
        provisioner.clone(),
        &CancellationToken::new(),
    )
    .unwrap();
    Arc::new(generation)
}

fn empty(provisioner: &Arc<ScriptedProvisioner>) -> Arc<Generation> {
    Arc::new(Generation::empty(provisioner.clone()))
}

/// A datagram socket is still bound at `path` if connecting to it succeeds
fn is_bound(path: &Path) -> bool {
    UnixDatagram::unbound().unwrap().connect(path).is_ok()
}

fn handle(generation: &Generation, key: &AddressKey) -> Arc<crate::provision::ReservedSocket> {
    generation.lookup(key, false).into_handle().unwrap()
}

#[test]
fn test_empty_generation() {
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let generation = empty(&provisioner);
    let key = local(Path::new("/tmp"), "nothing.sock");

    assert_eq!(generation.id(), 0);
    assert_eq!(generation.len(), 0);
    assert_eq!(generation.bucket_count(), 1);
    assert!(matches!(generation.lookup(&key, false), Lookup::NotFound));
    assert!(matches!(generation.lookup(&key, true), Lookup::NotFound));
}

#[test]
fn test_build_provisions_every_address() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let keys = vec![local(dir.path(), "a"), local(dir.path(), "b"), local(dir.path(), "c")];

    let generation = build(1, &keys, &empty(&provisioner), &provisioner);

    assert_eq!(generation.len(), 3);
    assert_eq!(generation.bucket_count(), 4);
    assert!(generation.chains_are_consistent());
    assert_eq!(generation.stats().provisioned, 3);
    for key in &keys {
        let socket = handle(&generation, key);
        assert_eq!(socket.family().unwrap(), libc::AF_UNIX);
        assert!(is_bound(key.path().unwrap()));
    }
    assert_eq!(generation.keys().collect::<Vec<_>>(), keys);
}

#[test]
fn test_carry_forward_keeps_handle_identity() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let keys = vec![local(dir.path(), "a"), local(dir.path(), "b")];

    let first = build(1, &keys, &empty(&provisioner), &provisioner);
    let second = build(2, &keys, &first, &provisioner);

    assert_eq!(provisioner.bound(), 2);
    assert_eq!(second.stats().carried, 2);
    for key in &keys {
        assert!(Arc::ptr_eq(&handle(&first, key), &handle(&second, key)));
    }
}

#[test]
fn test_failed_provision_leaves_entry_absent() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let keys = vec![local(dir.path(), "a"), local(dir.path(), "b"), local(dir.path(), "c")];
    provisioner.fail_bind(&keys[1], libc::EACCES);

    let generation = build(1, &keys, &empty(&provisioner), &provisioner);

    assert_eq!(generation.len(), 3);
    assert_eq!(generation.stats().failed, 1);
    assert!(matches!(generation.lookup(&keys[0], false), Lookup::Bound(_)));
    assert!(matches!(generation.lookup(&keys[1], false), Lookup::Absent));
    assert!(matches!(generation.lookup(&keys[2], false), Lookup::Bound(_)));
    assert!(generation.has_absent());
    // the socket created for the failed bind was closed again
    assert_eq!(provisioner.opened(), 3);
    assert_eq!(provisioner.bound(), 2);
}

#[test]
fn test_absent_entry_is_retried_by_next_build() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let keys = vec![local(dir.path(), "a"), local(dir.path(), "b")];
    provisioner.fail_bind(&keys[1], libc::EACCES);
    let first = build(1, &keys, &empty(&provisioner), &provisioner);

    provisioner.heal(&keys[1]);
    let second = build(2, &keys, &first, &provisioner);

    assert!(matches!(second.lookup(&keys[1], false), Lookup::Bound(_)));
    assert_eq!(second.stats().carried, 1);
    assert_eq!(second.stats().provisioned, 1);
    assert!(!second.has_absent());
}

#[test]
fn test_duplicate_lines_share_one_entry() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let b = local(dir.path(), "b");

    let generation = build(1, &[a.clone(), b.clone(), a.clone()], &empty(&provisioner), &provisioner);

    assert_eq!(generation.len(), 2);
    assert_eq!(generation.stats().duplicates, 1);
    assert_eq!(provisioner.bound(), 2);
    assert!(matches!(generation.lookup(&a, false), Lookup::Bound(_)));
    let lines: Vec<_> = generation.lines().collect();
    assert_eq!(lines, vec![(a, 3), (b, 2)]);
}

#[test]
fn test_cancelled_before_start() {
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = Generation::build(
        1,
        &numbered(&[local(dir.path(), "a")]),
        &empty(&provisioner),
        provisioner.clone(),
        &cancel,
    );

    assert_eq!(result.unwrap_err(), BuildCancelled);
    assert_eq!(provisioner.opened(), 0);
}

/// Cancels the token after a fixed number of successful binds
struct CancelAfter {
    remaining: AtomicUsize,
    cancel: CancellationToken,
}

impl Provision for CancelAfter {
    fn open(&self, key: &AddressKey) -> Result<OwnedFd, ProvisionError> {
        SystemProvisioner.open(key)
    }

    fn bind(&self, fd: &OwnedFd, key: &AddressKey) -> Result<(), ProvisionError> {
        SystemProvisioner.bind(fd, key)?;
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.cancel.cancel();
        }
        Ok(())
    }
}

#[test]
fn test_cancel_mid_build_releases_only_new_sockets() {
    let dir = tempfile::tempdir().unwrap();
    let scripted = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let b = local(dir.path(), "b");
    let c = local(dir.path(), "c");
    let first = build(1, &[a.clone()], &empty(&scripted), &scripted);

    let cancel = CancellationToken::new();
    let provisioner = Arc::new(CancelAfter {
        remaining: AtomicUsize::new(1),
        cancel: cancel.clone(),
    });
    let result = Generation::build(2, &numbered(&[a.clone(), b.clone(), c.clone()]), &first, provisioner, &cancel);

    assert!(result.is_err());
    // a was carried, not provisioned, and still belongs to the published generation
    assert!(is_bound(a.path().unwrap()));
    assert!(matches!(first.lookup(&a, false), Lookup::Bound(_)));
    // b was provisioned for the cancelled build and released with it, file and all
    assert!(!is_bound(b.path().unwrap()));
    assert!(!b.path().unwrap().exists());
    assert!(!c.path().unwrap().exists());
}

#[test]
fn test_retire_releases_only_dropped_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let b = local(dir.path(), "b");
    let c = local(dir.path(), "c");

    let first = build(1, &[a.clone(), b.clone()], &empty(&provisioner), &provisioner);
    let a_handle = Arc::downgrade(&handle(&first, &a));
    let b_handle = Arc::downgrade(&handle(&first, &b));
    let second = build(2, &[a.clone(), c.clone()], &first, &provisioner);

    assert!(b_handle.upgrade().is_some());
    assert_eq!(first.retire(&second), 1);

    assert!(b_handle.upgrade().is_none());
    assert!(!is_bound(b.path().unwrap()));
    assert!(!b.path().unwrap().exists());
    assert!(Arc::ptr_eq(&a_handle.upgrade().unwrap(), &handle(&second, &a)));
    assert!(is_bound(a.path().unwrap()));
    assert!(is_bound(c.path().unwrap()));
}

#[test]
fn test_previous_back_reference() {
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let zero = empty(&provisioner);
    let first = build(1, &[], &zero, &provisioner);

    assert!(Arc::ptr_eq(&first.take_previous().unwrap(), &zero));
    assert!(first.take_previous().is_none());
    assert!(zero.take_previous().is_none());
}

#[test]
fn test_rebind_replaces_handle() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let generation = build(1, &[a.clone()], &empty(&provisioner), &provisioner);
    let old = Arc::downgrade(&handle(&generation, &a));

    let fresh = generation.lookup(&a, true).into_handle().unwrap();

    assert!(old.upgrade().is_none());
    assert!(Arc::ptr_eq(&fresh, &handle(&generation, &a)));
    assert_eq!(fresh.socket_type().unwrap(), libc::SOCK_DGRAM);
    assert!(is_bound(a.path().unwrap()));
    assert!(generation.chains_are_consistent());
}

#[test]
fn test_rebind_failure_keeps_previous_handle() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let generation = build(1, &[a.clone()], &empty(&provisioner), &provisioner);
    let old = handle(&generation, &a);

    provisioner.fail_open(&a, libc::EMFILE);
    assert!(Arc::ptr_eq(&generation.lookup(&a, true).into_handle().unwrap(), &old));

    provisioner.heal(&a);
    provisioner.fail_bind(&a, libc::EACCES);
    assert!(Arc::ptr_eq(&generation.lookup(&a, true).into_handle().unwrap(), &old));
    assert!(Arc::ptr_eq(&handle(&generation, &a), &old));
}

#[test]
fn test_rebind_gap_after_releasing_previous_handle() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let generation = build(1, &[a.clone()], &empty(&provisioner), &provisioner);
    let old = Arc::downgrade(&handle(&generation, &a));

    provisioner.fail_bind(&a, libc::EADDRINUSE);
    assert!(matches!(generation.lookup(&a, true), Lookup::Absent));
    assert!(matches!(generation.lookup(&a, false), Lookup::Absent));
    assert!(old.upgrade().is_none());

    provisioner.heal(&a);
    assert!(matches!(generation.lookup(&a, true), Lookup::Bound(_)));
}

#[test]
fn test_rebind_listening_inet_socket() {
    let port = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let key = AddressKey::from_socket_addr(
        SocketType::Stream,
        libc::IPPROTO_TCP,
        SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
    );
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let generation = build(1, &[key.clone()], &empty(&provisioner), &provisioner);

    // a client put the reserved socket into listening state and went away
    let listening = handle(&generation, &key);
    assert_eq!(unsafe { libc::listen(listening.as_raw_fd(), 1) }, 0);
    let old = Arc::downgrade(&listening);
    drop(listening);

    let fresh = generation.lookup(&key, true).into_handle().unwrap();

    assert!(old.upgrade().is_none());
    assert!(Arc::ptr_eq(&fresh, &handle(&generation, &key)));
    let listener = std::net::TcpListener::from(fresh.try_clone_fd().unwrap());
    assert_eq!(listener.local_addr().unwrap().port(), port);
}

#[test]
fn test_rebind_absent_entry_clears_leftover_socket_file() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");

    // a socket file left behind by a descriptor nobody tracks
    let fd = SystemProvisioner.open(&a).unwrap();
    SystemProvisioner.bind(&fd, &a).unwrap();
    drop(fd);

    let generation = build(1, &[a.clone()], &empty(&provisioner), &provisioner);
    assert!(matches!(generation.lookup(&a, false), Lookup::Absent));

    assert!(matches!(generation.lookup(&a, true), Lookup::Bound(_)));
    assert!(is_bound(a.path().unwrap()));
}

#[test]
fn test_concurrent_rebinds_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Arc::new(ScriptedProvisioner::new());
    let a = local(dir.path(), "a");
    let generation = build(1, &[a.clone()], &empty(&provisioner), &provisioner);
    let bound_before = provisioner.bound();

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            let generation = generation.clone();
            let barrier = barrier.clone();
            let a = a.clone();
            std::thread::spawn(move || {
                barrier.wait();
                generation.lookup(&a, true).into_handle()
            })
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().unwrap().unwrap())
        .collect();

    let distinct: HashSet<_> = results.iter().map(|h| Arc::as_ptr(h) as usize).collect();
    assert_eq!(distinct.len(), provisioner.bound() - bound_before);
    let current = handle(&generation, &a);
    assert!(results.iter().any(|h| Arc::ptr_eq(h, &current)));
}

/// Provisioner that never produces a socket
struct Unavailable;

impl Provision for Unavailable {
    fn open(&self, _key: &AddressKey) -> Result<OwnedFd, ProvisionError> {
        Err(ProvisionError::new(
            ProvisionStep::Create,
            io::Error::from_raw_os_error(libc::EAFNOSUPPORT),
        ))
    }

    fn bind(&self, _fd: &OwnedFd, _key: &AddressKey) -> Result<(), ProvisionError> {
        unreachable!("open never succeeds")
    }
}

fn inet_key(ip: u32, port: u16, stream: bool) -> AddressKey {
    let addr = SocketAddr::from((Ipv4Addr::from(ip), port));
    if stream {
        AddressKey::from_socket_addr(SocketType::Stream, libc::IPPROTO_TCP, addr)
    } else {
        AddressKey::from_socket_addr(SocketType::Datagram, libc::IPPROTO_UDP, addr)
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every configured key is reachable from its bucket and keys are unique
    #[test]
    fn chains_cover_every_key(
        raw in prop::collection::vec((0u32..8, 0u16..8, any::<bool>()), 0..64)
    ) {
        let keys: Vec<_> = raw.iter().map(|&(ip, port, stream)| inet_key(ip, port, stream)).collect();
        let zero = Arc::new(Generation::empty(Arc::new(Unavailable)));
        let generation = Generation::build(1, &numbered(&keys), &zero, Arc::new(Unavailable), &CancellationToken::new()).unwrap();

        let distinct: HashSet<_> = keys.iter().cloned().collect();
        prop_assert_eq!(generation.len(), distinct.len());
        prop_assert!(generation.bucket_count().is_power_of_two());
        prop_assert!(generation.bucket_count() >= generation.len());
        prop_assert!(generation.chains_are_consistent());
        for key in &keys {
            prop_assert!(matches!(generation.lookup(key, false), Lookup::Absent));
        }
        let stored: HashSet<_> = generation.keys().collect();
        prop_assert_eq!(stored, distinct);
    }
}
