use super::{BuildCancelled, BuildStats, Lookup, Reservation, rebind};
use crate::address::{AddressKey, Family, SocketType};
use crate::common::Provision;
use crate::provision::{ReservedSocket, SocketHandle};
use arc_swap::ArcSwapOption;
use std::fmt;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One reserved address inside a generation
///
/// Everything but `handle` is fixed once the generation is built.
pub(crate) struct Entry {
    family: Family,
    socket_type: SocketType,
    protocol: libc::c_int,
    addr: Range<usize>,
    line: usize,
    next: Option<usize>,
    pub(crate) handle: ArcSwapOption<ReservedSocket>,
    pub(crate) rebind_lock: Mutex<()>,
}

impl Entry {
    fn matches(&self, key: &AddressKey, bytes: &[u8]) -> bool {
        key.matches(
            self.family,
            self.socket_type,
            self.protocol,
            &bytes[self.addr.clone()],
        )
    }
}

/// One immutable snapshot of the reservation table
///
/// Buckets hold the index of the first entry of their chain; entries link to
/// the next entry of the same bucket. The bucket count is a power of two so
/// `hash & (buckets - 1)` selects a bucket.
pub struct Generation {
    id: u64,
    buckets: Box<[Option<usize>]>,
    entries: Box<[Entry]>,
    addr_bytes: Box<[u8]>,
    stats: BuildStats,
    provisioner: Arc<dyn Provision>,
    previous: Mutex<Option<Arc<Generation>>>,
}

impl Generation {
    /// The generation in place before any configuration was loaded
    pub fn empty(provisioner: Arc<dyn Provision>) -> Self {
        Self {
            id: 0,
            buckets: vec![None].into_boxed_slice(),
            entries: Box::new([]),
            addr_bytes: Box::new([]),
            stats: BuildStats::default(),
            provisioner,
            previous: Mutex::new(None),
        }
    }

    /// Builds the successor of `previous` from configured reservations
    ///
    /// Addresses already held by `previous` carry their handle forward; the
    /// rest are provisioned. A failed provision leaves that entry absent and
    /// the build continues. Lines repeating an address collapse into the
    /// entry created by the first of them.
    ///
    /// If `cancel` fires, the partially built generation is dropped, which
    /// closes the sockets provisioned for it and nothing else.
    pub fn build(
        id: u64,
        reservations: &[Reservation],
        previous: &Arc<Generation>,
        provisioner: Arc<dyn Provision>,
        cancel: &CancellationToken,
    ) -> Result<Generation, BuildCancelled> {
        let bucket_count = reservations.len().next_power_of_two();
        let mut buckets = vec![None; bucket_count];
        let mut entries: Vec<Entry> = Vec::with_capacity(reservations.len());
        let byte_len = reservations.iter().map(|r| r.key.as_bytes().len()).sum();
        let mut addr_bytes: Vec<u8> = Vec::with_capacity(byte_len);
        let mut stats = BuildStats::default();

        for reservation in reservations {
            if cancel.is_cancelled() {
                info!(
                    generation = id,
                    provisioned = stats.provisioned,
                    "Build cancelled, releasing sockets provisioned so far"
                );
                return Err(BuildCancelled);
            }

            let key = &reservation.key;
            let bucket = (key.bucket_hash() as usize) & (bucket_count - 1);

            if let Some(index) = find_in(&buckets, &entries, &addr_bytes, key) {
                let entry = &mut entries[index];
                warn!(
                    address = %key,
                    line = reservation.line,
                    first_line = entry.line,
                    "Duplicate reservation, sharing the earlier entry"
                );
                entry.line = reservation.line;
                stats.duplicates += 1;
                continue;
            }

            let handle = match previous.held(key) {
                Some(handle) => {
                    debug!(address = %key, line = reservation.line, "Carrying reservation forward");
                    stats.carried += 1;
                    Some(handle)
                }
                None => match provisioner.provision(key) {
                    Ok(socket) => {
                        info!(address = %key, line = reservation.line, "Reserved address");
                        stats.provisioned += 1;
                        Some(Arc::new(socket))
                    }
                    Err(e) => {
                        warn!(
                            address = %key,
                            line = reservation.line,
                            step = %e.step,
                            os_error = e.raw_os_error(),
                            error = %e,
                            "Skipping reservation"
                        );
                        stats.failed += 1;
                        None
                    }
                },
            };

            let start = addr_bytes.len();
            addr_bytes.extend_from_slice(key.as_bytes());
            entries.push(Entry {
                family: key.family(),
                socket_type: key.socket_type(),
                protocol: key.protocol(),
                addr: start..addr_bytes.len(),
                line: reservation.line,
                next: buckets[bucket],
                handle: ArcSwapOption::new(handle),
                rebind_lock: Mutex::new(()),
            });
            buckets[bucket] = Some(entries.len() - 1);
        }

        Ok(Self {
            id,
            buckets: buckets.into_boxed_slice(),
            entries: entries.into_boxed_slice(),
            addr_bytes: addr_bytes.into_boxed_slice(),
            stats,
            provisioner,
            previous: Mutex::new(Some(Arc::clone(previous))),
        })
    }

    /// Looks up the handle reserved for `key`
    ///
    /// With `force_rebind` the entry's socket is replaced first; see
    /// [`crate::table::rebind`]. Without it the lookup never blocks and never
    /// allocates.
    pub fn lookup(&self, key: &AddressKey, force_rebind: bool) -> Lookup {
        let Some(index) = self.find(key) else {
            return Lookup::NotFound;
        };
        let entry = &self.entries[index];
        let handle = if force_rebind {
            rebind::rebind(entry, key, self.provisioner.as_ref())
        } else {
            entry.handle.load_full()
        };
        match handle {
            Some(handle) => Lookup::Bound(handle),
            None => Lookup::Absent,
        }
    }

    /// Handle currently held for `key`, if any
    pub fn held(&self, key: &AddressKey) -> Option<SocketHandle> {
        self.find(key)
            .and_then(|index| self.entries[index].handle.load_full())
    }

    pub fn contains(&self, key: &AddressKey) -> bool {
        self.find(key).is_some()
    }

    fn find(&self, key: &AddressKey) -> Option<usize> {
        find_in(&self.buckets, &self.entries, &self.addr_bytes, key)
    }

    /// Sequence number of this generation; 0 is the empty startup table
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Counters recorded while this generation was built
    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    /// Keys of all entries, in configuration order
    pub fn keys(&self) -> impl Iterator<Item = AddressKey> + '_ {
        self.entries.iter().map(|entry| self.key_of(entry))
    }

    /// Configuration line each key was last seen on
    pub fn lines(&self) -> impl Iterator<Item = (AddressKey, usize)> + '_ {
        self.entries
            .iter()
            .map(|entry| (self.key_of(entry), entry.line))
    }

    /// Returns true if any entry has no handle
    pub fn has_absent(&self) -> bool {
        self.entries
            .iter()
            .any(|entry| entry.handle.load().is_none())
    }

    fn key_of(&self, entry: &Entry) -> AddressKey {
        AddressKey::from_parts(
            entry.family,
            entry.socket_type,
            entry.protocol,
            &self.addr_bytes[entry.addr.clone()],
        )
    }

    /// Retires this generation in favour of `successor`
    ///
    /// Handles of addresses the successor no longer reserves are released
    /// here; carried-forward handles are shared with the successor and stay
    /// open. Returns how many handles were released.
    pub(crate) fn retire(&self, successor: &Generation) -> usize {
        let mut released = 0;
        for entry in self.entries.iter() {
            let key = self.key_of(entry);
            if successor.contains(&key) {
                continue;
            }
            if entry.handle.swap(None).is_some() {
                info!(address = %key, generation = self.id, "Released reservation");
                released += 1;
            }
        }
        released
    }

    /// Detaches the back-reference to the generation this one replaced
    pub(crate) fn take_previous(&self) -> Option<Arc<Generation>> {
        self.previous
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Walks every bucket chain and checks each entry sits in the right one
    #[cfg(test)]
    pub(crate) fn chains_are_consistent(&self) -> bool {
        let mut seen = vec![false; self.entries.len()];
        for (bucket, head) in self.buckets.iter().enumerate() {
            let mut cursor = *head;
            while let Some(index) = cursor {
                let entry = &self.entries[index];
                let hash = self.key_of(entry).bucket_hash() as usize;
                if seen[index] || hash & (self.buckets.len() - 1) != bucket {
                    return false;
                }
                seen[index] = true;
                cursor = entry.next;
            }
        }
        self.buckets.len().is_power_of_two() && seen.iter().all(|s| *s)
    }
}

fn find_in(
    buckets: &[Option<usize>],
    entries: &[Entry],
    addr_bytes: &[u8],
    key: &AddressKey,
) -> Option<usize> {
    let mut cursor = buckets[(key.bucket_hash() as usize) & (buckets.len() - 1)];
    while let Some(index) = cursor {
        let entry = &entries[index];
        if entry.matches(key, addr_bytes) {
            return Some(index);
        }
        cursor = entry.next;
    }
    None
}

impl fmt::Debug for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Generation")
            .field("id", &self.id)
            .field("entries", &self.entries.len())
            .field("buckets", &self.buckets.len())
            .field("stats", &self.stats)
            .finish()
    }
}
