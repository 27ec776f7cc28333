use super::{ReloadConfig, ReloadError, ReloadOutcome, ReloadPhase, scan};
use crate::address::{AddressKey, AddressSpec, parse_line};
use crate::common::Provision;
use crate::provision::SystemProvisioner;
use crate::table::{Generation, Lookup, Reservation};
use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

/// Owner of the published reservation table
///
/// Lookups read the current generation without locking. Reloads are
/// single-writer: a reload started while another is running is rejected with
/// [`ReloadError::Race`].
pub struct Reservations {
    current: ArcSwap<Generation>,
    provisioner: Arc<dyn Provision>,
    config: ReloadConfig,
    reload_lock: Arc<Mutex<()>>,
    phase: Arc<AtomicU8>,
}

impl Reservations {
    /// Creates the coordinator with the empty startup generation
    pub fn new(config: ReloadConfig) -> Self {
        Self::with_provisioner(config, Arc::new(SystemProvisioner))
    }

    pub fn with_provisioner(config: ReloadConfig, provisioner: Arc<dyn Provision>) -> Self {
        let empty = Generation::empty(Arc::clone(&provisioner));
        Self {
            current: ArcSwap::from_pointee(empty),
            provisioner,
            config,
            reload_lock: Arc::new(Mutex::new(())),
            phase: Arc::new(AtomicU8::new(ReloadPhase::Idle as u8)),
        }
    }

    pub fn config(&self) -> &ReloadConfig {
        &self.config
    }

    /// Snapshot of the published generation
    pub fn current(&self) -> Arc<Generation> {
        self.current.load_full()
    }

    pub fn phase(&self) -> ReloadPhase {
        ReloadPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Looks up the socket reserved for `spec`
    ///
    /// A `rebind` flag on the request forces a rebind just like `force_rebind`.
    pub fn lookup(&self, spec: &AddressSpec, force_rebind: bool) -> Lookup {
        self.lookup_key(spec.key(), force_rebind || spec.force_rebind)
    }

    pub fn lookup_key(&self, key: &AddressKey, force_rebind: bool) -> Lookup {
        if force_rebind {
            // rebinding does syscalls; hold a full reference, not a borrowed slot
            self.current.load_full().lookup(key, true)
        } else {
            self.current.load().lookup(key, false)
        }
    }

    /// Parses a request line and looks it up
    pub fn lookup_line(&self, text: &str) -> crate::Result<Lookup> {
        let spec = parse_line(text)?;
        Ok(self.lookup(&spec, false))
    }

    /// Rescans the reservation file and publishes the result
    ///
    /// Cancelling `cancel` before the new generation is published aborts the
    /// reload and releases every socket provisioned for it. Once published,
    /// the reload always runs its quiescence delay and retirement to the end.
    pub async fn reload(&self, cancel: &CancellationToken) -> Result<ReloadOutcome, ReloadError> {
        let Ok(exclusive) = Arc::clone(&self.reload_lock).try_lock_owned() else {
            warn!(path = %self.config.path.display(), "Reload already in progress, rejecting");
            return Err(ReloadError::Race);
        };

        let previous = self.current.load_full();
        let span = tracing::info_span!("reload", generation = previous.id() + 1);
        self.reload_exclusive(exclusive, previous, cancel)
            .instrument(span)
            .await
    }

    async fn reload_exclusive(
        &self,
        exclusive: OwnedMutexGuard<()>,
        previous: Arc<Generation>,
        cancel: &CancellationToken,
    ) -> Result<ReloadOutcome, ReloadError> {
        let _phase = PhaseGuard::enter(&self.phase, ReloadPhase::Scanning);

        // finish a retirement an earlier, interrupted reload never got to
        if let Some(stale) = previous.take_previous() {
            stale.retire(&previous);
        }

        let build_cancel = cancel.child_token();
        // dropping this future mid-build cancels the blocking build too
        let abort_on_drop = build_cancel.clone().drop_guard();
        let prepared = {
            let config = self.config.clone();
            let previous = Arc::clone(&previous);
            let provisioner = Arc::clone(&self.provisioner);
            let phase = Arc::clone(&self.phase);
            // the blocking work owns the writer lock, so a dropped reload
            // stays exclusive until its build has actually stopped
            tokio::task::spawn_blocking(move || {
                let prepared = prepare(&config, &previous, provisioner, &build_cancel, &phase);
                (exclusive, prepared)
            })
            .await
        };
        abort_on_drop.disarm();

        let (_exclusive, prepared) = match prepared {
            Ok(joined) => joined,
            Err(e) => {
                error!(error = %e, "Reload task failed, current table unchanged");
                return Err(e.into());
            }
        };
        let generation = match prepared {
            Ok(Some(generation)) => generation,
            Ok(None) => {
                info!(generation = previous.id(), "Reservations unchanged, keeping current table");
                return Ok(ReloadOutcome::Unchanged {
                    generation: previous.id(),
                });
            }
            Err(e) => {
                error!(error = %e, "Reload aborted, current table unchanged");
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            info!("Reload cancelled before publishing, releasing new sockets");
            return Err(ReloadError::Cancelled);
        }

        let generation = Arc::new(generation);
        self.current.store(Arc::clone(&generation));
        let stats = generation.stats();
        info!(
            generation = generation.id(),
            reserved = generation.len(),
            carried = stats.carried,
            provisioned = stats.provisioned,
            failed = stats.failed,
            "Published reservation table"
        );

        self.phase.store(ReloadPhase::Quiescing as u8, Ordering::SeqCst);
        tokio::time::sleep(self.config.quiescence).await;

        let released = generation
            .take_previous()
            .map(|old| old.retire(&generation))
            .unwrap_or(0);
        info!(released, "Retired previous generation");

        Ok(ReloadOutcome::Published {
            generation: generation.id(),
            reserved: generation.len(),
            stats,
            released,
        })
    }
}

impl std::fmt::Debug for Reservations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reservations")
            .field("current", &self.current.load_full())
            .field("config", &self.config)
            .field("phase", &self.phase())
            .finish()
    }
}

/// Scans and builds off the async runtime; `None` means nothing changed
fn prepare(
    config: &ReloadConfig,
    previous: &Arc<Generation>,
    provisioner: Arc<dyn Provision>,
    cancel: &CancellationToken,
    phase: &AtomicU8,
) -> Result<Option<Generation>, ReloadError> {
    let reservations = scan::scan(config)?;
    if is_unchanged(previous, &reservations) {
        return Ok(None);
    }

    if cancel.is_cancelled() {
        return Err(ReloadError::Cancelled);
    }
    phase.store(ReloadPhase::Building as u8, Ordering::SeqCst);
    Generation::build(previous.id() + 1, &reservations, previous, provisioner, cancel)
        .map(Some)
        .map_err(|_| ReloadError::Cancelled)
}

/// Same address set as `previous`, with every entry holding a socket
fn is_unchanged(previous: &Generation, reservations: &[Reservation]) -> bool {
    if previous.has_absent() {
        return false;
    }
    let mut distinct = HashSet::with_capacity(reservations.len());
    for reservation in reservations {
        if !previous.contains(&reservation.key) {
            return false;
        }
        distinct.insert(&reservation.key);
    }
    distinct.len() == previous.len()
}

/// Resets the published phase to idle however the reload ends
struct PhaseGuard<'a> {
    phase: &'a AtomicU8,
}

impl<'a> PhaseGuard<'a> {
    fn enter(phase: &'a AtomicU8, start: ReloadPhase) -> Self {
        phase.store(start as u8, Ordering::SeqCst);
        Self { phase }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        self.phase.store(ReloadPhase::Idle as u8, Ordering::SeqCst);
    }
}

/// Requests reloads from the task started by [`spawn_reloader`]
#[derive(Debug, Clone)]
pub struct ReloadTrigger {
    tx: mpsc::Sender<()>,
}

impl ReloadTrigger {
    /// Queues a reload
    ///
    /// Returns false if a reload is already queued (the requests coalesce)
    /// or the reloader has stopped.
    pub fn trigger_reload(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

/// Starts the task that runs reloads one at a time until `shutdown` fires
///
/// Shutdown also cancels a reload in progress, provided it has not
/// published yet.
pub fn spawn_reloader(
    reservations: Arc<Reservations>,
    shutdown: CancellationToken,
) -> (ReloadTrigger, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(1);

    let handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                request = rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                    match reservations.reload(&shutdown).await {
                        Ok(outcome) => info!(?outcome, "Reload finished"),
                        Err(e) => error!(error = %e, "Reload failed"),
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping reloader");
                    break;
                }
            }
        }
        info!("Reloader stopped");
    });

    (ReloadTrigger { tx }, handle)
}
