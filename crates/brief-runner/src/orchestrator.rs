use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use brief_core::{
    evaluate, ArtifactKind, Digest, FreshnessState, HolderId, InvocationId, ProducerError, QueryContext,
    RefreshRecord, DEFAULT_TTL,
};
use brief_storage::{ArtifactStore, Ledger, RefreshLease, StorageError, StorageResult};
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

use crate::producer::Producer;

/// Extra lease lifetime beyond the producer timeout, so a lease never expires
/// while its holder is still persisting.
const LEASE_MARGIN_SECS: i64 = 30;

/// How long a timed-out invocation waits for the producer to stop its own
/// work before the lease is released.
const STOP_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefreshPolicy {
    pub ttl: Duration,
    pub producer_timeout: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL, producer_timeout: Duration::from_secs(60) }
    }
}

/// States an invocation passes through, recorded in order on the report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Start,
    Evaluating,
    Producing,
    Degraded,
    Reading,
    Done,
    Unavailable,
}

/// Where the served digest came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    Produced,
    Cached,
    /// A refresh was attempted and failed; this is the last good digest.
    Degraded(ProducerError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Done { digest: Digest, origin: Origin },
    /// Nothing was ever stored and nothing could be produced.
    Unavailable { missing: ArtifactKind, cause: Option<ProducerError> },
}

impl RefreshOutcome {
    pub fn digest(&self) -> Option<&Digest> {
        match self {
            RefreshOutcome::Done { digest, .. } => Some(digest),
            RefreshOutcome::Unavailable { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RefreshReport {
    pub invocation: InvocationId,
    pub now_unix: i64,
    pub freshness: FreshnessState,
    pub producer_invoked: bool,
    pub phases: Vec<Phase>,
    pub outcome: RefreshOutcome,
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// The producer succeeded but the result could not be made durable. The
    /// digest is still returned so the caller can show it.
    #[error("refreshed digest could not be persisted: {source}")]
    Persist {
        digest: Digest,
        #[source]
        source: StorageError,
    },
    #[error("cached artifacts could not be read: {0}")]
    Read(#[source] StorageError),
}

/// Serves the cached digest and refreshes it when it goes stale.
///
/// Producing is single-flight: an in-process gate serializes callers and a
/// storage lease keeps other processes out; both re-check freshness once held.
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ArtifactStore>,
    lease: Arc<dyn RefreshLease>,
    producer: Arc<dyn Producer>,
    policy: RefreshPolicy,
    holder: HolderId,
    gate: Mutex<()>,
}

impl Orchestrator {
    pub fn new<B>(backend: Arc<B>, producer: Arc<dyn Producer>, policy: RefreshPolicy) -> Self
    where
        B: Ledger + ArtifactStore + RefreshLease + 'static,
    {
        Self::from_parts(backend.clone(), backend.clone(), backend, producer, policy)
    }

    pub fn from_parts(
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ArtifactStore>,
        lease: Arc<dyn RefreshLease>,
        producer: Arc<dyn Producer>,
        policy: RefreshPolicy,
    ) -> Self {
        Self {
            ledger,
            store,
            lease,
            producer,
            policy,
            holder: HolderId::from_str(format!("pid{}-{}", std::process::id(), HolderId::new())),
            gate: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &RefreshPolicy {
        &self.policy
    }

    pub fn ledger(&self) -> &dyn Ledger {
        self.ledger.as_ref()
    }

    /// Runs one invocation. `ctx.as_of_unix` is the invocation's notion of now.
    pub fn refresh(&self, ctx: &QueryContext) -> Result<RefreshReport, RefreshError> {
        let invocation = InvocationId::new();
        let span = info_span!("refresh", invocation = %invocation);
        let _enter = span.enter();

        let now = ctx.as_of_unix;
        let mut phases = vec![Phase::Start, Phase::Evaluating];
        let (_, freshness) = self.evaluate(now);
        debug!(?freshness, "evaluated");

        let mut producer_invoked = false;
        let mut failure = None;

        if freshness.should_refresh {
            let _gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            match self.claim_lease(now) {
                Some(_lease) => {
                    let (last, recheck) = self.evaluate(now);
                    if recheck.should_refresh {
                        phases.push(Phase::Producing);
                        producer_invoked = true;
                        match self.produce(ctx) {
                            Ok(digest) => {
                                self.persist(&digest, last, now)?;
                                phases.push(Phase::Done);
                                info!(fingerprint = %digest.fingerprint(), "refreshed");
                                return Ok(RefreshReport {
                                    invocation,
                                    now_unix: now,
                                    freshness,
                                    producer_invoked,
                                    phases,
                                    outcome: RefreshOutcome::Done { digest, origin: Origin::Produced },
                                });
                            }
                            Err(e) => {
                                warn!("producer failed, serving last good artifacts: {e}");
                                phases.push(Phase::Degraded);
                                failure = Some(e);
                            }
                        }
                    } else {
                        info!("refreshed by a concurrent invocation; reading");
                    }
                }
                None => info!("refresh already in flight elsewhere; reading"),
            }
        }

        phases.push(Phase::Reading);
        let outcome = match self.read_digest() {
            Ok(digest) => {
                phases.push(Phase::Done);
                let origin = match failure {
                    Some(e) => Origin::Degraded(e),
                    None => Origin::Cached,
                };
                RefreshOutcome::Done { digest, origin }
            }
            Err(StorageError::NotFound(missing)) => {
                phases.push(Phase::Unavailable);
                warn!("no {} stored and none produced; nothing to serve", missing);
                RefreshOutcome::Unavailable { missing, cause: failure }
            }
            Err(e) => return Err(RefreshError::Read(e)),
        };

        Ok(RefreshReport { invocation, now_unix: now, freshness, producer_invoked, phases, outcome })
    }

    /// Current stored digest without any freshness decision.
    pub fn read_digest(&self) -> StorageResult<Digest> {
        let summary = self.store.read(ArtifactKind::Summary)?;
        let sentiment = self.store.read(ArtifactKind::Sentiment)?;
        Digest::from_payloads(summary, &sentiment)
            .map_err(|e| StorageError::Io(anyhow::anyhow!("stored sentiment is unreadable: {e}")))
    }

    /// Freshness as of `now_unix`, for status displays.
    pub fn freshness(&self, now_unix: i64) -> StorageResult<(Option<i64>, FreshnessState)> {
        let last = self.ledger.last_timestamp()?;
        Ok((last, evaluate(last, now_unix, self.policy.ttl)))
    }

    // An unreadable ledger counts as fresh; the stored digest is served.
    fn evaluate(&self, now: i64) -> (Option<i64>, FreshnessState) {
        match self.freshness(now) {
            Ok(v) => v,
            Err(e) => {
                warn!("ledger unreadable, skipping refresh: {e}");
                (None, FreshnessState { is_first_run: false, should_refresh: false })
            }
        }
    }

    fn claim_lease(&self, now: i64) -> Option<LeaseGuard<'_>> {
        let ttl = self.policy.producer_timeout.as_secs() as i64 + LEASE_MARGIN_SECS;
        match self.lease.try_acquire(self.holder.as_str(), now, ttl) {
            Ok(true) => Some(LeaseGuard { lease: self.lease.as_ref(), holder: self.holder.as_str() }),
            Ok(false) => None,
            Err(e) => {
                warn!("refresh lease unavailable: {e}");
                None
            }
        }
    }

    fn produce(&self, ctx: &QueryContext) -> Result<Digest, ProducerError> {
        let digest = call_with_timeout(self.producer.clone(), ctx.clone(), self.policy.producer_timeout)?;
        digest.validate()?;
        Ok(digest)
    }

    fn persist(&self, digest: &Digest, last: Option<i64>, now: i64) -> Result<(), RefreshError> {
        let fail = |source| RefreshError::Persist { digest: digest.clone(), source };
        for artifact in digest.artifacts() {
            self.store.write(artifact.kind, &artifact.payload).map_err(fail)?;
        }
        // freshness reads the newest record by insertion order, so a rollback
        // entry written here supersedes the future-dated one
        if let Some(last) = last.filter(|&last| last > now) {
            warn!("clock is behind the ledger ({last} > {now}); recording {now}");
        }
        self.ledger.append(RefreshRecord { timestamp_unix: now }).map_err(fail)?;
        Ok(())
    }
}

/// Releases the refresh lease on every exit path.
struct LeaseGuard<'a> {
    lease: &'a dyn RefreshLease,
    holder: &'a str,
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.lease.release(self.holder) {
            warn!("failed to release refresh lease: {e}");
        }
    }
}

/// Runs the producer on its own thread and gives up after `timeout`. The
/// producer is handed the same deadline; one that honours it has stopped by the
/// time this returns, one that does not keeps running detached with its result
/// dropped.
fn call_with_timeout(
    producer: Arc<dyn Producer>,
    ctx: QueryContext,
    timeout: Duration,
) -> Result<Digest, ProducerError> {
    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("brief-producer".into())
        .spawn(move || {
            let _ = tx.send(producer.produce(&ctx, deadline));
        })
        .map_err(|e| ProducerError::Upstream(format!("spawn producer thread: {e}")))?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => {
            if rx.recv_timeout(STOP_GRACE).is_err() {
                warn!("producer still running {STOP_GRACE:?} past its deadline; detaching");
            }
            Err(ProducerError::Timeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(ProducerError::Upstream("producer panicked".into())),
    }
}
