//! Lease arbitration between competing work sources.
//!
//! Every [`LeaseSource`] is asked for work concurrently. The first source to
//! produce a lease wins and is returned straight away; the others see the
//! shared cancellation signal, and a background task releases any lease they
//! still hand out.

mod queue;

pub use queue::{QueueLeaseSource, WorkItem};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::agents::Agent;
use crate::error::CoordinatorResult;
use crate::leases::NewLease;

type SourceOutcome = (usize, CoordinatorResult<Option<NewLease>>);

/// Something that can hand out work for an agent.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a lease for `agent`, or `None` if there is nothing it can run.
    ///
    /// `cancel` flips to `true` once another source has won. Implementations
    /// should stop early when they see it.
    async fn assign(
        &self,
        agent: &Agent,
        cancel: watch::Receiver<bool>,
    ) -> CoordinatorResult<Option<NewLease>>;

    /// Take back a lease that was handed out but never attached.
    async fn release(&self, lease: NewLease);

    /// The lease was attached to a session and will not be released.
    async fn commit(&self, _lease: &NewLease) {}
}

/// A lease won by one of the arbiter's sources.
#[derive(Debug, Clone)]
pub struct LeaseGrant {
    source: usize,
    pub lease: NewLease,
}

/// Races lease sources against each other.
#[derive(Clone, Default)]
pub struct LeaseArbiter {
    sources: Vec<Arc<dyn LeaseSource>>,
    poll_interval: Option<Duration>,
}

impl LeaseArbiter {
    pub fn new(sources: Vec<Arc<dyn LeaseSource>>) -> Self {
        Self {
            sources,
            poll_interval: None,
        }
    }

    /// Re-ask the sources at this interval while waiting for work, in
    /// addition to waking on session updates.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    pub fn source_name(&self, grant: &LeaseGrant) -> &str {
        self.sources
            .get(grant.source)
            .map(|s| s.name())
            .unwrap_or("unknown")
    }

    /// Ask every source for work; return the first lease produced.
    ///
    /// Source failures are logged and treated as "no work". Sources still
    /// running when a winner is found are drained in the background.
    #[instrument(skip_all, fields(agent_id = %agent.id()))]
    pub async fn assign(&self, agent: &Agent) -> Option<LeaseGrant> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut join_set: JoinSet<SourceOutcome> = JoinSet::new();
        for (index, source) in self.sources.iter().enumerate() {
            let source = Arc::clone(source);
            let agent = agent.clone();
            let cancel = cancel_rx.clone();
            join_set.spawn(async move { (index, source.assign(&agent, cancel).await) });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(Some(lease)))) => {
                    debug!(
                        source = self.sources[index].name(),
                        lease_id = %lease.id,
                        "Lease source won"
                    );
                    let _ = cancel_tx.send(true);
                    if !join_set.is_empty() {
                        tokio::spawn(release_losers(join_set, self.sources.clone(), cancel_tx));
                    }
                    return Some(LeaseGrant {
                        source: index,
                        lease,
                    });
                }
                Ok((_, Ok(None))) => {}
                Ok((index, Err(e))) => {
                    warn!(source = self.sources[index].name(), error = %e, "Lease source failed");
                }
                Err(e) => warn!(error = %e, "Lease source task failed"),
            }
        }
        None
    }

    /// Hand a grant back to the source that produced it.
    pub async fn release(&self, grant: LeaseGrant) {
        if let Some(source) = self.sources.get(grant.source) {
            source.release(grant.lease).await;
        }
    }

    pub async fn commit(&self, grant: &LeaseGrant) {
        if let Some(source) = self.sources.get(grant.source) {
            source.commit(&grant.lease).await;
        }
    }
}

/// Wait out the sources that lost a race and hand back whatever they
/// produced. Holding `_cancel` keeps the signal observable until they finish.
async fn release_losers(
    mut join_set: JoinSet<SourceOutcome>,
    sources: Vec<Arc<dyn LeaseSource>>,
    _cancel: watch::Sender<bool>,
) {
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((index, Ok(Some(lease)))) => {
                let source = &sources[index];
                debug!(source = source.name(), lease_id = %lease.id, "Releasing losing lease");
                source.release(lease).await;
            }
            Ok((_, Ok(None))) => {}
            Ok((index, Err(e))) => {
                warn!(source = sources[index].name(), error = %e, "Lease source failed");
            }
            Err(e) => warn!(error = %e, "Lease source task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use fleet_id::AgentId;

    use crate::db::AgentDocument;

    /// Hands out one lease after `delay`, counting releases.
    struct SlowSource {
        name: &'static str,
        delay: Duration,
        heeds_cancel: bool,
        released: AtomicUsize,
        saw_cancel: AtomicUsize,
    }

    impl SlowSource {
        fn new(name: &'static str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::from_millis(delay_ms),
                heeds_cancel: true,
                released: AtomicUsize::new(0),
                saw_cancel: AtomicUsize::new(0),
            })
        }

        fn stubborn(name: &'static str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                delay: Duration::from_millis(delay_ms),
                heeds_cancel: false,
                released: AtomicUsize::new(0),
                saw_cancel: AtomicUsize::new(0),
            })
        }
    }

    async fn wait_for_release(source: &SlowSource) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while source.released.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[async_trait]
    impl LeaseSource for SlowSource {
        fn name(&self) -> &str {
            self.name
        }

        async fn assign(
            &self,
            _agent: &Agent,
            mut cancel: watch::Receiver<bool>,
        ) -> CoordinatorResult<Option<NewLease>> {
            if self.heeds_cancel {
                tokio::select! {
                    _ = tokio::time::sleep(self.delay) => {}
                    _ = cancel.wait_for(|c| *c) => {
                        self.saw_cancel.fetch_add(1, Ordering::SeqCst);
                    }
                }
            } else {
                tokio::time::sleep(self.delay).await;
            }
            // Losers still produce work to exercise the release path.
            Ok(Some(NewLease::new(BTreeMap::new(), self.name.as_bytes().to_vec())))
        }

        async fn release(&self, _lease: NewLease) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn agent() -> Agent {
        Agent {
            document: AgentDocument::new(AgentId::parse("arb").unwrap(), false, Utc::now()),
            session: None,
        }
    }

    #[tokio::test]
    async fn test_first_source_wins_and_losers_are_released() {
        let fast = SlowSource::new("fast", 1);
        let slow = SlowSource::new("slow", 5_000);
        let arbiter = LeaseArbiter::new(vec![fast.clone() as Arc<dyn LeaseSource>, slow.clone()]);

        let grant = arbiter.assign(&agent()).await.unwrap();
        assert_eq!(grant.lease.payload, b"fast");
        assert_eq!(arbiter.source_name(&grant), "fast");
        wait_for_release(&slow).await;
        assert_eq!(slow.saw_cancel.load(Ordering::SeqCst), 1);
        assert_eq!(fast.released.load(Ordering::SeqCst), 0);

        arbiter.release(grant).await;
        assert_eq!(fast.released.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_winner_does_not_wait_for_stubborn_loser() {
        let fast = SlowSource::new("fast", 1);
        let stubborn = SlowSource::stubborn("stubborn", 300);
        let arbiter = LeaseArbiter::new(vec![fast as Arc<dyn LeaseSource>, stubborn.clone()]);

        let started = tokio::time::Instant::now();
        let grant = arbiter.assign(&agent()).await.unwrap();
        assert_eq!(grant.lease.payload, b"fast");
        assert!(started.elapsed() < Duration::from_millis(250));
        assert_eq!(stubborn.released.load(Ordering::SeqCst), 0);

        wait_for_release(&stubborn).await;
        assert_eq!(stubborn.saw_cancel.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_sources_means_no_work() {
        assert!(LeaseArbiter::default().assign(&agent()).await.is_none());
    }
}
