use crate::deadline::bounded;
use meridian_core::store::LeaseClient;
use meridian_core::{LeaseId, MetaError, MetaResult, StoreError, StoreResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A lease held by a campaigning member, plus the background task that
/// keeps it alive.
///
/// `is_leader` starts false, becomes true when keep-alive starts and goes
/// back to false exactly once, when the keep-alive stream fails, ends or is
/// stopped, or when no acknowledgement arrived within one TTL. It never
/// returns to true for the same handle.
pub(crate) struct LeaseHandle {
    client: Arc<dyn LeaseClient>,
    ttl_secs: i64,
    rpc_timeout: Duration,
    id: Option<LeaseId>,
    /// Local bound on the lease's life: grant request time plus TTL, then
    /// last acknowledgement plus TTL. `None` when it would overflow the clock.
    expires_at: Option<Instant>,
    is_leader: Arc<AtomicBool>,
    lapsed: CancellationToken,
    keep_alive: Option<JoinHandle<()>>,
    stop: CancellationToken,
}

fn expiry_after(now: Instant, ttl_secs: i64) -> Option<Instant> {
    now.checked_add(Duration::from_secs(ttl_secs.max(0) as u64))
}

async fn expired(expires_at: Option<Instant>) {
    match expires_at {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Renews `lease_id` until the stream fails, the lease runs past its local
/// deadline or `stop` fires.
async fn renew(
    client: &dyn LeaseClient,
    lease_id: LeaseId,
    mut expires_at: Option<Instant>,
    stop: &CancellationToken,
) {
    let mut acks = tokio::select! {
        biased;
        _ = stop.cancelled() => return,
        _ = expired(expires_at) => {
            warn!("Lease {} expired before keep-alive opened", lease_id);
            return;
        }
        opened = client.keep_alive(lease_id) => match opened {
            Ok(acks) => acks,
            Err(e) => {
                warn!("Failed to open keep-alive for lease {}: {}", lease_id, e);
                return;
            }
        },
    };

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                debug!("Keep-alive for lease {} stopped", lease_id);
                return;
            }
            _ = expired(expires_at) => {
                warn!("Lease {} not acknowledged within its ttl", lease_id);
                return;
            }
            ack = acks.recv() => match ack {
                Some(Ok(ack)) => expires_at = expiry_after(Instant::now(), ack.ttl_secs),
                Some(Err(e)) => {
                    warn!("Keep-alive for lease {} failed: {}", lease_id, e);
                    return;
                }
                None => {
                    warn!("Keep-alive stream for lease {} closed", lease_id);
                    return;
                }
            },
        }
    }
}

impl LeaseHandle {
    pub(crate) fn new(client: Arc<dyn LeaseClient>, ttl_secs: i64, rpc_timeout: Duration) -> Self {
        Self {
            client,
            ttl_secs,
            rpc_timeout,
            id: None,
            expires_at: None,
            is_leader: Arc::new(AtomicBool::new(false)),
            lapsed: CancellationToken::new(),
            keep_alive: None,
            stop: CancellationToken::new(),
        }
    }

    pub(crate) fn id(&self) -> Option<LeaseId> {
        self.id
    }

    pub(crate) async fn grant(&mut self, cancel: &CancellationToken) -> MetaResult<LeaseId> {
        let requested = Instant::now();
        let grant = bounded(
            cancel,
            self.rpc_timeout,
            "lease grant",
            self.client.grant(self.ttl_secs),
        )
        .await
        .map_err(|source| MetaError::LeaseGrantFailed { source })?;

        debug!("Granted lease {} with ttl {}s", grant.id, grant.ttl_secs);
        self.id = Some(grant.id);
        self.expires_at = expiry_after(requested, grant.ttl_secs);
        Ok(grant.id)
    }

    /// Marks the holder as leader and starts renewing the lease in the
    /// background.
    pub(crate) fn start_keep_alive(&mut self) {
        let Some(lease_id) = self.id else {
            warn!("Keep-alive requested before a lease was granted");
            return;
        };
        if self.keep_alive.is_some() {
            warn!("Keep-alive for lease {} already running", lease_id);
            return;
        }

        self.is_leader.store(true, Ordering::Release);

        let client = Arc::clone(&self.client);
        let is_leader = Arc::clone(&self.is_leader);
        let lapsed = self.lapsed.clone();
        let stop = self.stop.clone();
        let expires_at = self.expires_at;

        self.keep_alive = Some(tokio::spawn(async move {
            renew(client.as_ref(), lease_id, expires_at, &stop).await;
            is_leader.store(false, Ordering::Release);
            lapsed.cancel();
        }));
    }

    pub(crate) fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Completes once the flag has gone false.
    pub(crate) async fn lapsed(&self) {
        self.lapsed.cancelled().await
    }

    /// Stops renewing the lease without revoking it, so the key it guards
    /// stays until the TTL runs out.
    pub(crate) async fn stop_keep_alive(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.keep_alive.take() {
            if let Err(e) = task.await {
                warn!("Keep-alive task ended abnormally: {}", e);
            }
        }
        self.is_leader.store(false, Ordering::Release);
        self.lapsed.cancel();
    }

    /// Stops keep-alive and revokes the lease, deleting every key attached
    /// to it.
    pub(crate) async fn close(&mut self) -> StoreResult<()> {
        self.stop_keep_alive().await;

        let Some(lease_id) = self.id.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.rpc_timeout, self.client.revoke(lease_id)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::deadline_exceeded("lease revoke")),
        }
    }
}

impl Drop for LeaseHandle {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(task) = self.keep_alive.take() {
            task.abort();
        }
        self.is_leader.store(false, Ordering::Release);
        self.lapsed.cancel();
    }
}
