//! Installation token cache with single-flight refresh.
//!
//! Each installation id maps to a slot that is either absent (nothing
//! cached), `Cached`, or `Fetching`. A cached token within the refresh
//! margin of its expiry is stale and is never served. The first caller to
//! find a slot absent or stale spawns the exchange; everyone arriving while
//! it runs waits on the same outcome.
//!
//! Slot transitions happen under the map's shard lock and never span an
//! `.await`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::app_jwt::AssertionSigner;
use super::clock::Clock;
use super::error::AuthError;
use super::exchange::{ExchangeClient, InstallationToken};

const OPERATION: &str = "installation token";

type Outcome = Option<Result<InstallationToken, AuthError>>;

enum Slot {
    Cached(InstallationToken),
    Fetching {
        generation: u64,
        rx: watch::Receiver<Outcome>,
    },
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenStats {
    pub cache_hits: u64,
    pub exchanges: u64,
    pub exchange_attempts: u64,
}

#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

struct Inner {
    slots: DashMap<u64, Slot>,
    signer: Arc<AssertionSigner>,
    exchange: ExchangeClient,
    clock: Arc<dyn Clock>,
    refresh_margin: chrono::Duration,
    next_generation: AtomicU64,
    cache_hits: AtomicU64,
    exchanges: AtomicU64,
}

enum Lookup {
    Hit(InstallationToken),
    Wait(watch::Receiver<Outcome>),
}

impl TokenManager {
    pub fn new(
        signer: Arc<AssertionSigner>,
        exchange: ExchangeClient,
        clock: Arc<dyn Clock>,
        refresh_margin: chrono::Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: DashMap::new(),
                signer,
                exchange: exchange.with_min_lifetime(refresh_margin),
                clock,
                refresh_margin,
                next_generation: AtomicU64::new(1),
                cache_hits: AtomicU64::new(0),
                exchanges: AtomicU64::new(0),
            }),
        }
    }

    /// A token for `installation_id` valid beyond the refresh margin.
    ///
    /// Cancelling `cancel` releases this caller. If this caller started the
    /// exchange, it is aborted and every caller waiting on it gets
    /// [`AuthError::Cancelled`].
    pub async fn get_token(
        &self,
        installation_id: u64,
        cancel: &CancellationToken,
    ) -> Result<InstallationToken, AuthError> {
        let rx = match self.lookup(installation_id, cancel) {
            Lookup::Hit(token) => return Ok(token),
            Lookup::Wait(rx) => rx,
        };
        wait_for_outcome(rx, cancel).await
    }

    fn lookup(&self, installation_id: u64, cancel: &CancellationToken) -> Lookup {
        let inner = &self.inner;
        let now = inner.clock.now();

        match inner.slots.entry(installation_id) {
            Entry::Occupied(mut entry) => {
                let stale = match entry.get() {
                    Slot::Cached(token) if token.is_fresh_at(now, inner.refresh_margin) => {
                        inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                        return Lookup::Hit(token.clone());
                    }
                    Slot::Fetching { rx, .. } => {
                        tracing::debug!(installation_id, "Joining in-flight token exchange");
                        return Lookup::Wait(rx.clone());
                    }
                    Slot::Cached(token) => token.expires_at,
                };
                tracing::debug!(installation_id, expires_at = %stale, "Cached token is stale");
                let (generation, rx) = self.spawn_fetch(installation_id, cancel.clone());
                entry.insert(Slot::Fetching {
                    generation,
                    rx: rx.clone(),
                });
                Lookup::Wait(rx)
            }
            Entry::Vacant(entry) => {
                let (generation, rx) = self.spawn_fetch(installation_id, cancel.clone());
                entry.insert(Slot::Fetching {
                    generation,
                    rx: rx.clone(),
                });
                Lookup::Wait(rx)
            }
        }
    }

    /// Start the exchange as its own task so it completes even if the
    /// initiating future is dropped.
    fn spawn_fetch(
        &self,
        installation_id: u64,
        cancel: CancellationToken,
    ) -> (u64, watch::Receiver<Outcome>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let mut guard = FetchGuard {
            inner: self.inner.clone(),
            installation_id,
            generation,
            tx,
            outcome: None,
        };

        tokio::spawn(async move {
            let outcome = guard.inner.fetch(installation_id, &cancel).await;
            guard.outcome = Some(outcome);
        });

        (generation, rx)
    }

    /// Drop a cached token, e.g. after it was rejected downstream.
    pub fn invalidate(&self, installation_id: u64) {
        if self
            .inner
            .slots
            .remove_if(&installation_id, |_, slot| matches!(slot, Slot::Cached(_)))
            .is_some()
        {
            tracing::debug!(installation_id, "Invalidated cached token");
        }
    }

    pub fn stats(&self) -> TokenStats {
        TokenStats {
            cache_hits: self.inner.cache_hits.load(Ordering::Relaxed),
            exchanges: self.inner.exchanges.load(Ordering::Relaxed),
            exchange_attempts: self.inner.exchange.attempts(),
        }
    }
}

impl Inner {
    async fn fetch(
        &self,
        installation_id: u64,
        cancel: &CancellationToken,
    ) -> Result<InstallationToken, AuthError> {
        self.exchanges.fetch_add(1, Ordering::Relaxed);
        self.exchange
            .exchange(&self.signer, installation_id, cancel)
            .await
    }

    /// Record the outcome, unless the slot has since moved on.
    fn settle(
        &self,
        installation_id: u64,
        generation: u64,
        outcome: &Result<InstallationToken, AuthError>,
    ) {
        if let Entry::Occupied(mut entry) = self.slots.entry(installation_id) {
            let current = matches!(
                entry.get(),
                Slot::Fetching { generation: g, .. } if *g == generation
            );
            if !current {
                return;
            }
            match outcome {
                Ok(token) => {
                    entry.insert(Slot::Cached(token.clone()));
                }
                Err(err) => {
                    tracing::warn!(installation_id, error = %err, "Installation token refresh failed");
                    entry.remove();
                }
            }
        }
    }
}

/// Settles a fetch and broadcasts its outcome when the fetch task ends.
///
/// Runs on drop, so a task that panics or is torn down before finishing
/// still clears its `Fetching` slot.
struct FetchGuard {
    inner: Arc<Inner>,
    installation_id: u64,
    generation: u64,
    tx: watch::Sender<Outcome>,
    outcome: Outcome,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            tracing::error!(
                installation_id = self.installation_id,
                "Token exchange task ended without an outcome"
            );
            Err(AuthError::Cancelled {
                operation: OPERATION,
            })
        });
        self.inner
            .settle(self.installation_id, self.generation, &outcome);
        let _ = self.tx.send(Some(outcome));
    }
}

async fn wait_for_outcome(
    mut rx: watch::Receiver<Outcome>,
    cancel: &CancellationToken,
) -> Result<InstallationToken, AuthError> {
    let cancelled = AuthError::Cancelled {
        operation: OPERATION,
    };
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled),
        outcome = async { rx.wait_for(Option::is_some).await.map(|outcome| (*outcome).clone()) } => {
            match outcome {
                Ok(Some(result)) => result,
                // sender dropped without an outcome: the task was torn down
                Ok(None) | Err(_) => Err(cancelled),
            }
        }
    }
}
