//! Connection pool: one shared broker connection per credential tuple.
//!
//! The pool caches the *acquisition*, not only its result: the first caller
//! for a key starts the connection attempt and every concurrent caller for
//! the same key awaits that same attempt. Failed attempts are evicted so the
//! next caller tries again.
//!
//! A fail-fast caller never joins a pending retrying attempt, which may not
//! end. It connects on its own and its connection replaces the pending entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use tasmobridge_domain::credentials::{BrokerCredentials, ConnectionKey};
use tasmobridge_domain::error::ConnectionError;

use crate::ports::{Broker, BrokerConnection, RetryPolicy};

struct PoolSlot<C> {
    retry: RetryPolicy,
    cell: OnceCell<Result<C, ConnectionError>>,
    /// Successful acquisitions not yet released.
    holders: AtomicUsize,
}

impl<C: Clone> PoolSlot<C> {
    fn pending(retry: RetryPolicy) -> Self {
        Self {
            retry,
            cell: OnceCell::new(),
            holders: AtomicUsize::new(0),
        }
    }

    fn ready(connection: C) -> Self {
        Self {
            retry: RetryPolicy::FailFast,
            cell: OnceCell::new_with(Some(Ok(connection))),
            holders: AtomicUsize::new(0),
        }
    }

    fn connection(&self) -> Option<C> {
        match self.cell.get() {
            Some(Ok(connection)) => Some(connection.clone()),
            _ => None,
        }
    }

    fn hold(&self) {
        self.holders.fetch_add(1, Ordering::SeqCst);
    }
}

type Slot<C> = Arc<PoolSlot<C>>;

/// Shares broker connections between every session using the same credentials.
pub struct ConnectionPool<B: Broker> {
    broker: B,
    slots: Mutex<HashMap<ConnectionKey, Slot<B::Connection>>>,
}

impl<B: Broker> ConnectionPool<B> {
    /// Create a pool that opens connections through `broker`.
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// The broker connections are opened with.
    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Get the shared connection for `credentials`, connecting if needed.
    ///
    /// # Errors
    ///
    /// Returns the [`ConnectionError`] of the attempt this call joined. With
    /// [`RetryPolicy::FailFast`] that is the first failure the broker reports.
    #[tracing::instrument(skip(self, credentials), fields(broker = %credentials.key()))]
    pub async fn acquire(
        &self,
        credentials: &BrokerCredentials,
        retry: RetryPolicy,
    ) -> Result<B::Connection, ConnectionError> {
        let key = credentials.key();
        let (slot, reused) = {
            let mut slots = self.lock();
            match slots.get(&key) {
                Some(slot) => (Arc::clone(slot), true),
                None => {
                    let slot = Arc::new(PoolSlot::pending(retry));
                    slots.insert(key.clone(), Arc::clone(&slot));
                    (slot, false)
                }
            }
        };
        if reused {
            if retry == RetryPolicy::FailFast
                && slot.retry == RetryPolicy::Retry
                && !slot.cell.initialized()
            {
                return self.acquire_alongside(&key, credentials).await;
            }
            tracing::debug!("reusing broker connection");
        } else {
            tracing::info!(?retry, "creating new broker connection");
        }

        let result = slot
            .cell
            .get_or_init(|| self.broker.connect(credentials, slot.retry))
            .await
            .clone();

        let connection = match result {
            Ok(connection) => connection,
            Err(err) => {
                tracing::warn!(%err, "broker connection failed");
                let mut slots = self.lock();
                if slots
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot))
                {
                    slots.remove(&key);
                }
                return Err(err);
            }
        };

        let superseding = if slot.retry == RetryPolicy::Retry {
            let slots = self.lock();
            slots
                .get(&key)
                .filter(|current| !Arc::ptr_eq(current, &slot))
                .and_then(|current| current.connection().map(|c| (Arc::clone(current), c)))
        } else {
            None
        };
        match superseding {
            Some((current, replacement)) => {
                tracing::debug!("retrying attempt was superseded, closing its connection");
                connection.close().await;
                current.hold();
                Ok(replacement)
            }
            None => {
                slot.hold();
                Ok(connection)
            }
        }
    }

    /// Connect without retries next to a pending retrying attempt.
    async fn acquire_alongside(
        &self,
        key: &ConnectionKey,
        credentials: &BrokerCredentials,
    ) -> Result<B::Connection, ConnectionError> {
        tracing::info!("pending connection is retrying, connecting without retries");
        let connection = self
            .broker
            .connect(credentials, RetryPolicy::FailFast)
            .await
            .inspect_err(|err| tracing::warn!(%err, "broker connection failed"))?;

        let existing = {
            let mut slots = self.lock();
            let existing = slots
                .get(key)
                .and_then(|current| current.connection().map(|c| (Arc::clone(current), c)));
            if existing.is_none() {
                let slot = Arc::new(PoolSlot::ready(connection.clone()));
                slot.hold();
                slots.insert(key.clone(), slot);
            }
            existing
        };
        match existing {
            Some((current, shared)) => {
                connection.close().await;
                current.hold();
                Ok(shared)
            }
            None => Ok(connection),
        }
    }

    /// Give back one acquisition of `connection`.
    ///
    /// Once nothing holds the pooled connection any more it is evicted and
    /// closed. A connection the pool no longer caches is left alone.
    #[tracing::instrument(skip(self, credentials, connection), fields(broker = %credentials.key()))]
    pub async fn release(&self, credentials: &BrokerCredentials, connection: &B::Connection) {
        let key = credentials.key();
        let evicted = {
            let mut slots = self.lock();
            let Some(slot) = slots.get(&key) else {
                return;
            };
            if !slot
                .connection()
                .is_some_and(|pooled| pooled.same_connection(connection))
            {
                return;
            }
            let previous = slot
                .holders
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .unwrap_or(0);
            if previous <= 1 {
                slots.remove(&key)
            } else {
                None
            }
        };
        if let Some(slot) = evicted {
            tracing::info!("closing unused broker connection");
            if let Some(connection) = slot.connection() {
                connection.close().await;
            }
        }
    }

    /// Number of cached (pending or established) connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every established connection and empty the pool.
    pub async fn close_all(&self) {
        let slots: Vec<Slot<B::Connection>> = self.lock().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            if let Some(connection) = slot.connection() {
                connection.close().await;
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Slot<B::Connection>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
