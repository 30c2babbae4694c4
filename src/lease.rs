// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exclusive lease guaranteeing a single active cursor per replica site.
//!
//! Multiple daemon processes may run for availability, but only the lease
//! holder tails the log. The lease is a TTL'd key in a shared store; it is
//! re-entrant for its owner (re-obtaining a lease you already hold renews
//! it, so a holder that loops faster than the TTL never loses leadership).
//!
//! Renewal and release are ownership-checked server-side: a process that
//! lost its lease to expiry cannot release or extend a lease now held by
//! someone else.

use crate::error::{CursorError, Result};
use crate::handler::BoxFuture;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Proof of lease ownership, returned by a successful obtain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn uuid(&self) -> &str {
        &self.0
    }
}

/// Distributed TTL lock.
pub trait LeaseService: Send + Sync + 'static {
    /// Try to obtain (or, if this process already holds it, renew) the
    /// lease. `None` means another process holds it.
    fn try_obtain(&self) -> BoxFuture<'_, Result<Option<LeaseToken>>>;

    /// Extend the TTL. Returns `false` if the lease is no longer ours,
    /// which the caller must treat as lost leadership.
    fn renew<'a>(&'a self, token: &'a LeaseToken) -> BoxFuture<'a, Result<bool>>;

    /// Release the lease if still ours. Releasing a lease someone else now
    /// holds is a no-op.
    fn release<'a>(&'a self, token: &'a LeaseToken) -> BoxFuture<'a, Result<()>>;
}

// Ownership-checked renew: extend only if the value is still our uuid.
const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
    return 0
end
"#;

// Ownership-checked release.
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed lease. Production implementation.
pub struct RedisLease {
    conn: redis::aio::ConnectionManager,
    key: String,
    ttl: Duration,
    /// Identity of this process. Stored as the lease value so renewals and
    /// releases can be ownership-checked.
    uuid: String,
}

impl RedisLease {
    pub async fn connect(redis_url: &str, key: impl Into<String>, ttl: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CursorError::lease("connect", e))?;
        let conn = redis::aio::ConnectionManager::new(client)
            .await
            .map_err(|e| CursorError::lease("connect", e))?;
        let key = key.into();
        let uuid = Uuid::new_v4().to_string();
        info!(key = %key, lease_uuid = %uuid, "Connected lease service to Redis");
        Ok(Self {
            conn,
            key,
            ttl,
            uuid,
        })
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }
}

impl LeaseService for RedisLease {
    fn try_obtain(&self) -> BoxFuture<'_, Result<Option<LeaseToken>>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();

            // SET NX PX: atomically take the lease if free.
            let set: Option<String> = redis::cmd("SET")
                .arg(&self.key)
                .arg(&self.uuid)
                .arg("NX")
                .arg("PX")
                .arg(self.ttl_ms())
                .query_async(&mut conn)
                .await
                .map_err(|e| CursorError::lease("obtain", e))?;

            if set.is_some() {
                debug!(lease_uuid = %self.uuid, "Obtained lease");
                return Ok(Some(LeaseToken(self.uuid.clone())));
            }

            // Contended. If the holder is us (previous iteration, never
            // released), renew instead of failing.
            let holder: Option<String> = redis::cmd("GET")
                .arg(&self.key)
                .query_async(&mut conn)
                .await
                .map_err(|e| CursorError::lease("obtain", e))?;

            if holder.as_deref() == Some(self.uuid.as_str()) {
                let _: () = redis::cmd("PEXPIRE")
                    .arg(&self.key)
                    .arg(self.ttl_ms())
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| CursorError::lease("renew", e))?;
                debug!(lease_uuid = %self.uuid, "Lease already ours, renewed");
                return Ok(Some(LeaseToken(self.uuid.clone())));
            }

            debug!(
                holder = %holder.unwrap_or_else(|| "<expired>".to_string()),
                "Lease held by another process"
            );
            Ok(None)
        })
    }

    fn renew<'a>(&'a self, token: &'a LeaseToken) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let script = redis::Script::new(RENEW_SCRIPT);
            let renewed: i64 = script
                .key(&self.key)
                .arg(token.uuid())
                .arg(self.ttl_ms())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| CursorError::lease("renew", e))?;
            if renewed == 0 {
                warn!(lease_uuid = %token.uuid(), "Lease renewal failed, lease no longer ours");
            }
            Ok(renewed != 0)
        })
    }

    fn release<'a>(&'a self, token: &'a LeaseToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.conn.clone();
            let script = redis::Script::new(RELEASE_SCRIPT);
            let released: i64 = script
                .key(&self.key)
                .arg(token.uuid())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| CursorError::lease("release", e))?;
            if released != 0 {
                debug!(lease_uuid = %token.uuid(), "Released lease");
            }
            Ok(())
        })
    }
}

type SharedLeaseState = Arc<Mutex<Option<(String, Instant)>>>;

/// In-process lease for tests and single-node deployments without Redis.
///
/// Two instances built with [`with_state`](InMemoryLease::with_state) over
/// the same shared state contend like two processes against one Redis key.
pub struct InMemoryLease {
    state: SharedLeaseState,
    ttl: Duration,
    uuid: String,
}

impl InMemoryLease {
    pub fn new(ttl: Duration) -> Self {
        Self::with_state(Arc::new(Mutex::new(None)), ttl)
    }

    pub fn with_state(state: SharedLeaseState, ttl: Duration) -> Self {
        Self {
            state,
            ttl,
            uuid: Uuid::new_v4().to_string(),
        }
    }

    pub fn shared_state(&self) -> SharedLeaseState {
        Arc::clone(&self.state)
    }

    /// Whether this instance currently holds an unexpired lease.
    pub fn is_held(&self) -> bool {
        let guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some((holder, expiry)) => holder == &self.uuid && *expiry > Instant::now(),
            None => false,
        }
    }
}

impl LeaseService for InMemoryLease {
    fn try_obtain(&self) -> BoxFuture<'_, Result<Option<LeaseToken>>> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match guard.as_ref() {
                Some((holder, expiry)) if *expiry > now && holder != &self.uuid => Ok(None),
                _ => {
                    *guard = Some((self.uuid.clone(), now + self.ttl));
                    Ok(Some(LeaseToken(self.uuid.clone())))
                }
            }
        })
    }

    fn renew<'a>(&'a self, token: &'a LeaseToken) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            match guard.as_ref() {
                Some((holder, expiry)) if *expiry > now && holder == token.uuid() => {
                    *guard = Some((token.uuid().to_string(), now + self.ttl));
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn release<'a>(&'a self, token: &'a LeaseToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((holder, _)) = guard.as_ref() {
                if holder == token.uuid() {
                    *guard = None;
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_obtain_then_contender_blocked() {
        let a = InMemoryLease::new(Duration::from_secs(30));
        let b = InMemoryLease::with_state(a.shared_state(), Duration::from_secs(30));

        let token = a.try_obtain().await.unwrap();
        assert!(token.is_some());
        assert!(a.is_held());

        assert!(b.try_obtain().await.unwrap().is_none());
        assert!(!b.is_held());
    }

    #[tokio::test]
    async fn test_reobtain_is_renewal_for_owner() {
        let a = InMemoryLease::new(Duration::from_secs(30));
        let first = a.try_obtain().await.unwrap().unwrap();
        let second = a.try_obtain().await.unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_release_frees_lease_for_others() {
        let a = InMemoryLease::new(Duration::from_secs(30));
        let b = InMemoryLease::with_state(a.shared_state(), Duration::from_secs(30));

        let token = a.try_obtain().await.unwrap().unwrap();
        a.release(&token).await.unwrap();

        assert!(b.try_obtain().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_can_be_taken() {
        let a = InMemoryLease::new(Duration::from_millis(100));
        let b = InMemoryLease::with_state(a.shared_state(), Duration::from_millis(100));

        a.try_obtain().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;

        assert!(b.try_obtain().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_fails_after_expiry_takeover() {
        let a = InMemoryLease::new(Duration::from_millis(100));
        let b = InMemoryLease::with_state(a.shared_state(), Duration::from_millis(100));

        let token_a = a.try_obtain().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_millis(200)).await;
        b.try_obtain().await.unwrap().unwrap();

        assert!(!a.renew(&token_a).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_noop() {
        let a = InMemoryLease::new(Duration::from_secs(30));
        let b = InMemoryLease::with_state(a.shared_state(), Duration::from_secs(30));

        a.try_obtain().await.unwrap().unwrap();
        let stale = LeaseToken(b.uuid.clone());
        b.release(&stale).await.unwrap();

        assert!(a.is_held());
    }

    #[tokio::test]
    async fn test_renew_extends_ttl() {
        let a = InMemoryLease::new(Duration::from_secs(30));
        let token = a.try_obtain().await.unwrap().unwrap();
        assert!(a.renew(&token).await.unwrap());
        assert!(a.is_held());
    }
}
