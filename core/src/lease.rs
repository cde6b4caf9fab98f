//! Run leases shared through the document store.
//!
//! A send run and a verification run each drive the single desktop client,
//! so at most one of each may be active across every process using the same
//! store. A lease carries an expiry; a holder that dies stops renewing and
//! the next claimant takes over once it lapses.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::store::{DocumentStore, Edit, LEASES};

pub const SEND_RUN: &str = "send";
pub const VERIFICATION_RUN: &str = "verification";
pub const MIN_LEASE_TTL: Duration = Duration::from_secs(120);

/// Lease lifetime for a run whose slowest step may take `step_timeout`.
pub fn lease_ttl(step_timeout: Duration) -> Duration {
    step_timeout.saturating_mul(4).max(MIN_LEASE_TTL)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    owner: String,
    pid: u32,
    expires_at: DateTime<Utc>,
}

fn record(owner: &str, ttl: Duration) -> Result<serde_json::Value, CoreError> {
    let ttl = ChronoDuration::from_std(ttl)
        .map_err(|err| CoreError::InvalidArgument(format!("lease ttl: {}", err)))?;
    Ok(serde_json::to_value(LeaseRecord {
        owner: owner.to_string(),
        pid: std::process::id(),
        expires_at: Utc::now() + ttl,
    })?)
}

fn held_by(current: Option<&serde_json::Value>, owner: &str) -> bool {
    current
        .and_then(|doc| serde_json::from_value::<LeaseRecord>(doc.clone()).ok())
        .map(|held| held.owner == owner)
        .unwrap_or(false)
}

/// A claimed lease. Dropping it releases the lease.
pub struct RunLease {
    store: Arc<dyn DocumentStore>,
    name: String,
    owner: String,
    ttl: Duration,
}

impl RunLease {
    /// Claims `name`, or returns `None` while another holder's lease is live.
    pub fn claim(store: Arc<dyn DocumentStore>, name: &str, ttl: Duration) -> Result<Option<Self>, CoreError> {
        let owner = Uuid::new_v4().to_string();
        let body = record(&owner, ttl)?;
        let now = Utc::now();
        let claimed = store.modify(LEASES, name, &mut |current| {
            if let Some(doc) = current {
                match serde_json::from_value::<LeaseRecord>(doc.clone()) {
                    Ok(held) if held.expires_at > now => return Ok(Edit::Keep),
                    Ok(held) => warn!(lease = name, pid = held.pid, "taking over expired lease"),
                    Err(err) => warn!(lease = name, "replacing unreadable lease: {}", err),
                }
            }
            Ok(Edit::Put(body.clone()))
        })?;
        if !claimed {
            return Ok(None);
        }
        info!(lease = name, "lease claimed");
        Ok(Some(Self {
            store,
            name: name.to_string(),
            owner,
            ttl,
        }))
    }

    /// Pushes the expiry out by another ttl. `false` means the lease expired
    /// and somebody else holds it now.
    pub fn renew(&self) -> Result<bool, CoreError> {
        let body = record(&self.owner, self.ttl)?;
        let owner = self.owner.as_str();
        self.store.modify(LEASES, &self.name, &mut |current| {
            if held_by(current, owner) {
                Ok(Edit::Put(body.clone()))
            } else {
                Ok(Edit::Keep)
            }
        })
    }

    fn release(&self) -> Result<bool, CoreError> {
        let owner = self.owner.as_str();
        self.store.modify(LEASES, &self.name, &mut |current| {
            if held_by(current, owner) {
                Ok(Edit::Delete)
            } else {
                Ok(Edit::Keep)
            }
        })
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        match self.release() {
            Ok(true) => info!(lease = %self.name, "lease released"),
            Ok(false) => warn!(lease = %self.name, "lease was taken over before release"),
            Err(err) => warn!(lease = %self.name, "lease release failed: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;
    use serde_json::json;

    fn store() -> Arc<dyn DocumentStore> {
        Arc::new(open_in_memory().expect("store"))
    }

    #[test]
    fn live_lease_blocks_second_claim_until_dropped() {
        let store = store();
        let first = RunLease::claim(store.clone(), SEND_RUN, MIN_LEASE_TTL)
            .expect("claim")
            .expect("free");
        assert!(RunLease::claim(store.clone(), SEND_RUN, MIN_LEASE_TTL).expect("claim").is_none());
        assert!(RunLease::claim(store.clone(), VERIFICATION_RUN, MIN_LEASE_TTL)
            .expect("claim")
            .is_some());
        drop(first);
        assert!(RunLease::claim(store, SEND_RUN, MIN_LEASE_TTL).expect("claim").is_some());
    }

    #[test]
    fn expired_lease_is_taken_over_and_old_holder_cannot_renew() {
        let store = store();
        let stale = RunLease::claim(store.clone(), SEND_RUN, MIN_LEASE_TTL)
            .expect("claim")
            .expect("free");
        let expired = json!({
            "owner": stale.owner,
            "pid": 1,
            "expiresAt": (Utc::now() - ChronoDuration::seconds(5)).to_rfc3339(),
        });
        store.put(LEASES, SEND_RUN, &expired).expect("expire");

        let fresh = RunLease::claim(store.clone(), SEND_RUN, MIN_LEASE_TTL)
            .expect("claim")
            .expect("takeover");
        assert!(!stale.renew().expect("renew"));
        assert!(fresh.renew().expect("renew"));
        drop(stale);
        assert!(store.get(LEASES, SEND_RUN).expect("get").is_some());
    }

    #[test]
    fn ttl_covers_slow_steps() {
        assert_eq!(lease_ttl(Duration::from_secs(1)), MIN_LEASE_TTL);
        assert_eq!(lease_ttl(Duration::from_secs(60)), Duration::from_secs(240));
    }
}
