//! Single-owner election over the coordination store.
//!
//! The owner record carries a TTL that the holder keeps renewing. A separate
//! epoch key changes only when ownership moves; every owner write compares
//! on its revision, so a node that lost ownership cannot commit anything.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ddl_kv::{Compare, MetaOp, MetaStore};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::DdlResult;
use crate::meta_keys::{now_unix_ms, OWNER_EPOCH_KEY, OWNER_KEY};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub node_id: u64,
    pub epoch: u64,
    pub expires_at_unix_ms: u64,
}

/// Proof of ownership for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OwnerToken {
    pub node_id: u64,
    pub epoch: u64,
    epoch_revision: u64,
}

impl OwnerToken {
    /// Guard that fails once another node took over.
    pub fn fence(&self) -> Compare {
        Compare::revision(OWNER_EPOCH_KEY, self.epoch_revision)
    }
}

pub struct OwnerManager {
    node_id: u64,
    meta: Arc<MetaStore>,
    ttl: Duration,
    token: Mutex<Option<OwnerToken>>,
}

impl OwnerManager {
    pub fn new(node_id: u64, meta: Arc<MetaStore>, ttl: Duration) -> Self {
        Self {
            node_id,
            meta,
            ttl,
            token: Mutex::new(None),
        }
    }

    pub fn current_token(&self) -> Option<OwnerToken> {
        *self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_owner(&self) -> bool {
        self.current_token().is_some()
    }

    /// Current owner record, whether or not it is still live.
    pub fn owner_record(&self) -> DdlResult<Option<OwnerRecord>> {
        match self.meta.get(OWNER_KEY)? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Renews ownership when held, takes it over when the record expired,
    /// and otherwise reports `None`.
    pub fn campaign(&self) -> DdlResult<Option<OwnerToken>> {
        let now = now_unix_ms();
        let entry = self.meta.get(OWNER_KEY)?;
        let record = match &entry {
            Some(entry) => Some(serde_json::from_slice::<OwnerRecord>(&entry.value)?),
            None => None,
        };
        let owner_revision = entry.as_ref().map_or(0, |entry| entry.mod_revision);
        let held = self.current_token();
        let expires_at_unix_ms = now + self.ttl.as_millis() as u64;

        if let (Some(record), Some(token)) = (record, held) {
            if record.node_id == self.node_id && record.epoch == token.epoch {
                let renewed = OwnerRecord {
                    expires_at_unix_ms,
                    ..record
                };
                let response = self.meta.txn(
                    &[Compare::revision(OWNER_KEY, owner_revision), token.fence()],
                    vec![MetaOp::put(OWNER_KEY, serde_json::to_vec(&renewed)?)],
                )?;
                if response.succeeded {
                    return Ok(Some(token));
                }
                self.lose(token, "owner renewal lost a race");
                return Ok(None);
            }
        }

        if let Some(record) = record {
            if record.expires_at_unix_ms > now {
                if let Some(token) = held {
                    self.lose(token, "another node holds ownership");
                }
                return Ok(None);
            }
        }

        let epoch = record.map_or(0, |record| record.epoch) + 1;
        let claimed = OwnerRecord {
            node_id: self.node_id,
            epoch,
            expires_at_unix_ms,
        };
        let response = self.meta.txn(
            &[Compare::revision(OWNER_KEY, owner_revision)],
            vec![
                MetaOp::put(OWNER_KEY, serde_json::to_vec(&claimed)?),
                MetaOp::put(OWNER_EPOCH_KEY, serde_json::to_vec(&epoch)?),
            ],
        )?;
        if !response.succeeded {
            return Ok(None);
        }
        let token = OwnerToken {
            node_id: self.node_id,
            epoch,
            epoch_revision: response.revision,
        };
        *self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(token);
        tracing::info!(
            node_id = self.node_id,
            epoch,
            previous_owner = record.map(|record| record.node_id),
            "became ddl owner"
        );
        Ok(Some(token))
    }

    /// Gives up ownership so another node can take over without waiting for
    /// the TTL.
    pub fn resign(&self) -> DdlResult<()> {
        let Some(token) = self
            .token
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return Ok(());
        };
        let released = OwnerRecord {
            node_id: self.node_id,
            epoch: token.epoch,
            expires_at_unix_ms: 0,
        };
        self.meta.txn(
            &[token.fence()],
            vec![MetaOp::put(OWNER_KEY, serde_json::to_vec(&released)?)],
        )?;
        tracing::info!(node_id = self.node_id, epoch = token.epoch, "resigned ddl ownership");
        Ok(())
    }

    /// Whether `token`'s epoch is still the current one.
    pub fn check_fence(&self, token: OwnerToken) -> DdlResult<bool> {
        let revision = self
            .meta
            .get(OWNER_EPOCH_KEY)?
            .map_or(0, |entry| entry.mod_revision);
        Ok(revision == token.epoch_revision)
    }

    /// Drops the local token after a fenced write failed.
    pub fn forget(&self, token: OwnerToken) {
        self.lose(token, "fenced write rejected");
    }

    pub fn spawn_campaign_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval((self.ttl / 3).max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
                if let Err(err) = self.campaign() {
                    tracing::warn!(node_id = self.node_id, error = %err, "owner campaign failed");
                }
            }
        })
    }

    fn lose(&self, token: OwnerToken, reason: &str) {
        let mut guard = self.token.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *guard == Some(token) {
            *guard = None;
            tracing::warn!(node_id = self.node_id, epoch = token.epoch, reason, "lost ddl ownership");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_node_owns_until_expiry() {
        let meta = Arc::new(MetaStore::in_memory());
        let first = OwnerManager::new(1, Arc::clone(&meta), Duration::from_millis(40));
        let second = OwnerManager::new(2, Arc::clone(&meta), Duration::from_millis(40));

        let token = first.campaign().unwrap().expect("first campaign wins");
        assert_eq!(token.epoch, 1);
        assert!(second.campaign().unwrap().is_none());
        // Renewal keeps the epoch and its fence.
        assert_eq!(first.campaign().unwrap(), Some(token));

        std::thread::sleep(Duration::from_millis(60));
        let taken = second.campaign().unwrap().expect("takeover after expiry");
        assert_eq!(taken.epoch, 2);

        // The stale owner's fenced writes now fail.
        let response = meta
            .txn(&[token.fence()], vec![MetaOp::put("/x", b"1".to_vec())])
            .unwrap();
        assert!(!response.succeeded);
        assert!(first.campaign().unwrap().is_none());
        assert!(!first.is_owner());
    }

    #[test]
    fn resign_hands_over_immediately() {
        let meta = Arc::new(MetaStore::in_memory());
        let first = OwnerManager::new(1, Arc::clone(&meta), Duration::from_secs(60));
        let second = OwnerManager::new(2, Arc::clone(&meta), Duration::from_secs(60));
        first.campaign().unwrap().expect("owner");
        first.resign().unwrap();
        let token = second.campaign().unwrap().expect("takeover");
        assert_eq!(token.epoch, 2);
        assert_eq!(second.owner_record().unwrap().map(|r| r.node_id), Some(2));
    }
}
