use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::group::{Group, GroupId};
use crate::recovery::RecoveryQueue;

pub type CredentialId = i64;

const RATE_LIMIT_FALLBACK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialStatus {
    Active,
    Invalid,
    RateLimited,
    AuthFailed,
    Forbidden,
    BadRequest,
    ServerError,
    NetworkError,
}

impl CredentialStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, CredentialStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    GroupUnknown,
    NoActiveCredentials,
}

/// A credential handed to one request. The request keeps it for its whole
/// lifetime; later demotions never re-route an in-flight request.
#[derive(Debug, Clone)]
pub struct LeasedCredential {
    pub id: CredentialId,
    pub group: GroupId,
    pub key: String,
}

/// Read-only copy of a credential's bookkeeping, for management reads.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: CredentialId,
    pub group: GroupId,
    pub status: CredentialStatus,
    pub last_used: Option<OffsetDateTime>,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct Entry {
    group: GroupId,
    key: String,
    status: CredentialStatus,
    last_used: Option<OffsetDateTime>,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

#[derive(Debug, Default)]
struct Ring {
    order: Vec<CredentialId>,
    cursor: usize,
}

#[derive(Default)]
pub(crate) struct PoolInner {
    groups: HashMap<GroupId, Group>,
    by_name: HashMap<String, GroupId>,
    creds: HashMap<CredentialId, Entry>,
    rings: HashMap<GroupId, Ring>,
    next_id: CredentialId,
}

impl PoolInner {
    fn ring_insert(&mut self, group: GroupId, id: CredentialId) {
        let ring = self.rings.entry(group).or_default();
        if !ring.order.contains(&id) {
            ring.order.push(id);
        }
    }

    fn ring_remove(&mut self, group: GroupId, id: CredentialId) {
        if let Some(ring) = self.rings.get_mut(&group) {
            if let Some(pos) = ring.order.iter().position(|x| *x == id) {
                ring.order.remove(pos);
                if pos < ring.cursor {
                    ring.cursor -= 1;
                }
                if ring.order.is_empty() {
                    ring.cursor = 0;
                }
            }
        }
    }

    /// Promotes a credential back into rotation. No-op for unknown ids.
    pub(crate) fn reactivate(&mut self, id: CredentialId) {
        let Some(entry) = self.creds.get_mut(&id) else {
            return;
        };
        entry.status = CredentialStatus::Active;
        entry.consecutive_failures = 0;
        entry.cooldown_until = None;
        let group = entry.group;
        self.ring_insert(group, id);
    }

    pub(crate) fn rate_limit_expired(&self, id: CredentialId, now: Instant) -> bool {
        match self.creds.get(&id) {
            Some(entry) => {
                entry.status == CredentialStatus::RateLimited
                    && entry.cooldown_until.map(|t| t <= now).unwrap_or(true)
            }
            None => false,
        }
    }
}

/// Per-process credential pool: group table, per-group rotation rings and
/// the status lifecycle. One pool exists per process; one ring per group.
pub struct CredentialPool {
    inner: Arc<RwLock<PoolInner>>,
    queue: Arc<RecoveryQueue>,
}

impl CredentialPool {
    pub fn new() -> Self {
        let inner = Arc::new(RwLock::new(PoolInner::default()));
        let queue = Arc::new(RecoveryQueue::new());
        queue.clone().spawn_recover_task(inner.clone());
        Self { inner, queue }
    }

    pub async fn insert_group(&self, group: Group) {
        let mut inner = self.inner.write().await;
        inner.by_name.insert(group.name.clone(), group.id);
        inner.rings.entry(group.id).or_default();
        inner.groups.insert(group.id, group);
    }

    pub async fn group(&self, id: GroupId) -> Option<Group> {
        self.inner.read().await.groups.get(&id).cloned()
    }

    pub async fn group_by_name(&self, name: &str) -> Option<Group> {
        let inner = self.inner.read().await;
        let id = inner.by_name.get(name)?;
        inner.groups.get(id).cloned()
    }

    /// Bulk key import. All imported credentials start active.
    pub async fn import_credentials(
        &self,
        group: GroupId,
        keys: impl IntoIterator<Item = String>,
    ) -> Vec<CredentialId> {
        let mut inner = self.inner.write().await;
        let mut ids = Vec::new();
        for key in keys {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.creds.insert(
                id,
                Entry {
                    group,
                    key,
                    status: CredentialStatus::Active,
                    last_used: None,
                    consecutive_failures: 0,
                    cooldown_until: None,
                },
            );
            inner.ring_insert(group, id);
            ids.push(id);
        }
        ids
    }

    /// Next active credential for the group, round-robin. Aggregate groups
    /// pick a child by weight first and fall back to the remaining children
    /// when the picked one is exhausted.
    pub async fn acquire(&self, group: GroupId) -> Result<LeasedCredential, AcquireError> {
        let members = {
            let inner = self.inner.read().await;
            let g = inner.groups.get(&group).ok_or(AcquireError::GroupUnknown)?;
            if g.is_aggregate() {
                Some(g.aggregate.clone())
            } else {
                None
            }
        };

        let Some(members) = members else {
            return self.acquire_direct(group).await;
        };

        let mut remaining: Vec<_> = members.into_iter().filter(|m| m.weight > 0).collect();
        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|m| m.weight as u64).sum();
            let mut roll = rand::rng().random_range(0..total);
            let mut picked = 0;
            for (i, member) in remaining.iter().enumerate() {
                if roll < member.weight as u64 {
                    picked = i;
                    break;
                }
                roll -= member.weight as u64;
            }
            let child = remaining.remove(picked);
            match self.acquire_direct(child.group).await {
                Ok(lease) => return Ok(lease),
                Err(AcquireError::GroupUnknown) | Err(AcquireError::NoActiveCredentials) => {}
            }
        }
        Err(AcquireError::NoActiveCredentials)
    }

    async fn acquire_direct(&self, group: GroupId) -> Result<LeasedCredential, AcquireError> {
        let mut inner = self.inner.write().await;
        if !inner.groups.contains_key(&group) {
            return Err(AcquireError::GroupUnknown);
        }
        let Some(id) = self.pick_from_ring(&mut inner, group) else {
            return Err(AcquireError::NoActiveCredentials);
        };
        let entry = inner
            .creds
            .get_mut(&id)
            .ok_or(AcquireError::NoActiveCredentials)?;
        entry.last_used = Some(OffsetDateTime::now_utc());
        Ok(LeasedCredential {
            id,
            group: entry.group,
            key: entry.key.clone(),
        })
    }

    fn pick_from_ring(&self, inner: &mut PoolInner, group: GroupId) -> Option<CredentialId> {
        let ring = inner.rings.get_mut(&group)?;
        if ring.order.is_empty() {
            return None;
        }
        let idx = ring.cursor % ring.order.len();
        ring.cursor = (idx + 1) % ring.order.len();
        Some(ring.order[idx])
    }

    /// Transitions the credential to a failure status and takes it out of
    /// rotation. Repeated demotions of the same class are idempotent.
    /// Rate-limited credentials re-activate automatically once `retry_after`
    /// (or a fixed fallback) elapses.
    pub async fn demote(
        &self,
        id: CredentialId,
        status: CredentialStatus,
        retry_after: Option<Duration>,
    ) {
        if status.is_active() {
            return;
        }
        let deadline = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.creds.get_mut(&id) else {
                return;
            };
            let group = entry.group;
            let repeat = entry.status == status;
            entry.status = status;
            if !repeat {
                entry.consecutive_failures += 1;
            }
            let deadline = if status == CredentialStatus::RateLimited {
                let until = Instant::now() + retry_after.unwrap_or(RATE_LIMIT_FALLBACK);
                entry.cooldown_until = Some(until);
                Some(until)
            } else {
                entry.cooldown_until = None;
                None
            };
            inner.ring_remove(group, id);
            deadline
        };
        debug!(credential_id = id, status = ?status, "credential demoted");
        if let Some(deadline) = deadline {
            self.queue.push(deadline, id).await;
        }
    }

    /// Manually promotes one credential back to active.
    pub async fn restore(&self, id: CredentialId) {
        self.inner.write().await.reactivate(id);
    }

    /// Promotes every credential currently in `status` back to active.
    pub async fn restore_status(&self, status: CredentialStatus) {
        if status.is_active() {
            return;
        }
        let mut inner = self.inner.write().await;
        let ids: Vec<CredentialId> = inner
            .creds
            .iter()
            .filter(|(_, e)| e.status == status)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            inner.reactivate(id);
        }
    }

    /// Credentials that revalidation should probe, with their group.
    pub async fn non_active(&self) -> Vec<(CredentialId, GroupId, String)> {
        let inner = self.inner.read().await;
        let mut out: Vec<_> = inner
            .creds
            .iter()
            .filter(|(_, e)| !e.status.is_active())
            .map(|(id, e)| (*id, e.group, e.key.clone()))
            .collect();
        out.sort_by_key(|(id, _, _)| *id);
        out
    }

    pub async fn status(&self, id: CredentialId) -> Option<CredentialStatus> {
        self.inner.read().await.creds.get(&id).map(|e| e.status)
    }

    pub async fn credential(&self, id: CredentialId) -> Option<CredentialView> {
        self.inner.read().await.creds.get(&id).map(|e| CredentialView {
            id,
            group: e.group,
            status: e.status,
            last_used: e.last_used,
            consecutive_failures: e.consecutive_failures,
        })
    }

    pub async fn active_count(&self, group: GroupId) -> usize {
        self.inner
            .read()
            .await
            .rings
            .get(&group)
            .map(|r| r.order.len())
            .unwrap_or(0)
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}
