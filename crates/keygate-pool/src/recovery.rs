use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::pool::{CredentialId, PoolInner};

/// Deadline queue that puts rate-limited credentials back into rotation once
/// their cooldown elapses.
#[derive(Debug)]
pub(crate) struct RecoveryQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, CredentialId)>>>,
    notify: Notify,
}

impl RecoveryQueue {
    pub(crate) fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
        }
    }

    pub(crate) async fn push(&self, until: Instant, credential_id: CredentialId) {
        {
            let mut heap = self.heap.lock().await;
            heap.push(Reverse((until, credential_id)));
        }
        // Always notify: the background task re-computes the next deadline.
        self.notify.notify_one();
    }

    pub(crate) fn spawn_recover_task(self: Arc<Self>, inner: Arc<RwLock<PoolInner>>) {
        tokio::spawn(async move {
            loop {
                let next = {
                    let heap = self.heap.lock().await;
                    heap.peek().map(|Reverse((t, id))| (*t, *id))
                };

                match next {
                    None => {
                        self.notify.notified().await;
                        continue;
                    }
                    Some((deadline, _)) => {
                        tokio::select! {
                            _ = sleep_until(deadline) => {}
                            _ = self.notify.notified() => continue,
                        }
                    }
                }

                let now = Instant::now();
                let mut due: Vec<CredentialId> = Vec::new();
                {
                    let mut heap = self.heap.lock().await;
                    while let Some(Reverse((t, id))) = heap.peek().copied() {
                        if t > now {
                            break;
                        }
                        heap.pop();
                        due.push(id);
                    }
                }

                if due.is_empty() {
                    continue;
                }

                // Recover due credentials, guarding against stale queue
                // entries left by a later, longer demotion.
                let mut guard = inner.write().await;
                for id in due {
                    if guard.rate_limit_expired(id, now) {
                        guard.reactivate(id);
                        debug!(credential_id = id, "rate-limit cooldown elapsed");
                    }
                }
            }
        });
    }
}
