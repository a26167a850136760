/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Cancellation tokens and the active-task registry.
//!
//! Each task execution gets its own [`CancelToken`]; the STT fan-out derives
//! a child token so the first chunk failure can abort sibling transcriptions
//! without marking the whole task user-cancelled. Cancelling a parent
//! cancels every descendant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use uuid::Uuid;

/// A cancellation token. Cloning shares the same trigger; [`CancelToken::child`]
/// derives a token that also observes every ancestor.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    parents: Vec<watch::Receiver<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parents: Vec::new(),
        }
    }

    /// Derives a token cancelled by either its own trigger or any ancestor's.
    pub fn child(&self) -> Self {
        let (tx, _rx) = watch::channel(false);
        let mut parents = self.parents.clone();
        parents.push(self.tx.subscribe());
        Self {
            tx: Arc::new(tx),
            parents,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.subscribe().borrow() || self.parents.iter().any(|rx| *rx.borrow())
    }

    /// Resolves once this token or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let mut own = self.tx.subscribe();
        let mut parents = self.parents.clone();

        let any_parent = async {
            if parents.is_empty() {
                std::future::pending::<()>().await;
            } else {
                let waits = parents
                    .iter_mut()
                    .map(|rx| Box::pin(rx.wait_for(|c| *c)))
                    .collect::<Vec<_>>();
                // A closed ancestor counts as cancelled: its task context is
                // gone and nothing downstream should keep running.
                let _ = futures::future::select_all(waits).await;
            }
        };

        tokio::select! {
            _ = own.wait_for(|c| *c) => {}
            _ = any_parent => {}
        }
    }
}

/// Process-wide map from task id to its cancellation token, mutated only on
/// task start and end. The cancellation listener consults it to route
/// `cancel_channel` signals to in-flight work.
#[derive(Clone, Default)]
pub struct ActiveTasks {
    inner: Arc<Mutex<HashMap<Uuid, CancelToken>>>,
}

impl ActiveTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid, token: CancelToken) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, token);
    }

    pub fn deregister(&self, id: Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    /// Triggers the token for `id` if that task is in flight. Returns whether
    /// anything was cancelled.
    pub fn cancel(&self, id: Uuid) -> bool {
        let token = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every in-flight task (shutdown path).
    pub fn cancel_all(&self) {
        let tokens: Vec<CancelToken> = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for token in tokens {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!token.is_cancelled());
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn parent_cancel_propagates_to_child() {
        let parent = CancelToken::new();
        let child = parent.child();

        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());

        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .expect("child should observe parent cancel");
    }

    #[tokio::test]
    async fn child_cancel_does_not_affect_parent() {
        let parent = CancelToken::new();
        let child = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn registry_routes_cancellation() {
        let active = ActiveTasks::new();
        let id = Uuid::new_v4();
        let token = CancelToken::new();

        active.register(id, token.clone());
        assert!(active.cancel(id));
        assert!(token.is_cancelled());

        active.deregister(id);
        assert!(!active.cancel(id));
        assert!(active.is_empty());
    }
}
