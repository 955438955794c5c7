//! A single dish card with an optimistic availability toggle.
//!
//! The toggle flips the local copy at once and persists in a spawned task.
//! Writes for one card run one at a time and always send the latest local
//! value, so the stored value ends up equal to the last toggle. What happens
//! when a write fails is decided by the card's [`ReconciliationPolicy`].

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{list::MenuFeed, model::Dish, repo};
use crate::backend::documents::DocumentStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationPolicy {
    /// Restore the pre-toggle value when the write fails.
    Revert,
    /// Retry with exponential backoff, then mark the card unsynced.
    Retry { attempts: u32, base_delay: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Synced,
    Pending,
    Unsynced,
}

struct CardState {
    dish: Dish,
    sync: SyncState,
    generation: u64,
}

#[derive(Clone)]
pub struct DishCard {
    state: Arc<Mutex<CardState>>,
    writes: Arc<tokio::sync::Mutex<()>>,
    documents: Arc<dyn DocumentStore>,
    policy: ReconciliationPolicy,
    feed: MenuFeed,
    lifetime: CancellationToken,
}

impl DishCard {
    pub fn new(
        dish: Dish,
        documents: Arc<dyn DocumentStore>,
        policy: ReconciliationPolicy,
        feed: MenuFeed,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(CardState {
                dish,
                sync: SyncState::Synced,
                generation: 0,
            })),
            writes: Arc::new(tokio::sync::Mutex::new(())),
            documents,
            policy,
            feed,
            lifetime,
        }
    }

    pub fn dish(&self) -> Dish {
        self.lock().dish.clone()
    }

    pub fn availability(&self) -> bool {
        self.lock().dish.availability
    }

    pub fn label(&self) -> &'static str {
        self.lock().dish.availability_label()
    }

    pub fn sync_state(&self) -> SyncState {
        self.lock().sync
    }

    /// Flip availability locally and persist it in the background.
    ///
    /// The returned handle resolves once the write settled; callers that only
    /// render may drop it.
    pub fn toggle(&self) -> JoinHandle<()> {
        let (id, generation) = {
            let mut s = self.lock();
            s.dish.availability = !s.dish.availability;
            s.generation += 1;
            s.sync = SyncState::Pending;
            (s.dish.id.clone(), s.generation)
        };
        debug!(dish_id = %id, generation, "availability toggled locally");

        let card = self.clone();
        tokio::spawn(async move { card.persist(id, generation).await })
    }

    async fn persist(self, id: String, generation: u64) {
        let _write = tokio::select! {
            biased;
            _ = self.lifetime.cancelled() => return,
            guard = self.writes.lock() => guard,
        };

        let mut attempt: u32 = 0;
        loop {
            let value = {
                let s = self.lock();
                if s.generation != generation {
                    // A newer toggle is queued behind this write and will send the latest value.
                    return;
                }
                s.dish.availability
            };

            let res = tokio::select! {
                biased;
                _ = self.lifetime.cancelled() => return,
                res = repo::set_availability(self.documents.as_ref(), &id, value) => res,
            };
            if self.lifetime.is_cancelled() {
                return;
            }

            let err = match res {
                Ok(()) => {
                    let mut s = self.lock();
                    if s.generation == generation {
                        s.sync = SyncState::Synced;
                    }
                    drop(s);
                    self.feed.bump();
                    debug!(dish_id = %id, availability = value, "availability persisted");
                    return;
                }
                Err(e) => e,
            };

            match self.policy {
                ReconciliationPolicy::Revert => {
                    error!(error = %err, dish_id = %id, "availability update failed; reverting");
                    let mut s = self.lock();
                    if s.generation == generation {
                        s.dish.availability = !value;
                        s.sync = SyncState::Synced;
                    }
                    return;
                }
                ReconciliationPolicy::Retry {
                    attempts,
                    base_delay,
                } => {
                    attempt += 1;
                    if attempt >= attempts {
                        error!(
                            error = %err,
                            dish_id = %id,
                            attempts,
                            "availability update failed; card left unsynced"
                        );
                        let mut s = self.lock();
                        if s.generation == generation {
                            s.sync = SyncState::Unsynced;
                        }
                        return;
                    }
                    let delay = backoff(base_delay, attempt);
                    warn!(error = %err, dish_id = %id, attempt, ?delay, "availability update failed; retrying");
                    tokio::select! {
                        biased;
                        _ = self.lifetime.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(10));
    let jitter_ms = (base.as_millis() as u64 / 2).max(1);
    exp + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryDocumentStore;
    use crate::dishes::model::{Category, NewDish};

    async fn stored_dish(store: &MemoryDocumentStore) -> Dish {
        let id = repo::insert(
            store,
            &NewDish {
                name: "Tacos".into(),
                price: 12.5,
                category: Category::Food,
                image: "https://via.placeholder.com/300".into(),
                description: "Tacos al pastor con piña".into(),
            },
        )
        .await
        .unwrap();
        repo::find(store, &id).await.unwrap().unwrap()
    }

    async fn remote_availability(store: &MemoryDocumentStore, id: &str) -> bool {
        repo::find(store, id).await.unwrap().unwrap().availability
    }

    fn card(
        store: &Arc<MemoryDocumentStore>,
        dish: Dish,
        policy: ReconciliationPolicy,
    ) -> (DishCard, MenuFeed, CancellationToken) {
        let feed = MenuFeed::new();
        let lifetime = CancellationToken::new();
        let documents: Arc<dyn DocumentStore> = store.clone();
        let card = DishCard::new(dish, documents, policy, feed.clone(), lifetime.clone());
        (card, feed, lifetime)
    }

    fn quick_retry(attempts: u32) -> ReconciliationPolicy {
        ReconciliationPolicy::Retry {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn toggle_flips_locally_before_the_write_lands() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dish = stored_dish(&store).await;
        let (card, feed, _lifetime) = card(&store, dish.clone(), ReconciliationPolicy::Revert);

        let handle = card.toggle();
        assert!(!card.availability());
        assert_eq!(card.label(), "No disponible");
        assert_eq!(card.sync_state(), SyncState::Pending);
        assert!(remote_availability(&store, &dish.id).await);

        handle.await.unwrap();
        assert!(!remote_availability(&store, &dish.id).await);
        assert_eq!(card.sync_state(), SyncState::Synced);
        assert_eq!(feed.current(), 1);
    }

    #[tokio::test]
    async fn revert_policy_restores_value_on_failure() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dish = stored_dish(&store).await;
        let (card, feed, _lifetime) = card(&store, dish.clone(), ReconciliationPolicy::Revert);
        store.fail_next_updates(1);

        let handle = card.toggle();
        assert!(!card.availability());
        handle.await.unwrap();

        assert!(card.availability());
        assert_eq!(card.label(), "Disponible");
        assert!(remote_availability(&store, &dish.id).await);
        assert_eq!(feed.current(), 0);
    }

    #[tokio::test]
    async fn retry_policy_recovers_from_transient_failures() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dish = stored_dish(&store).await;
        let (card, _feed, _lifetime) = card(&store, dish.clone(), quick_retry(3));
        store.fail_next_updates(2);

        card.toggle().await.unwrap();

        assert!(!card.availability());
        assert_eq!(card.sync_state(), SyncState::Synced);
        assert!(!remote_availability(&store, &dish.id).await);
    }

    #[tokio::test]
    async fn retry_policy_marks_unsynced_when_attempts_run_out() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dish = stored_dish(&store).await;
        let (card, _feed, _lifetime) = card(&store, dish.clone(), quick_retry(2));
        store.fail_next_updates(5);

        card.toggle().await.unwrap();

        assert!(!card.availability());
        assert_eq!(card.sync_state(), SyncState::Unsynced);
        assert!(remote_availability(&store, &dish.id).await);
    }

    #[tokio::test]
    async fn rapid_toggles_converge_on_the_last_value() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dish = stored_dish(&store).await;
        let (card, _feed, _lifetime) = card(&store, dish.clone(), ReconciliationPolicy::Revert);

        let first = card.toggle();
        let second = card.toggle();
        let third = card.toggle();
        for h in [first, second, third] {
            h.await.unwrap();
        }

        assert!(!card.availability());
        assert_eq!(remote_availability(&store, &dish.id).await, card.availability());
        assert_eq!(card.sync_state(), SyncState::Synced);
    }

    #[tokio::test]
    async fn cancelled_lifetime_drops_the_pending_write() {
        let store = Arc::new(MemoryDocumentStore::new());
        let dish = stored_dish(&store).await;
        let (card, feed, lifetime) = card(&store, dish.clone(), ReconciliationPolicy::Revert);

        let handle = card.toggle();
        lifetime.cancel();
        handle.await.unwrap();

        assert!(!card.availability());
        assert_eq!(card.sync_state(), SyncState::Pending);
        assert!(remote_availability(&store, &dish.id).await);
        assert_eq!(feed.current(), 0);
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let base = Duration::from_millis(100);
        let first = backoff(base, 1);
        let third = backoff(base, 3);
        assert!(first >= Duration::from_millis(200));
        assert!(first <= Duration::from_millis(250));
        assert!(third >= Duration::from_millis(800));
    }
}
