use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::{
    card::{DishCard, ReconciliationPolicy},
    repo,
};
use crate::backend::Backend;

/// Revision counter for the dish collection. Writes bump it; mounted lists
/// compare against it to know they are stale.
#[derive(Clone)]
pub struct MenuFeed {
    tx: Arc<watch::Sender<u64>>,
}

impl MenuFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn bump(&self) {
        self.tx.send_modify(|rev| *rev += 1);
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for MenuFeed {
    fn default() -> Self {
        Self::new()
    }
}

pub enum MenuState {
    Loading,
    Loaded(Vec<DishCard>),
}

/// One mounted instance of the dish list.
pub struct MenuList {
    state: MenuState,
    revision: u64,
    lifetime: CancellationToken,
}

impl MenuList {
    /// Fetch every dish once. A failed fetch is logged and leaves the list
    /// loading; it is not retried.
    pub async fn mount(
        backend: &Backend,
        policy: ReconciliationPolicy,
        feed: &MenuFeed,
        lifetime: CancellationToken,
    ) -> Self {
        let revision = feed.current();
        let state = match repo::list_all(backend.documents().as_ref()).await {
            Ok(dishes) => {
                info!(count = dishes.len(), revision, "menu loaded");
                MenuState::Loaded(
                    dishes
                        .into_iter()
                        .map(|dish| {
                            DishCard::new(
                                dish,
                                backend.documents().clone(),
                                policy,
                                feed.clone(),
                                lifetime.child_token(),
                            )
                        })
                        .collect(),
                )
            }
            Err(e) => {
                error!(error = %e, "menu fetch failed");
                MenuState::Loading
            }
        };
        Self {
            state,
            revision,
            lifetime,
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.state, MenuState::Loading)
    }

    pub fn cards(&self) -> &[DishCard] {
        match &self.state {
            MenuState::Loaded(cards) => cards,
            MenuState::Loading => &[],
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_stale(&self, feed: &MenuFeed) -> bool {
        feed.current() != self.revision
    }
}

impl Drop for MenuList {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryDocumentStore, MemoryObjectStore};
    use crate::dishes::model::{Category, NewDish};

    fn backend() -> (Backend, Arc<MemoryDocumentStore>) {
        let docs = Arc::new(MemoryDocumentStore::new());
        let backend = Backend::in_memory(
            "test",
            docs.clone(),
            Arc::new(MemoryObjectStore::new("memory://dishes")),
        );
        (backend, docs)
    }

    fn dish(name: &str) -> NewDish {
        NewDish {
            name: name.into(),
            price: 5.0,
            category: Category::Dessert,
            image: "https://via.placeholder.com/300".into(),
            description: "Postre de la casa".into(),
        }
    }

    #[tokio::test]
    async fn empty_collection_loads_zero_cards() {
        let (backend, _) = backend();
        let feed = MenuFeed::new();
        let list = MenuList::mount(
            &backend,
            ReconciliationPolicy::Revert,
            &feed,
            CancellationToken::new(),
        )
        .await;

        assert!(!list.is_loading());
        assert!(list.cards().is_empty());
    }

    #[tokio::test]
    async fn cards_follow_store_order() {
        let (backend, docs) = backend();
        for name in ["Flan", "Churros", "Arroz con leche"] {
            repo::insert(docs.as_ref(), &dish(name)).await.unwrap();
        }
        let feed = MenuFeed::new();
        let list = MenuList::mount(
            &backend,
            ReconciliationPolicy::Revert,
            &feed,
            CancellationToken::new(),
        )
        .await;

        let names: Vec<String> = list.cards().iter().map(|c| c.dish().name).collect();
        assert_eq!(names, vec!["Flan", "Churros", "Arroz con leche"]);
    }

    #[tokio::test]
    async fn failed_fetch_stays_loading() {
        let (backend, docs) = backend();
        docs.fail_lists(true);
        let feed = MenuFeed::new();
        let list = MenuList::mount(
            &backend,
            ReconciliationPolicy::Revert,
            &feed,
            CancellationToken::new(),
        )
        .await;

        assert!(list.is_loading());
        assert!(list.cards().is_empty());
    }

    #[tokio::test]
    async fn list_goes_stale_after_a_write() {
        let (backend, _) = backend();
        let feed = MenuFeed::new();
        let mut rx = feed.subscribe();
        let list = MenuList::mount(
            &backend,
            ReconciliationPolicy::Revert,
            &feed,
            CancellationToken::new(),
        )
        .await;
        assert!(!list.is_stale(&feed));

        feed.bump();
        assert!(list.is_stale(&feed));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn dropping_the_list_cancels_card_lifetimes() {
        let (backend, docs) = backend();
        repo::insert(docs.as_ref(), &dish("Flan")).await.unwrap();
        let feed = MenuFeed::new();
        let lifetime = CancellationToken::new();
        let list = MenuList::mount(
            &backend,
            ReconciliationPolicy::Revert,
            &feed,
            lifetime.clone(),
        )
        .await;

        drop(list);
        assert!(lifetime.is_cancelled());
    }
}
