use anyhow::Context;
use serde_json::Value;
use tracing::warn;

use super::model::{Dish, NewDish, COLLECTION};
use crate::backend::documents::{Document, DocumentStore};

/// Store a new dish and return its document id.
pub async fn insert(documents: &dyn DocumentStore, dish: &NewDish) -> anyhow::Result<String> {
    let fields = dish.to_fields()?;
    documents
        .create_document(COLLECTION, fields)
        .await
        .context("create dish document")
}

/// Every dish, in store order. Documents that do not decode are skipped.
pub async fn list_all(documents: &dyn DocumentStore) -> anyhow::Result<Vec<Dish>> {
    let docs = documents
        .list_documents(COLLECTION)
        .await
        .context("list dish documents")?;
    Ok(docs.into_iter().filter_map(decode).collect())
}

pub async fn find(documents: &dyn DocumentStore, id: &str) -> anyhow::Result<Option<Dish>> {
    let doc = documents
        .get_document(COLLECTION, id)
        .await
        .with_context(|| format!("get dish {id}"))?;
    Ok(doc.and_then(decode))
}

pub async fn set_availability(
    documents: &dyn DocumentStore,
    id: &str,
    availability: bool,
) -> anyhow::Result<()> {
    documents
        .update_document_field(COLLECTION, id, "availability", Value::Bool(availability))
        .await
        .with_context(|| format!("update availability of dish {id}"))
}

fn decode(doc: Document) -> Option<Dish> {
    let id = doc.id.clone();
    match Dish::from_document(doc) {
        Ok(dish) => Some(dish),
        Err(e) => {
            warn!(error = %e, dish_id = %id, "skipping malformed dish document");
            None
        }
    }
}
