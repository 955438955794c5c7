use anyhow::Context;
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::{types::Json, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

pub type Fields = Map<String, Value>;

/// One stored document: the store-assigned id plus its field map.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub fields: Fields,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn create_document(&self, collection: &str, fields: Fields) -> anyhow::Result<String>;
    /// All documents of a collection, in insertion order.
    async fn list_documents(&self, collection: &str) -> anyhow::Result<Vec<Document>>;
    async fn get_document(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>>;
    /// Partial update of a single top-level field. Unknown ids are an error.
    async fn update_document_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> anyhow::Result<()>;
}

pub fn new_document_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Documents kept in one JSONB table, namespaced by project.
#[derive(Clone)]
pub struct PgDocumentStore {
    db: PgPool,
    project: String,
}

impl PgDocumentStore {
    pub fn new(db: PgPool, project: impl Into<String>) -> Self {
        Self {
            db,
            project: project.into(),
        }
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn create_document(&self, collection: &str, fields: Fields) -> anyhow::Result<String> {
        let id = new_document_id();
        sqlx::query(
            r#"
            INSERT INTO documents (project, collection, id, fields)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&self.project)
        .bind(collection)
        .bind(&id)
        .bind(Json(fields))
        .execute(&self.db)
        .await
        .with_context(|| format!("insert document into {collection}"))?;
        Ok(id)
    }

    async fn list_documents(&self, collection: &str) -> anyhow::Result<Vec<Document>> {
        let rows = sqlx::query_as::<_, (String, Json<Fields>)>(
            r#"
            SELECT id, fields
              FROM documents
             WHERE project = $1 AND collection = $2
             ORDER BY seq ASC
            "#,
        )
        .bind(&self.project)
        .bind(collection)
        .fetch_all(&self.db)
        .await
        .with_context(|| format!("list documents in {collection}"))?;

        Ok(rows
            .into_iter()
            .map(|(id, Json(fields))| Document { id, fields })
            .collect())
    }

    async fn get_document(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>> {
        let row = sqlx::query_as::<_, (String, Json<Fields>)>(
            r#"
            SELECT id, fields
              FROM documents
             WHERE project = $1 AND collection = $2 AND id = $3
            "#,
        )
        .bind(&self.project)
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.db)
        .await
        .with_context(|| format!("get document {collection}/{id}"))?;

        Ok(row.map(|(id, Json(fields))| Document { id, fields }))
    }

    async fn update_document_field(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> anyhow::Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE documents
               SET fields = jsonb_set(fields, ARRAY[$4::text], $5, true),
                   updated_at = $6
             WHERE project = $1 AND collection = $2 AND id = $3
            "#,
        )
        .bind(&self.project)
        .bind(collection)
        .bind(id)
        .bind(field)
        .bind(Json(value))
        .bind(OffsetDateTime::now_utc())
        .execute(&self.db)
        .await
        .with_context(|| format!("update {collection}/{id}.{field}"))?;

        anyhow::ensure!(
            res.rows_affected() > 0,
            "document {collection}/{id} not found"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::new_document_id;

    #[test]
    fn document_ids_are_opaque_and_unique() {
        let a = new_document_id();
        let b = new_document_id();
        assert_eq!(a.len(), 32);
        assert!(!a.contains('-'));
        assert_ne!(a, b);
    }
}
