use std::{ops::Deref, sync::Arc};

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use super::types::StoredObject;
use crate::error::AppError;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

pub trait ProvidesDb {
    fn db(&self) -> &Arc<SurrealDbClient>;
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Define the tables and indexes the tracker and cache rely on.
    /// Idempotent; runs at every startup.
    pub async fn ensure_initialized(&self) -> Result<(), AppError> {
        self.client
            .query(
                "DEFINE TABLE IF NOT EXISTS source SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS idx_source_path ON TABLE source FIELDS path UNIQUE;
                 DEFINE TABLE IF NOT EXISTS chunk_record SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS idx_chunk_record_source ON TABLE chunk_record FIELDS source_path;
                 DEFINE INDEX IF NOT EXISTS idx_chunk_record_superseded ON TABLE chunk_record FIELDS superseded_at;
                 DEFINE TABLE IF NOT EXISTS causal_link SCHEMALESS;
                 DEFINE INDEX IF NOT EXISTS idx_causal_from ON TABLE causal_link FIELDS from_chunk;
                 DEFINE TABLE IF NOT EXISTS cache_entry SCHEMALESS;",
            )
            .await?
            .check()?;

        Ok(())
    }

    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    /// Create-or-replace by id.
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
