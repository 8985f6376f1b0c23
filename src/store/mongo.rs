use crate::config::redact_uri;
use crate::errors::DbError;
use crate::query::{DeleteReport, FindSpec, UpdateReport};
use bson::{Document, doc};
use futures_util::TryStreamExt;
use mongodb::options::ClientOptions;
use mongodb::{Client, Collection, IndexModel};
use std::time::Duration;

use super::BookStore;

/// A collection on a MongoDB deployment, reached through the official driver.
pub struct MongoStore {
    client: Client,
    database: String,
    books: Collection<Document>,
}

impl MongoStore {
    /// Opens a client and pings the database so that an unreachable
    /// deployment fails here rather than on the first query.
    ///
    /// # Errors
    /// Returns an error if the URI is invalid or the server cannot be reached.
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        server_selection_timeout: Option<Duration>,
    ) -> Result<Self, DbError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
        if let Some(timeout) = server_selection_timeout {
            options.server_selection_timeout = Some(timeout);
        }
        let client = Client::with_options(options)?;
        let db = client.database(database);
        if let Err(e) = db.run_command(doc! {"ping": 1}).await {
            client.shutdown().await;
            log::warn!("ping to {} failed, client shut down", redact_uri(uri));
            return Err(e.into());
        }
        log::info!("connected to {} ({database}.{collection})", redact_uri(uri));
        Ok(Self { books: db.collection::<Document>(collection), client, database: database.to_string() })
    }
}

impl BookStore for MongoStore {
    fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.books.name())
    }

    async fn find(&self, filter: &Document, spec: &FindSpec) -> Result<Vec<Document>, DbError> {
        let mut action = self.books.find(filter.clone());
        if let Some(projection) = &spec.projection {
            action = action.projection(projection.clone());
        }
        if let Some(sort) = &spec.sort {
            action = action.sort(sort.clone());
        }
        if let Some(skip) = spec.skip {
            action = action.skip(skip);
        }
        if let Some(limit) = spec.limit {
            action = action.limit(limit);
        }
        let cursor = action.await?;
        Ok(cursor.try_collect().await?)
    }

    async fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateReport, DbError> {
        let res = self.books.update_one(filter.clone(), update.clone()).await?;
        Ok(UpdateReport { matched: res.matched_count, modified: res.modified_count })
    }

    async fn delete_one(&self, filter: &Document) -> Result<DeleteReport, DbError> {
        let res = self.books.delete_one(filter.clone()).await?;
        Ok(DeleteReport { deleted: res.deleted_count })
    }

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Document>, DbError> {
        let cursor = self.books.aggregate(pipeline.to_vec()).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn create_index(&self, keys: &Document) -> Result<String, DbError> {
        let model = IndexModel::builder().keys(keys.clone()).build();
        let res = self.books.create_index(model).await?;
        Ok(res.index_name)
    }

    async fn explain_find(&self, filter: &Document, verbosity: &str) -> Result<Document, DbError> {
        let command = doc! {
            "explain": {"find": self.books.name(), "filter": filter.clone()},
            "verbosity": verbosity,
        };
        Ok(self.client.database(&self.database).run_command(command).await?)
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<usize, DbError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let res = self.books.insert_many(docs).await?;
        Ok(res.inserted_ids.len())
    }

    async fn close(&self) -> Result<(), DbError> {
        self.client.clone().shutdown().await;
        log::info!("client for {} shut down", self.namespace());
        Ok(())
    }
}
