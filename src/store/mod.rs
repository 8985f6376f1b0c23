//! The collaborator seam: everything the runner needs from a document
//! database, one method per primitive.

mod memory;
mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use crate::errors::DbError;
use crate::query::{DeleteReport, FindSpec, UpdateReport};
use bson::{Bson, Document};

/// A single collection in a document database.
///
/// Handles are used by one task at a time; `close` releases the
/// underlying connection and must be called exactly once.
#[allow(async_fn_in_trait)]
pub trait BookStore {
    /// `database.collection`, as reported in explain output and logs.
    fn namespace(&self) -> String;

    async fn find(&self, filter: &Document, spec: &FindSpec) -> Result<Vec<Document>, DbError>;

    async fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateReport, DbError>;

    async fn delete_one(&self, filter: &Document) -> Result<DeleteReport, DbError>;

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Document>, DbError>;

    /// Creates an index with the given key pattern and returns its name.
    async fn create_index(&self, keys: &Document) -> Result<String, DbError>;

    async fn explain_find(&self, filter: &Document, verbosity: &str) -> Result<Document, DbError>;

    async fn insert_many(&self, docs: Vec<Document>) -> Result<usize, DbError>;

    async fn close(&self) -> Result<(), DbError>;
}

/// Default index name for a key pattern, e.g. `author_1_published_year_-1`.
#[must_use]
pub fn index_name(keys: &Document) -> String {
    keys.iter()
        .map(|(field, dir)| {
            let dir = match dir {
                Bson::Int32(i) => i.to_string(),
                Bson::Int64(i) => i.to_string(),
                Bson::Double(f) => format!("{f}"),
                Bson::String(s) => s.clone(),
                other => other.to_string(),
            };
            format!("{field}_{dir}")
        })
        .collect::<Vec<_>>()
        .join("_")
}
