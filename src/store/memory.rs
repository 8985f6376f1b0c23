use crate::errors::DbError;
use crate::query::{
    self, CmpOp, DeleteReport, Filter, FindSpec, UpdateReport, apply_update, compare_docs,
    eval_filter, get_path, parse_filter, parse_pipeline, parse_projection, parse_sort,
    parse_update, run_pipeline,
};
use bson::{Bson, Document, doc, oid::ObjectId};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::{BookStore, index_name};

const EXPLAIN_VERBOSITIES: [&str; 3] = ["queryPlanner", "executionStats", "allPlansExecution"];

#[derive(Debug, Clone)]
struct IndexEntry {
    name: String,
    keys: Document,
}

/// An in-process collection that understands the same query language as
/// the server for the subset of operators the runner uses.
pub struct MemoryStore {
    database: String,
    collection: String,
    docs: RwLock<Vec<Document>>,
    indexes: RwLock<Vec<IndexEntry>>,
    closed: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new(database: &str, collection: &str) -> Self {
        Self {
            database: database.to_string(),
            collection: collection.to_string(),
            docs: RwLock::new(Vec::new()),
            indexes: RwLock::new(vec![IndexEntry { name: "_id_".into(), keys: doc! {"_id": 1} }]),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a store preloaded with `docs`; documents without `_id` get one.
    #[must_use]
    pub fn with_documents(database: &str, collection: &str, docs: Vec<Document>) -> Self {
        let store = Self::new(database, collection);
        store.docs.write().extend(docs.into_iter().map(with_id));
        store
    }

    /// Current contents, in insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Document> {
        self.docs.read().clone()
    }

    #[must_use]
    pub fn index_names(&self) -> Vec<String> {
        self.indexes.read().iter().map(|i| i.name.clone()).collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), DbError> {
        if self.is_closed() {
            return Err(DbError::Io("store is closed".into()));
        }
        Ok(())
    }

    /// Picks an index whose leading field is matched by equality.
    fn plan_index(&self, filter: &Filter) -> Option<(IndexEntry, String, Bson)> {
        let eq_clauses: Vec<(&String, &Bson)> = match filter {
            Filter::Cmp { path, op: CmpOp::Eq, value } => vec![(path, value)],
            Filter::And(fs) => fs
                .iter()
                .filter_map(|f| match f {
                    Filter::Cmp { path, op: CmpOp::Eq, value } => Some((path, value)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };
        let indexes = self.indexes.read();
        for (path, value) in eq_clauses {
            if let Some(ix) = indexes.iter().find(|ix| ix.keys.keys().next() == Some(path)) {
                return Some((ix.clone(), path.clone(), value.clone()));
            }
        }
        None
    }
}

fn with_id(d: Document) -> Document {
    if d.contains_key("_id") {
        return d;
    }
    let mut out = doc! {"_id": ObjectId::new()};
    for (k, v) in d {
        out.insert(k, v);
    }
    out
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

impl BookStore for MemoryStore {
    fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }

    async fn find(&self, filter: &Document, spec: &FindSpec) -> Result<Vec<Document>, DbError> {
        self.ensure_open()?;
        let filter = parse_filter(filter)?;
        let sort = spec.sort.as_ref().map(parse_sort).transpose()?;
        let projection = spec.projection.as_ref().map(parse_projection).transpose()?;

        let mut docs: Vec<Document> =
            self.docs.read().iter().filter(|d| eval_filter(d, &filter)).cloned().collect();
        if let Some(sort) = &sort {
            docs.sort_by(|a, b| compare_docs(a, b, sort));
        }
        let skip = usize::try_from(spec.skip.unwrap_or(0)).unwrap_or(usize::MAX);
        // a zero limit means no limit; a negative one is treated as its magnitude
        let limit = match spec.limit.map(i64::unsigned_abs) {
            None | Some(0) => usize::MAX,
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };
        let docs = docs.into_iter().skip(skip).take(limit);
        let out: Vec<Document> = match &projection {
            Some(p) => docs.map(|d| query::project(&d, p)).collect(),
            None => docs.collect(),
        };
        log::debug!("memory find on {} returned {} documents", self.namespace(), out.len());
        Ok(out)
    }

    async fn update_one(&self, filter: &Document, update: &Document) -> Result<UpdateReport, DbError> {
        self.ensure_open()?;
        let filter = parse_filter(filter)?;
        let update = parse_update(update)?;
        let mut docs = self.docs.write();
        let Some(target) = docs.iter_mut().find(|d| eval_filter(d, &filter)) else {
            return Ok(UpdateReport::default());
        };
        // a failed update leaves the document untouched
        let mut updated = target.clone();
        let changed = apply_update(&mut updated, &update)?;
        *target = updated;
        Ok(UpdateReport { matched: 1, modified: u64::from(changed) })
    }

    async fn delete_one(&self, filter: &Document) -> Result<DeleteReport, DbError> {
        self.ensure_open()?;
        let filter = parse_filter(filter)?;
        let mut docs = self.docs.write();
        match docs.iter().position(|d| eval_filter(d, &filter)) {
            Some(i) => {
                docs.remove(i);
                Ok(DeleteReport { deleted: 1 })
            }
            None => Ok(DeleteReport::default()),
        }
    }

    async fn aggregate(&self, pipeline: &[Document]) -> Result<Vec<Document>, DbError> {
        self.ensure_open()?;
        let stages = parse_pipeline(pipeline)?;
        run_pipeline(self.snapshot(), &stages)
    }

    async fn create_index(&self, keys: &Document) -> Result<String, DbError> {
        self.ensure_open()?;
        if keys.is_empty() {
            return Err(DbError::QueryError("index key pattern must not be empty".into()));
        }
        parse_sort(keys)?;
        let name = index_name(keys);
        let mut indexes = self.indexes.write();
        match indexes.iter().find(|ix| ix.name == name).map(|ix| ix.keys == *keys) {
            Some(true) => {}
            Some(false) => {
                return Err(DbError::QueryError(format!(
                    "an index named {name} already exists with different keys"
                )));
            }
            None => indexes.push(IndexEntry { name: name.clone(), keys: keys.clone() }),
        }
        Ok(name)
    }

    async fn explain_find(&self, filter: &Document, verbosity: &str) -> Result<Document, DbError> {
        self.ensure_open()?;
        if !EXPLAIN_VERBOSITIES.contains(&verbosity) {
            return Err(DbError::QueryError(format!("unknown explain verbosity: {verbosity}")));
        }
        let start = Instant::now();
        let parsed = parse_filter(filter)?;
        let docs = self.docs.read();
        let (winning_plan, keys_examined, docs_examined, returned) = match self.plan_index(&parsed) {
            Some((ix, path, value)) => {
                let scanned: Vec<&Document> = docs
                    .iter()
                    .filter(|d| get_path(d, &path).is_some_and(|v| query::bson_equal(v, &value)))
                    .collect();
                let returned = scanned.iter().filter(|d| eval_filter(d, &parsed)).count();
                let plan = doc! {
                    "stage": "FETCH",
                    "inputStage": {
                        "stage": "IXSCAN",
                        "keyPattern": ix.keys,
                        "indexName": ix.name,
                        "direction": "forward",
                    },
                };
                (plan, scanned.len(), scanned.len(), returned)
            }
            None => {
                let returned = docs.iter().filter(|d| eval_filter(d, &parsed)).count();
                let plan = doc! {"stage": "COLLSCAN", "filter": filter.clone(), "direction": "forward"};
                (plan, 0, docs.len(), returned)
            }
        };
        let mut out = doc! {
            "queryPlanner": {
                "namespace": self.namespace(),
                "parsedQuery": filter.clone(),
                "winningPlan": winning_plan,
                "rejectedPlans": [],
            },
        };
        if verbosity != "queryPlanner" {
            let millis = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            out.insert(
                "executionStats",
                doc! {
                    "executionSuccess": true,
                    "nReturned": count(returned),
                    "executionTimeMillis": millis,
                    "totalKeysExamined": count(keys_examined),
                    "totalDocsExamined": count(docs_examined),
                },
            );
        }
        out.insert("command", doc! {"find": self.collection.clone(), "filter": filter.clone()});
        Ok(out)
    }

    async fn insert_many(&self, docs: Vec<Document>) -> Result<usize, DbError> {
        self.ensure_open()?;
        let n = docs.len();
        self.docs.write().extend(docs.into_iter().map(with_id));
        Ok(n)
    }

    async fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            log::warn!("memory store {} closed twice", self.namespace());
        }
        Ok(())
    }
}
