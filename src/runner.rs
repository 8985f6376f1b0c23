//! Executes plan steps against a store, strictly in order.
//!
//! The first failing step aborts the rest. [`run_session`] closes the store
//! on every path.

use crate::errors::DbError;
use crate::logger::AUDIT_TARGET;
use crate::plan::{Operation, Step};
use crate::query::{DeleteReport, UpdateReport};
use crate::store::BookStore;
use bson::{Bson, Document, doc};
use std::io::Write;
use std::time::Instant;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum OutputMode {
    /// A blank line, the label, then the pretty-printed result.
    #[default]
    Human,
    /// One JSON object per step.
    Json,
}

/// What a step produced, in the shape the database returned it.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Documents(Vec<Document>),
    Updated(UpdateReport),
    Deleted(DeleteReport),
    IndexCreated(String),
    Plan(Document),
}

impl Outcome {
    #[must_use]
    pub fn to_bson(&self) -> Bson {
        match self {
            Self::Documents(docs) => Bson::Array(docs.iter().cloned().map(Bson::Document).collect()),
            Self::Updated(r) => Bson::Document(doc! {
                "acknowledged": true,
                "matchedCount": u64_to_i64(r.matched),
                "modifiedCount": u64_to_i64(r.modified),
            }),
            Self::Deleted(r) => Bson::Document(doc! {
                "acknowledged": true,
                "deletedCount": u64_to_i64(r.deleted),
            }),
            Self::IndexCreated(name) => Bson::String(name.clone()),
            Self::Plan(d) => Bson::Document(d.clone()),
        }
    }

    /// Short description for logs.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Documents(docs) => format!("{} documents", docs.len()),
            Self::Updated(r) => format!("matched={} modified={}", r.matched, r.modified),
            Self::Deleted(r) => format!("deleted={}", r.deleted),
            Self::IndexCreated(name) => format!("index={name}"),
            Self::Plan(_) => "plan".to_string(),
        }
    }
}

fn u64_to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Runs one operation; no output, no retries.
///
/// # Errors
/// Returns whatever the store reports.
pub async fn execute<S: BookStore>(store: &S, op: &Operation) -> Result<Outcome, DbError> {
    Ok(match op {
        Operation::Find { filter, options } => Outcome::Documents(store.find(filter, options).await?),
        Operation::UpdateOne { filter, update } => Outcome::Updated(store.update_one(filter, update).await?),
        Operation::DeleteOne { filter } => Outcome::Deleted(store.delete_one(filter).await?),
        Operation::Aggregate { pipeline } => Outcome::Documents(store.aggregate(pipeline).await?),
        Operation::CreateIndex { keys } => Outcome::IndexCreated(store.create_index(keys).await?),
        Operation::Explain { filter, verbosity } => Outcome::Plan(store.explain_find(filter, verbosity).await?),
    })
}

fn render(value: Bson) -> Result<String, DbError> {
    Ok(serde_json::to_string_pretty(&value.into_relaxed_extjson())?)
}

/// Steps that completed, with what they produced.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunReport {
    pub completed: Vec<(usize, Outcome)>,
}

/// Executes `steps` in order, writing each result to `out`. Stops at the
/// first failure and returns it wrapped with the step's number and label.
///
/// # Errors
/// Returns `DbError::StepFailed` for the first failing step, or an I/O error
/// if the sink cannot be written.
pub async fn run_steps<S: BookStore, W: Write>(
    store: &S,
    steps: &[Step],
    out: &mut W,
    mode: OutputMode,
) -> Result<RunReport, DbError> {
    let mut report = RunReport::default();
    for step in steps {
        if mode == OutputMode::Human {
            writeln!(out, "\n{}. {}:", step.number, step.label)?;
        }
        let started = Instant::now();
        let outcome = execute(store, &step.op).await.map_err(|e| {
            log::error!("step {} ({}) failed: {e}", step.number, step.label);
            DbError::StepFailed { step: step.number, label: step.label.clone(), source: Box::new(e) }
        })?;
        let elapsed_ms = started.elapsed().as_millis();
        log::info!(
            "step {} {} on {} finished in {elapsed_ms} ms: {}",
            step.number,
            step.op.name(),
            store.namespace(),
            outcome.summary()
        );
        if step.op.is_mutation() {
            log::info!(target: AUDIT_TARGET, "{} {}: {}", step.op.name(), step.label, outcome.summary());
        }
        match mode {
            OutputMode::Human => writeln!(out, "{}", render(outcome.to_bson())?)?,
            OutputMode::Json => {
                let line = serde_json::json!({
                    "step": step.number,
                    "label": step.label,
                    "result": outcome.to_bson().into_relaxed_extjson(),
                });
                writeln!(out, "{line}")?;
            }
        }
        report.completed.push((step.number, outcome));
    }
    Ok(report)
}

/// Runs `steps` and then closes `store`, whether or not a step failed.
/// A step failure takes precedence over a failure to close.
///
/// # Errors
/// See [`run_steps`]; otherwise the error from closing the store.
pub async fn run_session<S: BookStore, W: Write>(
    store: &S,
    steps: &[Step],
    out: &mut W,
    mode: OutputMode,
) -> Result<RunReport, DbError> {
    let result = run_steps(store, steps, out, mode).await;
    let closed = store.close().await;
    if let Err(e) = &closed {
        log::error!("closing {} failed: {e}", store.namespace());
    }
    if mode == OutputMode::Human {
        writeln!(out, "Connection closed")?;
    }
    let report = result?;
    closed?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::standard_plan;
    use crate::store::MemoryStore;

    fn fixture() -> MemoryStore {
        MemoryStore::with_documents(
            "plp_bookstore",
            "books",
            vec![
                doc! {"title": "1984", "author": "George Orwell", "genre": "Dystopian", "published_year": 1949, "price": 10.99, "in_stock": true},
                doc! {"title": "Moby Dick", "author": "Herman Melville", "genre": "Adventure", "published_year": 1851, "price": 12.5, "in_stock": false},
            ],
        )
    }

    fn find_step(number: usize, label: &str) -> Step {
        Step {
            number,
            label: label.into(),
            op: Operation::Find { filter: doc! {}, options: crate::query::FindSpec::default() },
        }
    }

    #[tokio::test]
    async fn failing_step_aborts_rest_and_still_closes() {
        let store = fixture();
        let steps = vec![
            find_step(1, "first"),
            Step { number: 2, label: "broken".into(), op: Operation::Aggregate { pipeline: vec![doc! {"$bogus": {}}] } },
            find_step(3, "never"),
        ];
        let mut out = Vec::new();
        let err = run_session(&store, &steps, &mut out, OutputMode::Human).await.unwrap_err();
        assert!(matches!(err, DbError::StepFailed { step: 2, .. }));
        assert!(err.to_string().starts_with("Step 2 (broken) failed:"));
        assert!(store.is_closed());
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\n1. first:"));
        assert!(text.contains("\n2. broken:"));
        assert!(!text.contains("never"));
        assert!(text.trim_end().ends_with("Connection closed"));
    }

    #[tokio::test]
    async fn json_mode_prints_one_object_per_step() {
        let store = fixture();
        let steps: Vec<Step> = standard_plan().into_iter().filter(|s| [4, 5].contains(&s.number)).collect();
        let mut out = Vec::new();
        let report = run_session(&store, &steps, &mut out, OutputMode::Json).await.unwrap();
        assert_eq!(report.completed.len(), 2);
        let lines: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 4);
        assert_eq!(lines[0]["result"]["matchedCount"], 1);
        assert_eq!(lines[0]["result"]["modifiedCount"], 1);
        assert_eq!(lines[1]["label"], "Delete book \"Moby Dick\"");
        assert_eq!(lines[1]["result"]["deletedCount"], 1);
    }

    #[tokio::test]
    async fn steps_run_in_isolation() {
        let store = fixture();
        let explain = standard_plan().pop().unwrap();
        let outcome = execute(&store, &explain.op).await.unwrap();
        let Outcome::Plan(plan) = outcome else { panic!("expected a plan") };
        assert_eq!(plan.get_document("executionStats").unwrap().get_i64("nReturned").unwrap(), 1);
    }
}
