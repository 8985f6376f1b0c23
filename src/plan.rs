//! The ordered list of queries the runner executes.
//!
//! Each step is a self-contained descriptor: a label plus the literal
//! filter / update / pipeline it sends. Steps do not read each other's
//! results, so any one of them can be executed on its own.

use crate::errors::DbError;
use crate::query::FindSpec;
use bson::{Document, doc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Find { filter: Document, options: FindSpec },
    UpdateOne { filter: Document, update: Document },
    DeleteOne { filter: Document },
    Aggregate { pipeline: Vec<Document> },
    CreateIndex { keys: Document },
    Explain { filter: Document, verbosity: String },
}

impl Operation {
    /// Whether running the operation changes documents or index metadata.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        matches!(self, Self::UpdateOne { .. } | Self::DeleteOne { .. } | Self::CreateIndex { .. })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Find { .. } => "find",
            Self::UpdateOne { .. } => "update_one",
            Self::DeleteOne { .. } => "delete_one",
            Self::Aggregate { .. } => "aggregate",
            Self::CreateIndex { .. } => "create_index",
            Self::Explain { .. } => "explain",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub number: usize,
    pub label: String,
    #[serde(flatten)]
    pub op: Operation,
}

fn find(filter: Document) -> Operation {
    Operation::Find { filter, options: FindSpec::default() }
}

fn find_all(options: FindSpec) -> Operation {
    Operation::Find { filter: doc! {}, options }
}

/// The exercise sequence, numbered from 1.
#[must_use]
pub fn standard_plan() -> Vec<Step> {
    let ops: Vec<(&str, Operation)> = vec![
        // Basic CRUD
        ("Find all books in Fiction", find(doc! {"genre": "Fiction"})),
        ("Find books published after 2000", find(doc! {"published_year": {"$gt": 2000}})),
        ("Find books by George Orwell", find(doc! {"author": "George Orwell"})),
        (
            "Update price of \"1984\" to 15.99",
            Operation::UpdateOne { filter: doc! {"title": "1984"}, update: doc! {"$set": {"price": 15.99}} },
        ),
        ("Delete book \"Moby Dick\"", Operation::DeleteOne { filter: doc! {"title": "Moby Dick"} }),
        // Advanced queries
        (
            "Books in stock and published after 2010",
            find(doc! {"in_stock": true, "published_year": {"$gt": 2010}}),
        ),
        (
            "Projection (title, author, price)",
            find_all(FindSpec::default().project(doc! {"title": 1, "author": 1, "price": 1})),
        ),
        ("Sort by price ascending", find_all(FindSpec::default().sort(doc! {"price": 1}))),
        ("Sort by price descending", find_all(FindSpec::default().sort(doc! {"price": -1}))),
        ("Pagination - Page 1 (5 books)", find_all(FindSpec::default().limit(5))),
        ("Pagination - Page 2 (5 books)", find_all(FindSpec::default().skip(5).limit(5))),
        // Aggregation
        (
            "Average price by genre",
            Operation::Aggregate {
                pipeline: vec![doc! {"$group": {"_id": "$genre", "avgPrice": {"$avg": "$price"}}}],
            },
        ),
        (
            "Author with the most books",
            Operation::Aggregate {
                pipeline: vec![
                    doc! {"$group": {"_id": "$author", "bookCount": {"$sum": 1}}},
                    doc! {"$sort": {"bookCount": -1}},
                    doc! {"$limit": 1},
                ],
            },
        ),
        (
            "Books grouped by decade",
            Operation::Aggregate {
                // yields floor(year / 10), e.g. 194 for 1949, not the decade's first year
                pipeline: vec![
                    doc! {"$project": {"decade": {"$subtract": [
                        {"$divide": ["$published_year", 10]},
                        {"$mod": [{"$divide": ["$published_year", 10]}, 1]},
                    ]}}},
                    doc! {"$group": {"_id": "$decade", "count": {"$sum": 1}}},
                    doc! {"$sort": {"_id": 1}},
                ],
            },
        ),
        // Indexing
        ("Creating index on title", Operation::CreateIndex { keys: doc! {"title": 1} }),
        (
            "Creating compound index on author & published_year",
            Operation::CreateIndex { keys: doc! {"author": 1, "published_year": -1} },
        ),
        (
            "Explain plan for finding \"1984\"",
            Operation::Explain { filter: doc! {"title": "1984"}, verbosity: "executionStats".into() },
        ),
    ];
    ops.into_iter()
        .enumerate()
        .map(|(i, (label, op))| Step { number: i + 1, label: label.to_string(), op })
        .collect()
}

/// Which part of a plan to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Selection {
    #[default]
    All,
    Only(usize),
    From(usize),
}

/// Narrows a plan to a selection, keeping order.
///
/// # Errors
/// Returns `DbError::Config` if the requested step number does not exist.
pub fn select(steps: Vec<Step>, selection: Selection) -> Result<Vec<Step>, DbError> {
    let last = steps.len();
    let check = |n: usize| {
        if n == 0 || n > last {
            Err(DbError::Config(format!("step {n} out of range 1..={last}")))
        } else {
            Ok(n)
        }
    };
    Ok(match selection {
        Selection::All => steps,
        Selection::Only(n) => {
            let n = check(n)?;
            steps.into_iter().filter(|s| s.number == n).collect()
        }
        Selection::From(n) => {
            let n = check(n)?;
            steps.into_iter().filter(|s| s.number >= n).collect()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_has_seventeen_numbered_steps() {
        let plan = standard_plan();
        assert_eq!(plan.len(), 17);
        assert!(plan.iter().enumerate().all(|(i, s)| s.number == i + 1));
        let mutations: Vec<usize> = plan.iter().filter(|s| s.op.is_mutation()).map(|s| s.number).collect();
        assert_eq!(mutations, vec![4, 5, 15, 16]);
    }

    #[test]
    fn select_only_and_from() {
        let only = select(standard_plan(), Selection::Only(4)).unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].label, "Update price of \"1984\" to 15.99");
        let tail = select(standard_plan(), Selection::From(15)).unwrap();
        assert_eq!(tail.iter().map(|s| s.number).collect::<Vec<_>>(), vec![15, 16, 17]);
        assert!(select(standard_plan(), Selection::Only(18)).is_err());
        assert!(select(standard_plan(), Selection::From(0)).is_err());
    }

    #[test]
    fn plan_serializes_with_operation_tag() {
        let v = serde_json::to_value(&standard_plan()[1]).unwrap();
        assert_eq!(v["op"], "find");
        assert_eq!(v["number"], 2);
        assert_eq!(v["filter"]["published_year"]["$gt"], 2000);
    }
}
