//! A fixed sequence of MongoDB queries against a bookstore collection:
//! CRUD, projection, sorting, pagination, aggregation, indexing and an
//! explain plan, printed step by step.

pub mod book;
pub mod cli;
pub mod config;
pub mod errors;
pub mod logger;
pub mod plan;
pub mod query;
pub mod runner;
pub mod store;

pub use book::{Book, sample_books, sample_documents};
pub use errors::DbError;
pub use plan::{Operation, Selection, Step, standard_plan};
pub use runner::{OutputMode, Outcome, RunReport, run_session};
pub use store::{BookStore, MemoryStore, MongoStore};
