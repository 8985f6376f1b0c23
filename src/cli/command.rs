use crate::plan::Selection;
use crate::runner::OutputMode;

/// Where the queries are sent.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum Backend {
    /// The MongoDB deployment named by the configured connection string.
    #[default]
    Mongo,
    /// An in-process collection preloaded with the sample books.
    Memory,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Connect, run the selected steps, close.
    Run {
        backend: Backend,
        // insert the sample books before the first step
        seed: bool,
        selection: Selection,
        mode: OutputMode,
    },
    /// Print the selected steps as JSON without connecting.
    Plan { selection: Selection },
    /// Insert the sample books into the configured collection.
    Seed,
}
