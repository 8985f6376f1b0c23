mod command;
mod runner;

pub use command::{Backend, Command};
pub use runner::run;
