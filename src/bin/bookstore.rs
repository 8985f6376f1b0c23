use bookstore_queries::cli::{self as prog_cli, Backend};
use bookstore_queries::config::{AppConfig, load_config};
use bookstore_queries::logger;
use bookstore_queries::plan::Selection;
use bookstore_queries::runner::OutputMode;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "bookstore", version, about = "Runs the bookstore query exercises against MongoDB")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Connection string; overrides MONGODB_ATLAS_URI
    #[arg(long, global = true)]
    uri: Option<String>,
    #[arg(long, global = true)]
    db: Option<String>,
    #[arg(long, global = true)]
    collection: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Default)]
struct StepArgs {
    /// Run a single step
    #[arg(long, conflicts_with = "from")]
    only: Option<usize>,
    /// Run from this step to the end
    #[arg(long)]
    from: Option<usize>,
}

impl StepArgs {
    fn selection(&self) -> Selection {
        match (self.only, self.from) {
            (Some(n), _) => Selection::Only(n),
            (None, Some(n)) => Selection::From(n),
            (None, None) => Selection::All,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the query sequence (default)
    Run {
        /// Use an in-process collection preloaded with the sample books
        #[arg(long, conflicts_with = "seed")]
        memory: bool,
        /// Insert the sample books before running
        #[arg(long)]
        seed: bool,
        /// One JSON object per step instead of pretty output
        #[arg(long)]
        json: bool,
        #[command(flatten)]
        steps: StepArgs,
    },
    /// Print the steps as JSON without connecting
    Plan {
        #[command(flatten)]
        steps: StepArgs,
    },
    /// Insert the sample books into the collection
    Seed,
}

fn init_logging(cfg: &AppConfig) {
    if let Err(e) = logger::configure_from_config(cfg) {
        eprintln!("warning: logging disabled: {e}");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let overrides = AppConfig { uri: cli.uri, database: cli.db, collection: cli.collection, ..AppConfig::default() };
    let cfg = match load_config(overrides, cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&cfg);

    let cmd = match cli.command.unwrap_or(Commands::Run {
        memory: false,
        seed: false,
        json: false,
        steps: StepArgs::default(),
    }) {
        Commands::Run { memory, seed, json, steps } => prog_cli::Command::Run {
            backend: if memory { Backend::Memory } else { Backend::Mongo },
            seed,
            selection: steps.selection(),
            mode: if json { OutputMode::Json } else { OutputMode::Human },
        },
        Commands::Plan { steps } => prog_cli::Command::Plan { selection: steps.selection() },
        Commands::Seed => prog_cli::Command::Seed,
    };

    let mut stdout = std::io::stdout().lock();
    match prog_cli::run(&cfg, cmd, &mut stdout).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
