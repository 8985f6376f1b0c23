use crate::book::sample_documents;
use crate::config::{AppConfig, redact_uri};
use crate::errors::DbError;
use crate::logger::AUDIT_TARGET;
use crate::plan::{Step, select, standard_plan};
use crate::runner::{OutputMode, run_session};
use crate::store::{BookStore, MemoryStore, MongoStore};
use std::io::Write;

use super::command::{Backend, Command};

/// Executes one CLI command, writing everything user-facing to `out`.
///
/// # Errors
/// Returns the first configuration, connection or step error.
pub async fn run<W: Write>(cfg: &AppConfig, cmd: Command, out: &mut W) -> Result<(), DbError> {
    match cmd {
        Command::Plan { selection } => {
            let steps = select(standard_plan(), selection)?;
            writeln!(out, "{}", serde_json::to_string_pretty(&steps)?)?;
            Ok(())
        }
        Command::Seed => {
            let store = connect(cfg.require_uri()?, cfg).await?;
            let seeded = seed(&store).await;
            let closed = store.close().await;
            let n = seeded?;
            closed?;
            writeln!(out, "Inserted {n} books into {}", store.namespace())?;
            Ok(())
        }
        Command::Run { backend, seed: want_seed, selection, mode } => {
            let steps = select(standard_plan(), selection)?;
            match backend {
                Backend::Memory => {
                    let store = MemoryStore::with_documents(cfg.database(), cfg.collection(), sample_documents()?);
                    if mode == OutputMode::Human {
                        writeln!(out, "Connected to in-memory {}", store.namespace())?;
                    }
                    session(&store, false, &steps, out, mode).await
                }
                Backend::Mongo => {
                    let store = match connect(cfg.require_uri()?, cfg).await {
                        Ok(store) => store,
                        Err(e) => {
                            closed_notice(out, mode)?;
                            return Err(e);
                        }
                    };
                    if mode == OutputMode::Human {
                        writeln!(out, "Connected to MongoDB")?;
                    }
                    session(&store, want_seed, &steps, out, mode).await
                }
            }
        }
    }
}

async fn connect(uri: &str, cfg: &AppConfig) -> Result<MongoStore, DbError> {
    log::info!("connecting to {}", redact_uri(uri));
    MongoStore::connect(uri, cfg.database(), cfg.collection(), cfg.server_selection_timeout()).await
}

/// Mirrors the line `run_session` prints after closing, for exits before it.
fn closed_notice<W: Write>(out: &mut W, mode: OutputMode) -> Result<(), DbError> {
    if mode == OutputMode::Human {
        writeln!(out, "Connection closed")?;
    }
    Ok(())
}

async fn seed<S: BookStore>(store: &S) -> Result<usize, DbError> {
    let n = store.insert_many(sample_documents()?).await?;
    log::info!(target: AUDIT_TARGET, "seeded {n} books into {}", store.namespace());
    Ok(n)
}

async fn session<S: BookStore, W: Write>(
    store: &S,
    want_seed: bool,
    steps: &[Step],
    out: &mut W,
    mode: OutputMode,
) -> Result<(), DbError> {
    if want_seed && let Err(e) = seed(store).await {
        if let Err(close_err) = store.close().await {
            log::error!("closing {} failed: {close_err}", store.namespace());
        }
        closed_notice(out, mode)?;
        return Err(e);
    }
    let report = run_session(store, steps, out, mode).await?;
    log::info!("{} of {} steps completed", report.completed.len(), steps.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Selection;

    #[tokio::test]
    async fn plan_command_prints_selected_steps() {
        let mut out = Vec::new();
        run(&AppConfig::default(), Command::Plan { selection: Selection::Only(17) }, &mut out).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v.as_array().unwrap().len(), 1);
        assert_eq!(v[0]["op"], "explain");
        assert_eq!(v[0]["verbosity"], "executionStats");
    }

    #[tokio::test]
    async fn mongo_backend_without_uri_is_a_config_error() {
        let mut out = Vec::new();
        let cmd = Command::Run {
            backend: Backend::Mongo,
            seed: false,
            selection: Selection::All,
            mode: OutputMode::Human,
        };
        let err = run(&AppConfig::default(), cmd, &mut out).await.unwrap_err();
        assert!(matches!(err, DbError::Config(_)));
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn memory_backend_runs_whole_plan() {
        let mut out = Vec::new();
        let cmd = Command::Run {
            backend: Backend::Memory,
            seed: false,
            selection: Selection::All,
            mode: OutputMode::Human,
        };
        run(&AppConfig::default(), cmd, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Connected to in-memory plp_bookstore.books"));
        assert!(text.contains("\n17. Explain plan for finding \"1984\":"));
        assert!(text.trim_end().ends_with("Connection closed"));
    }

    #[tokio::test]
    async fn unreachable_server_still_reports_closed() {
        let cfg = AppConfig {
            uri: Some("mongodb://127.0.0.1:1/".into()),
            server_selection_timeout_ms: Some(300),
            ..AppConfig::default()
        };
        let cmd = Command::Run {
            backend: Backend::Mongo,
            seed: false,
            selection: Selection::All,
            mode: OutputMode::Human,
        };
        let mut out = Vec::new();
        let err = run(&cfg, cmd, &mut out).await.unwrap_err();
        assert!(matches!(err, DbError::Mongo(_)));
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains("Connected to MongoDB"));
        assert_eq!(text.trim_end(), "Connection closed");
    }

    #[tokio::test]
    async fn json_mode_keeps_stdout_clean_on_connect_failure() {
        let cfg = AppConfig {
            uri: Some("mongodb://127.0.0.1:1/".into()),
            server_selection_timeout_ms: Some(300),
            ..AppConfig::default()
        };
        let cmd = Command::Run {
            backend: Backend::Mongo,
            seed: true,
            selection: Selection::Only(1),
            mode: OutputMode::Json,
        };
        let mut out = Vec::new();
        assert!(run(&cfg, cmd, &mut out).await.is_err());
        assert!(out.is_empty());
    }
}
