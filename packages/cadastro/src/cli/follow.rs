use anyhow::{Context, Result};
use cadastro_realtime::{
    ConflictDetector, ConflictKind, ConflictState, ConnectionState, RecordClient, RecordError, RecordId,
    RecordSource, RecordView, Resource, StreamProvider,
};
use serde_json::Value;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use super::{failure, report_status, require_session};
use crate::config::FileConfig;

/// `cadastro follow <resource> <id>`: hold one record open the way an edit
/// view does and report what other users do to it.
pub async fn run(config: &FileConfig, resource: Resource, id: String, auto_reload: bool) -> Result<()> {
    let session = require_session(config)?;
    let realtime = config.realtime_config();
    let records = RecordClient::new(&realtime.base_url, session.token.clone())
        .context("Invalid API base URL")?;

    let id = RecordId::from(id);
    let data = records
        .fetch(resource, &id)
        .await
        .with_context(|| format!("Failed to load {resource}/{id}"))?;
    print_record(&data);

    let provider = StreamProvider::new(&realtime);
    let (closed_tx, closed_rx) = oneshot::channel();
    let view = RecordView {
        resource,
        id: id.clone(),
        data,
    };
    let detector = ConflictDetector::open(
        provider.dispatcher(),
        view,
        session.user_id.clone(),
        realtime.deletion_countdown_secs,
        move || {
            let _ = closed_tx.send(());
        },
    );
    let conflicts = detector.watch();

    let status = report_status(provider.watch_state());
    provider.start(session).await;

    eprintln!("following {resource}/{id} (r = reload, d = dismiss, q = quit)");
    let input = BufReader::new(tokio::io::stdin()).lines();
    let follow = Follow {
        detector: &detector,
        records: &records,
        auto_reload,
    };
    let outcome = follow
        .run(conflicts, closed_rx, status, input, tokio::signal::ctrl_c())
        .await;

    drop(detector);
    provider.shutdown().await;
    match outcome? {
        Exit::Closed => println!("record {resource}/{id} was deleted; view closed"),
        Exit::Interrupted => info!("interrupted"),
        Exit::Quit => {}
    }
    Ok(())
}

/// Why the follow loop stopped.
#[derive(Debug, PartialEq, Eq)]
enum Exit {
    /// The deletion countdown closed the view.
    Closed,
    Quit,
    Interrupted,
}

struct Follow<'a> {
    detector: &'a ConflictDetector,
    records: &'a dyn RecordSource,
    auto_reload: bool,
}

impl Follow<'_> {
    /// React to conflict changes and user commands until the view closes, the
    /// stream fails, the user quits or `interrupt` resolves.
    async fn run<R, S, I>(
        &self,
        mut conflicts: watch::Receiver<ConflictState>,
        mut closed_rx: oneshot::Receiver<()>,
        status: S,
        mut input: Lines<R>,
        interrupt: I,
    ) -> Result<Exit>
    where
        R: AsyncBufRead + Unpin,
        S: Future<Output = ConnectionState>,
        I: Future,
    {
        tokio::pin!(status);
        tokio::pin!(interrupt);
        let mut stdin_open = true;

        loop {
            tokio::select! {
                _ = &mut closed_rx => return Ok(Exit::Closed),
                state = &mut status => return Err(failure(&state)),
                changed = conflicts.changed() => {
                    if changed.is_err() {
                        return Ok(Exit::Quit);
                    }
                    let state = conflicts.borrow_and_update().clone();
                    print_conflict(&state);
                    if self.auto_reload && state.kind == ConflictKind::EditedByOther {
                        reload(self.detector, self.records).await;
                    }
                }
                line = input.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(command)) => match command.trim() {
                            "r" => reload(self.detector, self.records).await,
                            "d" => self.detector.dismiss(),
                            "q" => return Ok(Exit::Quit),
                            "" => {}
                            other => eprintln!("unknown command: {other}"),
                        },
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            warn!("stdin closed: {}", e);
                            stdin_open = false;
                        }
                    }
                }
                _ = &mut interrupt => return Ok(Exit::Interrupted),
            }
        }
    }
}

async fn reload(detector: &ConflictDetector, records: &dyn RecordSource) {
    match detector.reload(records).await {
        Ok(()) => print_record(&detector.displayed()),
        Err(RecordError::NotFound { .. }) => eprintln!("record no longer exists"),
        Err(e) => warn!("reload failed: {}", e),
    }
}

fn print_record(data: &Value) {
    match serde_json::to_string_pretty(data) {
        Ok(text) => println!("{text}"),
        Err(_) => println!("{data}"),
    }
}

fn print_conflict(state: &ConflictState) {
    let author = state
        .author_id
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_else(|| "unknown user".to_string());
    let role = state
        .author_role
        .as_deref()
        .map(|r| format!(" ({r})"))
        .unwrap_or_default();

    match state.kind {
        ConflictKind::None => eprintln!("view is current"),
        ConflictKind::EditedByOther => {
            let when = state
                .timestamp
                .map(|t| format!(" at {}", t.format("%H:%M:%S")))
                .unwrap_or_default();
            eprintln!("record changed by {author}{role}{when}; r = reload, d = dismiss");
        }
        ConflictKind::DeletedByOther => {
            let secs = state.close_countdown_seconds.unwrap_or(0);
            eprintln!("record deleted by {author}{role}; editing disabled, closing in {secs}s");
        }
    }
}
