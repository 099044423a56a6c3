use anyhow::Result;
use cadastro_realtime::{EventKind, StreamEvent, StreamProvider};
use tracing::info;

use super::{failure, report_status, require_session};
use crate::config::FileConfig;

/// `cadastro watch`: print record events until Ctrl-C or until the stream
/// gives up.
pub async fn run(config: &FileConfig, json: bool) -> Result<()> {
    let session = require_session(config)?;
    let provider = StreamProvider::new(&config.realtime_config());

    let subscriptions: Vec<_> = [
        EventKind::Connected,
        EventKind::RecordCreated,
        EventKind::RecordUpdated,
        EventKind::RecordDeleted,
    ]
    .into_iter()
    .map(|kind| provider.subscribe(kind, move |event| print_event(event, json)))
    .collect();

    let status = report_status(provider.watch_state());
    provider.start(session).await;

    let outcome = tokio::select! {
        state = status => Err(failure(&state)),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    };

    drop(subscriptions);
    provider.shutdown().await;
    let metrics = provider.metrics();
    info!(
        frames = metrics.frames.received,
        dropped = metrics.frames.ignored + metrics.frames.parse_errors,
        reconnects = metrics.connections.reconnect_attempts,
        "stream closed"
    );
    outcome
}

fn print_event(event: &StreamEvent, json: bool) {
    match event {
        StreamEvent::Connected(info) => {
            eprintln!("[connected{}]", info.message.as_deref().map(|m| format!(": {m}")).unwrap_or_default());
        }
        StreamEvent::Heartbeat => {}
        StreamEvent::RecordCreated(env) | StreamEvent::RecordUpdated(env) | StreamEvent::RecordDeleted(env) => {
            if json {
                let line = serde_json::json!({
                    "event": event.kind(),
                    "record": env.record,
                    "authorId": env.author_id,
                    "authorRole": env.author_role,
                    "timestamp": env.timestamp,
                });
                println!("{line}");
            } else {
                println!(
                    "{} {:<14} {:>8} {:<24} by {}{}",
                    env.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.kind().wire_name(),
                    env.record.id.as_str(),
                    env.record.name,
                    env.author_id,
                    env.author_role.as_deref().map(|r| format!(" ({r})")).unwrap_or_default(),
                );
            }
        }
    }
}
