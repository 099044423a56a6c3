pub mod follow;
pub mod watch;

use anyhow::{Context, Result, bail};
use cadastro_realtime::{ConnectionState, ConnectionStatus, Session};
use tokio::sync::watch as state_watch;
use tracing::{info, warn};

use crate::config::FileConfig;

/// `cadastro config`: the merged configuration as TOML, token masked.
pub fn config_command(config: &FileConfig) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}

pub(crate) fn require_session(config: &FileConfig) -> Result<Session> {
    match config.session() {
        Some(session) => Ok(session),
        None => bail!(
            "no session: pass --user-id and --token, or set CADASTRO_SESSION__USER_ID and CADASTRO_SESSION__TOKEN"
        ),
    }
}

/// Log status transitions until the stream gives up.
///
/// Returns the final state once the status reaches `failed`.
pub(crate) async fn report_status(mut rx: state_watch::Receiver<ConnectionState>) -> ConnectionState {
    let mut last = rx.borrow_and_update().status;
    if last == ConnectionStatus::Failed {
        return rx.borrow().clone();
    }
    loop {
        if rx.changed().await.is_err() {
            return rx.borrow().clone();
        }
        let state = rx.borrow_and_update().clone();
        if state.status == last {
            continue;
        }
        last = state.status;
        match state.status {
            ConnectionStatus::Connected => info!("stream connected"),
            ConnectionStatus::Reconnecting => warn!(
                attempt = state.attempt,
                error = ?state.last_error.as_ref().map(|e| e.to_string()),
                "stream lost, reconnecting"
            ),
            ConnectionStatus::Failed => return state,
            ConnectionStatus::Connecting | ConnectionStatus::Disconnected => {}
        }
    }
}

/// Turn a terminal stream state into the command's error.
pub(crate) fn failure(state: &ConnectionState) -> anyhow::Error {
    if state.session_expired() {
        anyhow::anyhow!("session expired: the server rejected the token")
    } else {
        match &state.last_error {
            Some(e) => anyhow::anyhow!("event stream failed after {} attempts: {e}", state.attempt),
            None => anyhow::anyhow!("event stream failed"),
        }
    }
}
