use cadastro_realtime::{RealtimeConfig, ReconnectPolicy, Session};
use serde::{Deserialize, Serialize};
use std::path::Path;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [api]
//                    base_url = "https://cadastro.example.org/api"
//
//   env var:         CADASTRO_API__BASE_URL=...   (double underscore = nesting)
//
//   (single underscore stays within field names: CADASTRO_REALTIME__IDLE_TIMEOUT_SECS)

/// Top-level configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub realtime: RealtimeFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// REST API location (lives under `[api]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Event stream tunables (lives under `[realtime]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RealtimeFileConfig {
    #[serde(default = "default_events_path")]
    pub events_path: String,
    /// 0 disables the idle watchdog.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_deletion_countdown_secs")]
    pub deletion_countdown_secs: u32,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for RealtimeFileConfig {
    fn default() -> Self {
        Self {
            events_path: default_events_path(),
            idle_timeout_secs: default_idle_timeout_secs(),
            deletion_countdown_secs: default_deletion_countdown_secs(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Credentials (lives under `[session]`; usually supplied via env or flags).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_base_url() -> String {
    RealtimeConfig::default().base_url
}

fn default_events_path() -> String {
    RealtimeConfig::default().events_path
}

fn default_idle_timeout_secs() -> u64 {
    RealtimeConfig::default().idle_timeout_secs
}

fn default_deletion_countdown_secs() -> u32 {
    RealtimeConfig::default().deletion_countdown_secs
}

impl FileConfig {
    pub fn realtime_config(&self) -> RealtimeConfig {
        RealtimeConfig {
            base_url: self.api.base_url.clone(),
            events_path: self.realtime.events_path.clone(),
            reconnect: self.realtime.reconnect.clone(),
            idle_timeout_secs: self.realtime.idle_timeout_secs,
            deletion_countdown_secs: self.realtime.deletion_countdown_secs,
        }
    }

    /// The configured session, if both user id and token are present.
    pub fn session(&self) -> Option<Session> {
        let user_id = self.session.user_id.as_deref().filter(|s| !s.is_empty())?;
        let token = self.session.token.as_deref().filter(|s| !s.is_empty())?;
        Some(Session::new(user_id, token))
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.session.token.is_some() {
            copy.session.token = Some("***".to_string());
        }
        copy
    }
}

/// Layer defaults, `<config_dir>/config.toml` and `CADASTRO_*` env vars.
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CADASTRO_").split("__"))
}
