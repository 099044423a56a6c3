//! Single-record lookups against the REST API, used to reload a view after a
//! conflict.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use crate::error::RecordError;
use crate::event::RecordId;

/// Registry resources that can be shown in an edit view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Pessoas,
    Comunidades,
    Beneficios,
    Usuarios,
    GuaraunaAlunos,
    GuaraunaProfessores,
    GuaraunaResponsaveis,
    GuaraunaTurmas,
    GuaraunaMatriculas,
    GuaraunaEventos,
}

impl Resource {
    pub const ALL: [Resource; 10] = [
        Resource::Pessoas,
        Resource::Comunidades,
        Resource::Beneficios,
        Resource::Usuarios,
        Resource::GuaraunaAlunos,
        Resource::GuaraunaProfessores,
        Resource::GuaraunaResponsaveis,
        Resource::GuaraunaTurmas,
        Resource::GuaraunaMatriculas,
        Resource::GuaraunaEventos,
    ];

    /// Path segments under the API base URL.
    pub fn path(&self) -> &'static [&'static str] {
        match self {
            Self::Pessoas => &["pessoas"],
            Self::Comunidades => &["comunidades"],
            Self::Beneficios => &["beneficios"],
            Self::Usuarios => &["usuarios"],
            Self::GuaraunaAlunos => &["guarauna", "alunos"],
            Self::GuaraunaProfessores => &["guarauna", "professores"],
            Self::GuaraunaResponsaveis => &["guarauna", "responsaveis"],
            Self::GuaraunaTurmas => &["guarauna", "turmas"],
            Self::GuaraunaMatriculas => &["guarauna", "matriculas"],
            Self::GuaraunaEventos => &["guarauna", "eventos"],
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path().join("/"))
    }
}

impl FromStr for Resource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim_matches('/').to_ascii_lowercase().replace('-', "/");
        Self::ALL
            .into_iter()
            .find(|r| r.to_string() == wanted)
            .ok_or_else(|| format!("unknown resource: {s}"))
    }
}

/// Fetches the current server copy of a record.
pub trait RecordSource: Send + Sync {
    fn fetch(&self, resource: Resource, id: &RecordId) -> BoxFuture<'static, Result<Value, RecordError>>;
}

impl<T: RecordSource + ?Sized> RecordSource for Arc<T> {
    fn fetch(&self, resource: Resource, id: &RecordId) -> BoxFuture<'static, Result<Value, RecordError>> {
        (**self).fetch(resource, id)
    }
}

/// `GET <base>/<resource>/<id>` with a bearer token.
#[derive(Clone)]
pub struct RecordClient {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

impl RecordClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, RecordError> {
        Self::with_client(reqwest::Client::new(), base_url, token)
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        token: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let base_url =
            Url::parse(base_url).map_err(|e| RecordError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(RecordError::InvalidUrl(base_url.to_string()));
        }
        Ok(Self {
            client,
            base_url,
            token: token.into(),
        })
    }

    pub fn record_url(&self, resource: Resource, id: &RecordId) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(resource.path());
            segments.push(id.as_str());
        }
        url
    }
}

impl RecordSource for RecordClient {
    fn fetch(&self, resource: Resource, id: &RecordId) -> BoxFuture<'static, Result<Value, RecordError>> {
        let url = self.record_url(resource, id);
        let request = self.client.get(url).bearer_auth(&self.token);
        let id = id.clone();

        Box::pin(async move {
            debug!(%resource, %id, "fetching record");
            let response = request.send().await?;
            match response.status() {
                StatusCode::NOT_FOUND => Err(RecordError::NotFound {
                    resource: resource.to_string(),
                    id: id.to_string(),
                }),
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RecordError::SessionExpired),
                status if !status.is_success() => Err(RecordError::Status {
                    resource: resource.to_string(),
                    id: id.to_string(),
                    status: status.as_u16(),
                }),
                _ => Ok(response.json::<Value>().await?),
            }
        })
    }
}
