use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{CoordinatorError, Result};
use crate::relay::{MESSAGE_ID_HEADER, Relay, RelayMessage};

const COMPLETION_WAIT: Duration = Duration::from_secs(60);

/// HTTP client for the relay server.
#[derive(Clone)]
pub struct RelayClient {
    server: String,
    http: reqwest::Client,
    poll_interval: Duration,
}

impl RelayClient {
    pub fn new(server: &str) -> Self {
        RelayClient {
            server: server.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// Client for the configured relay, polling at the configured interval.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(&config.relay_server).with_poll_interval(config.timeouts.poll_interval)
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.server, path)
    }

    fn scoped(builder: reqwest::RequestBuilder, scope: Option<&str>) -> reqwest::RequestBuilder {
        match scope {
            Some(id) => builder.header(MESSAGE_ID_HEADER, id),
            None => builder,
        }
    }

    async fn get_parties(&self, path: &str) -> Result<Vec<String>> {
        let resp = self
            .http
            .get(self.url(path))
            .send()
            .await
            .map_err(relay_err)?;
        check_status(resp.status(), &format!("GET {path}"), false)?;
        resp.json::<Vec<String>>().await.map_err(relay_err)
    }

    async fn post_parties(&self, path: &str, parties: &[&str]) -> Result<()> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&parties)
            .send()
            .await
            .map_err(relay_err)?;
        check_status(resp.status(), &format!("POST {path}"), false)?;
        Ok(())
    }

    /// `None` while the setup message is not yet available.
    async fn get_setup_message(&self, session_id: &str, scope: Option<&str>) -> Result<Option<String>> {
        let builder = self.http.get(self.url(&format!("setup-message/{session_id}")));
        let resp = Self::scoped(builder, scope).send().await.map_err(relay_err)?;

        if !check_status(resp.status(), &format!("GET setup-message/{session_id}"), true)? {
            return Ok(None);
        }
        let body = resp.text().await.map_err(relay_err)?;
        Ok((!body.is_empty()).then_some(body))
    }
}

#[async_trait]
impl Relay for RelayClient {
    async fn register_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        self.post_parties(session_id, &[party_id]).await
    }

    async fn wait_for_session_start(
        &self,
        session_id: &str,
        wait: Duration,
    ) -> Result<Vec<String>> {
        let path = format!("start/{session_id}");
        let poll = async {
            loop {
                match self.get_parties(&path).await {
                    Ok(parties) if session_started(&parties) => return parties,
                    Ok(parties) => debug!(session_id, joined = parties.len(), "session not started yet"),
                    Err(e) => warn!(session_id, error = %e, "failed to poll session start"),
                }
                sleep(self.poll_interval).await;
            }
        };

        timeout(wait, poll).await.map_err(|_| {
            CoordinatorError::Timeout(format!("session {session_id} did not start within {wait:?}"))
        })
    }

    async fn wait_for_setup_message(
        &self,
        session_id: &str,
        scope: Option<&str>,
        wait: Duration,
    ) -> Result<String> {
        let poll = async {
            loop {
                match self.get_setup_message(session_id, scope).await {
                    Ok(Some(body)) => return body,
                    Ok(None) => {}
                    Err(e) => warn!(session_id, ?scope, error = %e, "failed to fetch setup message"),
                }
                sleep(self.poll_interval).await;
            }
        };

        timeout(wait, poll).await.map_err(|_| {
            CoordinatorError::Timeout(format!(
                "setup message for session {session_id} not available within {wait:?}"
            ))
        })
    }

    async fn upload_message(&self, message: &RelayMessage, scope: Option<&str>) -> Result<()> {
        let builder = self
            .http
            .post(self.url(&format!("message/{}", message.session_id)))
            .json(message);
        let resp = Self::scoped(builder, scope).send().await.map_err(relay_err)?;
        check_status(resp.status(), "upload message", false)?;
        Ok(())
    }

    async fn download_messages(
        &self,
        session_id: &str,
        party_id: &str,
        scope: Option<&str>,
    ) -> Result<Vec<RelayMessage>> {
        let builder = self
            .http
            .get(self.url(&format!("message/{session_id}/{party_id}")));
        let resp = Self::scoped(builder, scope).send().await.map_err(relay_err)?;

        if !check_status(resp.status(), "download messages", true)? {
            return Ok(Vec::new());
        }
        resp.json().await.map_err(relay_err)
    }

    async fn delete_message(
        &self,
        session_id: &str,
        party_id: &str,
        hash: &str,
        scope: Option<&str>,
    ) -> Result<()> {
        let builder = self
            .http
            .delete(self.url(&format!("message/{session_id}/{party_id}/{hash}")));
        let resp = Self::scoped(builder, scope).send().await.map_err(relay_err)?;
        check_status(resp.status(), "delete message", false)?;
        Ok(())
    }

    async fn complete_session(&self, session_id: &str, party_id: &str) -> Result<()> {
        self.post_parties(&format!("complete/{session_id}"), &[party_id])
            .await
    }

    async fn check_completed_parties(&self, session_id: &str, parties: &[String]) -> Result<bool> {
        let path = format!("complete/{session_id}");
        let poll = async {
            loop {
                match self.get_parties(&path).await {
                    Ok(done) if parties.iter().all(|p| done.contains(p)) => return,
                    Ok(_) => {}
                    Err(e) => warn!(session_id, error = %e, "failed to poll completed parties"),
                }
                sleep(self.poll_interval).await;
            }
        };

        Ok(timeout(COMPLETION_WAIT, poll).await.is_ok())
    }
}

/// The relay answers `[party]` until a peer has joined.
fn session_started(parties: &[String]) -> bool {
    parties.len() > 1
}

/// `Ok(false)` when the resource is not there yet and `missing_ok` allows that.
fn check_status(status: StatusCode, what: &str, missing_ok: bool) -> Result<bool> {
    if status.is_success() {
        return Ok(true);
    }
    if missing_ok && status == StatusCode::NOT_FOUND {
        return Ok(false);
    }
    Err(CoordinatorError::Relay(format!("{what} returned {status}")))
}

fn relay_err(e: reqwest::Error) -> CoordinatorError {
    CoordinatorError::Relay(e.to_string())
}
