// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP implementation of [`AgentApi`] over reqwest.
//!
//! Every request carries the agent auth header and a per-operation
//! timeout. Classification: connect errors, timeouts, and 5xx map to
//! [`AgentError::Unavailable`]; 4xx with a JSON error body maps to
//! [`AgentError::Job`].

use super::{
    AgentApi, AgentError, AgentJobOutcome, CrossHostLinkRequest, CrossHostLinkResult,
    DeclareStateResult, DeclaredTunnel, DeployNode, DeployTopology, ExternalConnectRequest,
    ExtractResult, HotConnectRequest, HotConnectResult, ImageInfo, LabStatus, LockStatus,
    OverlayCleanupResult, ReleaseLockResult,
};
use async_trait::async_trait;
use lm_core::{Host, Provider};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Auth header every agent request carries.
const AUTH_HEADER: &str = "X-Agent-Auth";

/// Long-running operations: full deploys and destroys.
const DEPLOY_TIMEOUT: Duration = Duration::from_secs(600);
/// Link setup round-trips OVS commands on the agent.
const LINK_TIMEOUT: Duration = Duration::from_secs(120);
/// Status, readiness, locks, inventories.
const SHORT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct HttpAgentClient {
    client: reqwest::Client,
    auth_token: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    detail: Option<String>,
}

impl ErrorBody {
    fn message(self) -> Option<String> {
        self.error.or(self.error_message).or(self.detail)
    }
}

impl HttpAgentClient {
    pub fn new(auth_token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            auth_token: auth_token.into(),
        }
    }

    fn url(host: &Host, path: &str) -> String {
        format!("http://{}{}", host.address, path)
    }

    fn classify_send_error(e: reqwest::Error) -> AgentError {
        if e.is_timeout() {
            return AgentError::unavailable(format!("request timed out: {e}"));
        }
        AgentError::unavailable(format!("request failed: {e}"))
    }

    async fn classify_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AgentError> {
        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(AgentError::unavailable(format!(
                "agent returned {status}: {body}"
            )));
        }
        if status.is_client_error() {
            let message = response
                .json::<ErrorBody>()
                .await
                .ok()
                .and_then(ErrorBody::message)
                .unwrap_or_else(|| format!("agent returned {status}"));
            return Err(AgentError::job(message));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AgentError::unavailable(format!("invalid agent response: {e}")))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        host: &Host,
        path: &str,
        timeout: Duration,
    ) -> Result<T, AgentError> {
        let response = self
            .client
            .get(Self::url(host, path))
            .header(AUTH_HEADER, &self.auth_token)
            .timeout(timeout)
            .send()
            .await
            .map_err(Self::classify_send_error)?;
        Self::classify_response(response).await
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        host: &Host,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<T, AgentError> {
        let response = self
            .client
            .post(Self::url(host, path))
            .header(AUTH_HEADER, &self.auth_token)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(Self::classify_send_error)?;
        Self::classify_response(response).await
    }

    /// A job outcome whose status is "failed" becomes a permanent error
    /// with the agent's stdout/stderr attached.
    fn outcome_to_result(outcome: AgentJobOutcome) -> Result<AgentJobOutcome, AgentError> {
        if outcome.status == "failed" {
            return Err(AgentError::Job {
                message: outcome
                    .error_message
                    .unwrap_or_else(|| "agent reported failure".to_string()),
                stdout: Some(outcome.stdout).filter(|s| !s.is_empty()),
                stderr: Some(outcome.stderr).filter(|s| !s.is_empty()),
            });
        }
        Ok(outcome)
    }
}

#[derive(Serialize)]
struct DeployBody<'a> {
    job_id: &'a str,
    lab_id: &'a str,
    topology: &'a DeployTopology,
    provider: Provider,
}

#[derive(Serialize)]
struct JobRef<'a> {
    job_id: &'a str,
    lab_id: &'a str,
}

#[derive(Serialize)]
struct NodeRef<'a> {
    lab_id: &'a str,
    node_name: &'a str,
}

#[derive(Serialize)]
struct CreateNodeBody<'a> {
    lab_id: &'a str,
    node: &'a DeployNode,
}

#[derive(Serialize)]
struct DeclareBody<'a> {
    tunnels: &'a [DeclaredTunnel],
}

#[derive(Serialize)]
struct LabRef<'a> {
    lab_id: &'a str,
}

#[derive(Deserialize)]
struct ReadinessBody {
    #[serde(default)]
    is_ready: bool,
}

#[derive(Deserialize)]
struct ActiveTransfersBody {
    #[serde(default)]
    active_jobs: Vec<String>,
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn deploy_lab(
        &self,
        host: &Host,
        job_id: &str,
        topology: &DeployTopology,
        provider: Provider,
    ) -> Result<AgentJobOutcome, AgentError> {
        let body = DeployBody { job_id, lab_id: &topology.lab_id, topology, provider };
        let outcome = self.post_json(host, "/deploy", &body, DEPLOY_TIMEOUT).await?;
        Self::outcome_to_result(outcome)
    }

    async fn destroy_lab(
        &self,
        host: &Host,
        job_id: &str,
        lab_id: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        let outcome = self
            .post_json(host, "/destroy", &JobRef { job_id, lab_id }, DEPLOY_TIMEOUT)
            .await?;
        Self::outcome_to_result(outcome)
    }

    async fn create_node(
        &self,
        host: &Host,
        lab_id: &str,
        node: &DeployNode,
    ) -> Result<AgentJobOutcome, AgentError> {
        let outcome = self
            .post_json(host, "/nodes/create", &CreateNodeBody { lab_id, node }, DEPLOY_TIMEOUT)
            .await?;
        Self::outcome_to_result(outcome)
    }

    async fn start_node(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        let outcome = self
            .post_json(host, "/nodes/start", &NodeRef { lab_id, node_name }, LINK_TIMEOUT)
            .await?;
        Self::outcome_to_result(outcome)
    }

    async fn stop_node(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        let outcome = self
            .post_json(host, "/nodes/stop", &NodeRef { lab_id, node_name }, LINK_TIMEOUT)
            .await?;
        Self::outcome_to_result(outcome)
    }

    async fn container_action(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
        action: &str,
    ) -> Result<AgentJobOutcome, AgentError> {
        #[derive(Serialize)]
        struct ActionBody<'a> {
            lab_id: &'a str,
            node_name: &'a str,
            action: &'a str,
        }
        let outcome = self
            .post_json(
                host,
                "/nodes/action",
                &ActionBody { lab_id, node_name, action },
                LINK_TIMEOUT,
            )
            .await?;
        Self::outcome_to_result(outcome)
    }

    async fn get_lab_status(&self, host: &Host, lab_id: &str) -> Result<LabStatus, AgentError> {
        self.get_json(host, &format!("/labs/{lab_id}/status"), SHORT_TIMEOUT).await
    }

    async fn check_node_readiness(
        &self,
        host: &Host,
        lab_id: &str,
        node_name: &str,
    ) -> Result<bool, AgentError> {
        let body: ReadinessBody = self
            .get_json(host, &format!("/labs/{lab_id}/nodes/{node_name}/ready"), SHORT_TIMEOUT)
            .await?;
        Ok(body.is_ready)
    }

    async fn extract_configs(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<ExtractResult, AgentError> {
        self.post_json(
            host,
            &format!("/labs/{lab_id}/configs/extract"),
            &LabRef { lab_id },
            LINK_TIMEOUT,
        )
        .await
    }

    async fn connect_link(
        &self,
        host: &Host,
        request: &HotConnectRequest,
    ) -> Result<HotConnectResult, AgentError> {
        self.post_json(host, "/links", request, LINK_TIMEOUT).await
    }

    async fn setup_cross_host_link(
        &self,
        host: &Host,
        request: &CrossHostLinkRequest,
    ) -> Result<CrossHostLinkResult, AgentError> {
        self.post_json(host, "/overlay/cross-host-link", request, LINK_TIMEOUT).await
    }

    async fn connect_external(
        &self,
        host: &Host,
        request: &ExternalConnectRequest,
    ) -> Result<HotConnectResult, AgentError> {
        self.post_json(host, "/links/external", request, LINK_TIMEOUT).await
    }

    async fn declare_overlay_state(
        &self,
        host: &Host,
        declared: &[DeclaredTunnel],
    ) -> Result<DeclareStateResult, AgentError> {
        self.post_json(host, "/overlay/declare-state", &DeclareBody { tunnels: declared }, LINK_TIMEOUT)
            .await
    }

    async fn cleanup_overlay(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<OverlayCleanupResult, AgentError> {
        self.post_json(host, "/overlay/cleanup", &LabRef { lab_id }, LINK_TIMEOUT).await
    }

    async fn get_lock_status(&self, host: &Host) -> Result<LockStatus, AgentError> {
        self.get_json(host, "/locks/status", SHORT_TIMEOUT).await
    }

    async fn release_lock(
        &self,
        host: &Host,
        lab_id: &str,
    ) -> Result<ReleaseLockResult, AgentError> {
        self.post_json(host, &format!("/locks/{lab_id}/release"), &LabRef { lab_id }, SHORT_TIMEOUT)
            .await
    }

    async fn list_images(&self, host: &Host) -> Result<Vec<ImageInfo>, AgentError> {
        self.get_json(host, "/images", SHORT_TIMEOUT).await
    }

    async fn get_active_transfers(&self, host: &Host) -> Result<Vec<String>, AgentError> {
        let body: ActiveTransfersBody = self
            .get_json(host, "/images/active-transfers", SHORT_TIMEOUT)
            .await?;
        Ok(body.active_jobs)
    }
}
