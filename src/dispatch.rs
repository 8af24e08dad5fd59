// src/dispatch.rs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, CredentialSession, Credentials};
use crate::graph::ConfigGraph;
use crate::logger::DispatchMetrics;
use crate::prune::{
    PassThroughRename, PruneError, PruneMode, PrunedSheet, RelayEndpoint, SheetPruner,
};
use crate::status::{NodeStatus, OutputMessage, StatusReporter, error_message, success_message};
use crate::transport::{
    Endpoint, Scheme, TlsPolicy, Transport, TransportError, TransportRequest, TransportResponse,
    normalize_host,
};

pub const FLOWS_PATH: &str = "/flows";

/// Everything one dispatch needs, fixed for the duration of the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchTarget {
    pub owner_id: String,
    pub sheet: String,
    pub source: String,
    pub destination: String,
    pub auth: bool,
    pub credentials: Credentials,
    pub tls: TlsPolicy,
    pub rename: PassThroughRename,
    pub mode: PruneMode,
}

impl DispatchTarget {
    pub fn new(
        owner_id: impl Into<String>,
        sheet: impl Into<String>,
        source: impl AsRef<str>,
        destination: impl AsRef<str>,
    ) -> Self {
        Self {
            owner_id: owner_id.into(),
            sheet: sheet.into(),
            source: normalize_host(source.as_ref()),
            destination: normalize_host(destination.as_ref()),
            auth: false,
            credentials: Credentials::default(),
            tls: TlsPolicy::Verify,
            rename: PassThroughRename::default(),
            mode: PruneMode::default(),
        }
    }

    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = true;
        self.credentials = credentials;
        self
    }

    pub fn with_tls(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_rename(mut self, rename: PassThroughRename) -> Self {
        self.rename = rename;
        self
    }

    pub fn with_mode(mut self, mode: PruneMode) -> Self {
        self.mode = mode;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Prune(#[from] PruneError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{message} (code: {status}, url: {url})")]
    RemoteStatus {
        status: u16,
        message: String,
        url: String,
    },
}

impl DispatchError {
    /// Short reason shown on the node status.
    pub fn info(&self) -> String {
        match self {
            DispatchError::Prune(PruneError::Internal(_)) => "Exception while sheet pruning.".to_string(),
            DispatchError::Prune(e) => e.to_string(),
            DispatchError::Auth(AuthError::Denied { message, .. }) => message.clone(),
            DispatchError::Auth(AuthError::Parse { .. }) => "Fail to parse token.".to_string(),
            DispatchError::Auth(AuthError::Transport(_)) | DispatchError::Transport(_) => {
                "Request Fail".to_string()
            }
            DispatchError::RemoteStatus { message, .. } => message.clone(),
        }
    }

    /// HTTP status, or the transport error code when no response arrived.
    pub fn code(&self) -> Option<String> {
        match self {
            DispatchError::Prune(_) | DispatchError::Auth(AuthError::Parse { .. }) => None,
            DispatchError::Auth(AuthError::Denied { status, .. }) => Some(status.to_string()),
            DispatchError::Auth(AuthError::Transport(e)) | DispatchError::Transport(e) => {
                Some(e.code.to_string())
            }
            DispatchError::RemoteStatus { status, .. } => Some(status.to_string()),
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            DispatchError::Prune(_) => None,
            DispatchError::Auth(AuthError::Denied { url, .. })
            | DispatchError::Auth(AuthError::Parse { url })
            | DispatchError::RemoteStatus { url, .. } => Some(url),
            DispatchError::Auth(AuthError::Transport(e)) | DispatchError::Transport(e) => {
                Some(&e.url)
            }
        }
    }
}

/// Outcome of a successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub destination_url: String,
    pub status: u16,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

/// Where a phase currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Anonymous { scheme: Scheme },
    Authorized { scheme: Scheme },
}

impl PhaseState {
    pub fn scheme(&self) -> Scheme {
        match self {
            PhaseState::Anonymous { scheme } | PhaseState::Authorized { scheme } => *scheme,
        }
    }

    fn secured(self) -> Self {
        match self {
            PhaseState::Anonymous { .. } => PhaseState::Anonymous { scheme: Scheme::Https },
            PhaseState::Authorized { .. } => PhaseState::Authorized { scheme: Scheme::Https },
        }
    }

    fn authorized(self) -> Self {
        PhaseState::Authorized {
            scheme: self.scheme(),
        }
    }
}

/// Fallbacks already spent in the current phase. Each fires at most once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fallbacks {
    pub protocol: bool,
    pub auth: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase<'a> {
    Fetch,
    Push { body: &'a str },
}

impl std::fmt::Debug for Phase<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Fetch => f.write_str("Fetch"),
            Phase::Push { .. } => f.write_str("Push"),
        }
    }
}

impl Phase<'_> {
    fn expected_status(self) -> u16 {
        match self {
            Phase::Fetch => 200,
            Phase::Push { .. } => 204,
        }
    }

    fn request(self, url: &str) -> TransportRequest {
        match self {
            Phase::Fetch => TransportRequest::get(url),
            Phase::Push { body } => TransportRequest::post(url, body),
        }
    }

    fn failure_message(self, response: &TransportResponse) -> String {
        match self {
            Phase::Fetch => "Fail to get local flow.".to_string(),
            Phase::Push { .. } => response.status_message.clone(),
        }
    }
}

struct PhaseOutcome {
    response: TransportResponse,
    endpoint: Endpoint,
}

/// Drives fetch, prune and push for dispatch targets and reports every
/// terminal outcome to a [`StatusReporter`].
#[derive(Clone)]
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    reporter: Arc<dyn StatusReporter>,
    metrics: DispatchMetrics,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            transport,
            reporter,
            metrics: DispatchMetrics::new(),
        }
    }

    pub fn reporter(&self) -> &Arc<dyn StatusReporter> {
        &self.reporter
    }

    /// Copy `target.sheet` from the source runtime to the destination.
    #[tracing::instrument(name = "dispatch", skip(self, target), fields(owner = %target.owner_id, sheet = %target.sheet))]
    pub async fn dispatch(&self, target: &DispatchTarget) -> Result<DispatchReport, DispatchError> {
        let result = self
            .metrics
            .instrument(&target.owner_id, || async {
                let started = Utc::now();
                let sheet = self.fetch_and_prune(target).await?;
                self.push(target, &sheet, started).await
            })
            .await;
        self.report(target, &result);
        result
    }

    /// Fetch and prune only; the pruned sheet is also emitted as output.
    #[tracing::instrument(name = "fetch_sheet", skip(self, target), fields(owner = %target.owner_id, sheet = %target.sheet))]
    pub async fn fetch_sheet(&self, target: &DispatchTarget) -> Result<PrunedSheet, DispatchError> {
        match self.fetch_and_prune(target).await {
            Ok(sheet) => {
                self.reporter.status(&target.owner_id, NodeStatus::Clear);
                let payload = sheet
                    .to_json()
                    .map_err(|e| PruneError::Internal(e.to_string()))?;
                self.reporter.output(
                    &target.owner_id,
                    OutputMessage::new(Some(Phase::Fetch.expected_status().to_string()), payload),
                );
                Ok(sheet)
            }
            Err(e) => {
                self.report_error(&target.owner_id, &e);
                Err(e)
            }
        }
    }

    /// Push an already pruned sheet to the destination.
    #[tracing::instrument(name = "push_flows", skip(self, target, sheet), fields(owner = %target.owner_id))]
    pub async fn push_flows(
        &self,
        target: &DispatchTarget,
        sheet: &PrunedSheet,
    ) -> Result<DispatchReport, DispatchError> {
        let result = self.push(target, sheet, Utc::now()).await;
        self.report(target, &result);
        result
    }

    async fn fetch_and_prune(&self, target: &DispatchTarget) -> Result<PrunedSheet, DispatchError> {
        let fetched = self.run_phase(target, Phase::Fetch, &target.source).await?;

        let graph = ConfigGraph::from_json(&fetched.response.body)?;
        let relay = RelayEndpoint::new(
            fetched.endpoint.scheme.is_secure(),
            target.source.clone(),
            target.owner_id.clone(),
        );
        let sheet = SheetPruner::new(target.rename.clone()).prune_with_mode(
            &graph,
            &target.sheet,
            &relay,
            target.mode,
        )?;
        info!(
            nodes = sheet.nodes.len(),
            mode = ?target.mode,
            relay = ?sheet.relay_config_id.as_ref().map(|_| relay.url()),
            "sheet pruned"
        );
        Ok(sheet)
    }

    async fn push(
        &self,
        target: &DispatchTarget,
        sheet: &PrunedSheet,
        started: DateTime<Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        let body = sheet
            .to_json()
            .map_err(|e| PruneError::Internal(e.to_string()))?;
        let pushed = self
            .run_phase(target, Phase::Push { body: &body }, &target.destination)
            .await?;
        Ok(DispatchReport {
            destination_url: pushed.endpoint.url(FLOWS_PATH),
            status: pushed.response.status,
            started,
            finished: Utc::now(),
        })
    }

    /// One request/response exchange against `host`, starting anonymous over
    /// plain HTTP. A 400/401 moves to `Authorized` when the target asks for
    /// auth; a connection reset of an anonymous request moves to HTTPS. Each
    /// move happens once, and the token session is opened at most once:
    /// any transport error while `Authorized` is terminal.
    async fn run_phase(
        &self,
        target: &DispatchTarget,
        phase: Phase<'_>,
        host: &str,
    ) -> Result<PhaseOutcome, DispatchError> {
        let mut state = PhaseState::Anonymous { scheme: Scheme::Http };
        let mut fallbacks = Fallbacks::default();

        loop {
            let endpoint = Endpoint::new(state.scheme(), host);
            let url = endpoint.url(FLOWS_PATH);
            debug!(?phase, ?state, url = %url, "sending");

            let sent = match state {
                PhaseState::Anonymous { .. } => {
                    self.transport
                        .send(phase.request(&url).tls(target.tls))
                        .await
                }
                PhaseState::Authorized { .. } => {
                    let transport = self.transport.as_ref();
                    let session = CredentialSession::new(
                        transport,
                        endpoint.clone(),
                        &target.credentials,
                        target.tls,
                    );
                    let granted = session
                        .with_token(|headers| {
                            let request = phase
                                .request(&url)
                                .headers(headers.to_vec())
                                .tls(target.tls);
                            async move { transport.send(request).await }
                        })
                        .await;
                    match granted {
                        Ok(sent) => sent,
                        Err(AuthError::Transport(e)) => Err(e),
                        Err(e) => return Err(e.into()),
                    }
                }
            };

            match sent {
                Ok(response) if response.status == phase.expected_status() => {
                    return Ok(PhaseOutcome { response, endpoint });
                }
                Ok(response)
                    if matches!(response.status, 400 | 401)
                        && target.auth
                        && !fallbacks.auth =>
                {
                    fallbacks.auth = true;
                    info!(?phase, status = response.status, url = %url, "authentication required, retrying with token");
                    state = state.authorized();
                }
                Ok(response) => {
                    warn!(?phase, status = response.status, url = %url, "unexpected status");
                    return Err(DispatchError::RemoteStatus {
                        status: response.status,
                        message: phase.failure_message(&response),
                        url,
                    });
                }
                Err(e)
                    if e.is_connection_reset()
                        && !fallbacks.protocol
                        && state == (PhaseState::Anonymous { scheme: Scheme::Http }) =>
                {
                    fallbacks.protocol = true;
                    info!(?phase, url = %url, "HTTP connection reset, trying HTTPS");
                    state = state.secured();
                }
                Err(e) => {
                    warn!(?phase, code = %e.code, url = %url, "request failed");
                    return Err(e.into());
                }
            }
        }
    }

    fn report(&self, target: &DispatchTarget, result: &Result<DispatchReport, DispatchError>) {
        match result {
            Ok(report) => {
                self.reporter.status(&target.owner_id, NodeStatus::Clear);
                self.reporter.output(
                    &target.owner_id,
                    OutputMessage::new(
                        Some(report.status.to_string()),
                        success_message(report.status, &report.destination_url),
                    ),
                );
            }
            Err(e) => self.report_error(&target.owner_id, e),
        }
    }

    fn report_error(&self, owner_id: &str, error: &DispatchError) {
        let info = error.info();
        let code = error.code();
        self.reporter
            .status(owner_id, NodeStatus::error(&info, code.as_deref()));
        self.reporter.output(
            owner_id,
            OutputMessage::new(code.clone(), error_message(&info, code.as_deref(), error.url())),
        );
    }
}
