//! HTTPS API of the agent
//!
//! Routes (all `POST`, JSON in and out):
//! - `/cluster/api/1.0/join` - legacy join
//! - `/cluster/api/1.0/sign-cert` - sign a CSR with a certificate-request token
//! - `/cluster/api/1.0/configure` - service and addon changes from a peer
//! - `/cluster/api/1.0/upgrade` - run one upgrade phase
//! - `/cluster/api/2.0/join` - HA join
//!
//! Any other method on these paths answers 404 with an empty body.
//! Malformed bodies answer 400, every other failure 500, both with
//! `{"error": "..."}`.

pub mod middleware;

use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Extension, State};
use axum::http::header::HOST;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{post, MethodRouter};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::configure::{ConfigureRequest, Configurator};
use crate::exec::CommandRunner;
use crate::issuer::CredentialIssuer;
use crate::join::{v1, v2, HostResolver, JoinCoordinatorV1, JoinCoordinatorV2};
use crate::lock::ResourceLocks;
use crate::membership::{split_host_port, MembershipView};
use crate::pki::FileCaSigner;
use crate::services::ServiceManager;
use crate::token::{KnownTokens, TokenStore};
use crate::upgrade::{UpgradeRequest, Upgrader};
use crate::Error;

use middleware::Deadline;

/// Failure of one API call
#[derive(Debug)]
pub enum ApiError {
    /// Body is not valid JSON for the endpoint
    BadRequest(String),
    /// The operation itself failed
    Failed(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Failed(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::BadRequest(msg) => {
                warn!(error = %msg, "Rejected malformed request");
                (StatusCode::BAD_REQUEST, msg)
            }
            Self::Failed(err) => {
                warn!(kind = err.kind(), error = %err, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

fn decode<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(e.to_string()))
}

/// Body of a certificate signing request
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct SignRequest {
    /// Certificate-request token minted during the join
    pub token: String,
    /// PEM-encoded CSR
    pub request: String,
}

/// A signed certificate
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignResponse {
    /// PEM-encoded certificate
    pub certificate: String,
}

#[derive(Serialize)]
struct Empty {}

/// Everything the handlers operate on
pub struct AppState {
    join_v1: JoinCoordinatorV1,
    join_v2: JoinCoordinatorV2,
    issuer: CredentialIssuer,
    configurator: Configurator,
    upgrader: Upgrader,
    bind: SocketAddr,
    timeout: Duration,
}

impl AppState {
    /// Wire every coordinator over the node state described by `config`.
    ///
    /// All components share one set of file locks. `bind` stands in for the
    /// local address when a request carries no `Host`.
    pub fn new(
        config: AgentConfig,
        runner: Arc<dyn CommandRunner>,
        resolver: Arc<dyn HostResolver>,
        bind: SocketAddr,
    ) -> Self {
        let paths = config.paths.clone();
        let locks = ResourceLocks::new();

        let tokens = TokenStore::new(paths.clone(), locks.clone());
        let known = KnownTokens::new(paths.clone(), locks.clone());
        let services = ServiceManager::new(runner.clone(), config.topology);
        let signer = Arc::new(FileCaSigner::new(paths.clone(), locks.clone()));
        let issuer = CredentialIssuer::new(paths.clone(), tokens.clone(), known.clone(), signer);
        let membership = MembershipView::new(paths.clone(), services.clone(), locks);

        Self {
            join_v1: JoinCoordinatorV1::new(
                config.clone(),
                tokens.clone(),
                known,
                issuer.clone(),
                services.clone(),
                resolver.clone(),
            ),
            join_v2: JoinCoordinatorV2::new(
                config.clone(),
                tokens.clone(),
                issuer.clone(),
                membership,
                runner.clone(),
                resolver,
            ),
            issuer,
            configurator: Configurator::new(paths.clone(), tokens.clone(), services, runner.clone()),
            upgrader: Upgrader::new(paths, tokens, runner),
            bind,
            timeout: config.request_timeout,
        }
    }
}

/// Address the request was accepted on, as the caller dialed it.
///
/// Peers must be able to dial the result, so a wildcard or empty host is
/// refused.
fn local_address(uri: &Uri, headers: &HeaderMap, fallback: SocketAddr) -> Result<String, Error> {
    let address = uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| fallback.to_string());

    let (host, _) = split_host_port(&address);
    let unspecified = host
        .parse::<IpAddr>()
        .map(|ip| ip.is_unspecified())
        .unwrap_or(false);
    if host.is_empty() || unspecified {
        return Err(Error::validation(
            "determine local address",
            format!("{address:?} is not an address peers can reach"),
        ));
    }
    Ok(address)
}

async fn join_v1(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Result<Json<v1::JoinResponse>, ApiError> {
    let request: v1::JoinRequest = decode(&body)?;
    let response = state.join_v1.join(&request, &remote.to_string()).await?;
    Ok(Json(response))
}

async fn join_v2(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Extension(Deadline(deadline)): Extension<Deadline>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<v2::JoinResponse>, ApiError> {
    let request: v2::JoinRequest = decode(&body)?;
    let host_port = local_address(&uri, &headers, state.bind)?;
    let response = state
        .join_v2
        .join(&request, &host_port, &remote.to_string(), deadline)
        .await?;
    Ok(Json(response))
}

async fn sign_cert(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SignResponse>, ApiError> {
    let request: SignRequest = decode(&body)?;
    let certificate = state.issuer.sign(&request.token, &request.request).await?;
    Ok(Json(SignResponse { certificate }))
}

async fn configure(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Empty>, ApiError> {
    let request: ConfigureRequest = decode(&body)?;
    state.configurator.configure(&request).await?;
    Ok(Json(Empty {}))
}

async fn upgrade(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Empty>, ApiError> {
    let request: UpgradeRequest = decode(&body)?;
    state.upgrader.upgrade(&request).await?;
    Ok(Json(Empty {}))
}

/// POST only; every other method is indistinguishable from an unknown path
fn post_only<H, T>(handler: H) -> MethodRouter<Arc<AppState>>
where
    H: axum::handler::Handler<T, Arc<AppState>>,
    T: 'static,
{
    post(handler).fallback(|| async { StatusCode::NOT_FOUND })
}

/// Build the API router with deadline and access-log layers applied
pub fn router(state: Arc<AppState>) -> Router {
    let timeout = state.timeout;
    Router::new()
        .route("/cluster/api/1.0/join", post_only(join_v1))
        .route("/cluster/api/1.0/sign-cert", post_only(sign_cert))
        .route("/cluster/api/1.0/configure", post_only(configure))
        .route("/cluster/api/1.0/upgrade", post_only(upgrade))
        .route("/cluster/api/2.0/join", post_only(join_v2))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(
            timeout,
            middleware::deadline,
        ))
        .layer(axum::middleware::from_fn(middleware::access_log))
}

/// Serve `app` over TLS until the process exits
pub async fn serve(
    addr: SocketAddr,
    cert_file: &Path,
    key_file: &Path,
    app: Router,
) -> std::io::Result<()> {
    let tls_config = RustlsConfig::from_pem_file(cert_file, key_file).await?;

    info!(addr = %addr, "Starting cluster agent");

    axum_server::bind_rustls(addr, tls_config)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
}
