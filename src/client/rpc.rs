use crate::client::auth::{Auth, AuthLayer};
use crate::engine_api::{EngineApiClient, EngineApiExt};
use crate::payload::{OpExecutionPayloadEnvelope, PayloadInfo, PayloadSource, PayloadVersion};
use alloy_rpc_types_engine::{ForkchoiceState, ForkchoiceUpdated, JwtError, JwtSecret, PayloadId};
use clap::Parser;
use eyre::bail;
use http::Uri;
use jsonrpsee::core::async_trait;
use jsonrpsee::http_client::transport::HttpBackend;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::types::ErrorObjectOwned;
use op_alloy_rpc_types_engine::{
    OpExecutionPayloadEnvelopeV3, OpExecutionPayloadEnvelopeV4, OpPayloadAttributes,
};
use opentelemetry::trace::SpanKind;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument};

pub type RpcClientService = HttpClient<Auth<HttpBackend>>;

const INTERNAL_ERROR: i32 = 13;

pub type ClientResult<T> = Result<T, RpcClientError>;

#[derive(Error, Debug)]
pub enum RpcClientError {
    #[error(transparent)]
    Jsonrpsee(#[from] jsonrpsee::core::client::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error("{0}")]
    Other(String),
}

trait Code: Sized {
    fn code(&self) -> i32;

    fn set_code(self) -> Self {
        tracing::Span::current().record("code", self.code());
        self
    }
}

impl<T, E: Code> Code for Result<T, E> {
    fn code(&self) -> i32 {
        match self {
            Ok(_) => 0,
            Err(e) => e.code(),
        }
    }
}

impl Code for RpcClientError {
    fn code(&self) -> i32 {
        match self {
            RpcClientError::Jsonrpsee(e) => e.code(),
            _ => INTERNAL_ERROR,
        }
    }
}

impl Code for jsonrpsee::core::client::Error {
    fn code(&self) -> i32 {
        match self {
            jsonrpsee::core::client::Error::Call(call) => call.code(),
            _ => INTERNAL_ERROR,
        }
    }
}

impl From<RpcClientError> for ErrorObjectOwned {
    fn from(err: RpcClientError) -> Self {
        match err {
            RpcClientError::Jsonrpsee(jsonrpsee::core::ClientError::Call(error_object)) => {
                error_object
            }
            e => ErrorObjectOwned::owned(INTERNAL_ERROR, e.to_string(), Option::<()>::None),
        }
    }
}

/// Client for an execution engine's authenticated Engine API.
///
/// Only the payload construction calls are exposed, which is the capability set a builder
/// backend has to provide.
#[derive(Clone)]
pub struct RpcClient {
    /// Handles requests to the authenticated Engine API (requires JWT authentication)
    auth_client: RpcClientService,
    /// Uri of the RPC server for authenticated Engine API calls
    auth_rpc: Uri,
    /// Which backend this client talks to, used as a span label
    payload_source: PayloadSource,
    /// Isthmus activation timestamp, selects the `engine_getPayload` version
    isthmus_time: Option<u64>,
}

impl RpcClient {
    /// Initializes a new [RpcClient] with JWT auth for the Engine API.
    pub fn new(
        auth_rpc: Uri,
        auth_rpc_jwt_secret: JwtSecret,
        timeout: u64,
        payload_source: PayloadSource,
    ) -> Result<Self, RpcClientError> {
        let auth_layer = AuthLayer::new(auth_rpc_jwt_secret);
        let auth_client = HttpClientBuilder::new()
            .set_http_middleware(tower::ServiceBuilder::new().layer(auth_layer))
            .request_timeout(Duration::from_millis(timeout))
            .build(auth_rpc.to_string())?;

        Ok(Self {
            auth_client,
            auth_rpc,
            payload_source,
            isthmus_time: None,
        })
    }

    pub fn with_isthmus_time(mut self, isthmus_time: u64) -> Self {
        self.isthmus_time = Some(isthmus_time);
        self
    }

    pub fn auth_rpc(&self) -> &Uri {
        &self.auth_rpc
    }

    #[instrument(
        skip_all,
        err(level = "debug"),
        fields(
            otel.kind = ?SpanKind::Client,
            target = %self.payload_source,
            head_block_hash = %fork_choice_state.head_block_hash,
            url = %self.auth_rpc,
            code,
            payload_id
        )
    )]
    pub async fn fork_choice_updated_v3(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: Option<OpPayloadAttributes>,
    ) -> ClientResult<ForkchoiceUpdated> {
        info!("Sending fork_choice_updated_v3 to {}", self.payload_source);
        let res = self
            .auth_client
            .fork_choice_updated_v3(fork_choice_state, payload_attributes)
            .await
            .set_code()?;

        if let Some(payload_id) = res.payload_id {
            tracing::Span::current().record("payload_id", payload_id.to_string());
        }

        Ok(res)
    }

    #[instrument(
        skip(self),
        err(level = "debug"),
        fields(
            otel.kind = ?SpanKind::Client,
            target = %self.payload_source,
            url = %self.auth_rpc,
            %payload_id,
            code,
        )
    )]
    pub async fn get_payload_v3(
        &self,
        payload_id: PayloadId,
    ) -> ClientResult<OpExecutionPayloadEnvelopeV3> {
        info!("Sending get_payload_v3 to {}", self.payload_source);
        Ok(self
            .auth_client
            .get_payload_v3(payload_id)
            .await
            .set_code()?)
    }

    #[instrument(
        skip(self),
        err(level = "debug"),
        fields(
            otel.kind = ?SpanKind::Client,
            target = %self.payload_source,
            url = %self.auth_rpc,
            %payload_id,
            code,
        )
    )]
    pub async fn get_payload_v4(
        &self,
        payload_id: PayloadId,
    ) -> ClientResult<OpExecutionPayloadEnvelopeV4> {
        info!("Sending get_payload_v4 to {}", self.payload_source);
        Ok(self
            .auth_client
            .get_payload_v4(payload_id)
            .await
            .set_code()?)
    }

    pub async fn get_payload(
        &self,
        payload_info: PayloadInfo,
    ) -> ClientResult<OpExecutionPayloadEnvelope> {
        match payload_info.version(self.isthmus_time) {
            PayloadVersion::V3 => Ok(OpExecutionPayloadEnvelope::V3(
                self.get_payload_v3(payload_info.id).await?,
            )),
            PayloadVersion::V4 => Ok(OpExecutionPayloadEnvelope::V4(
                self.get_payload_v4(payload_info.id).await?,
            )),
        }
    }
}

#[async_trait]
impl EngineApiExt for RpcClient {
    async fn get_payload(
        &self,
        payload_info: PayloadInfo,
    ) -> ClientResult<OpExecutionPayloadEnvelope> {
        self.get_payload(payload_info).await
    }

    async fn fork_choice_updated(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: Option<OpPayloadAttributes>,
    ) -> ClientResult<ForkchoiceUpdated> {
        self.fork_choice_updated_v3(fork_choice_state, payload_attributes)
            .await
    }
}

/// Builder engine connection settings.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
pub struct BuilderArgs {
    /// Builder auth server address. Without it payloads are served by the fallback engine alone
    #[arg(long, env)]
    pub builder_url: Option<Uri>,

    /// Hex encoded JWT secret to use for the authenticated engine-API RPC server.
    #[arg(long, env, value_name = "HEX")]
    pub builder_jwt_token: Option<JwtSecret>,

    /// Path to a JWT secret to use for the authenticated engine-API RPC server.
    #[arg(long, env, value_name = "PATH")]
    pub builder_jwt_path: Option<PathBuf>,

    /// Timeout for http calls in milliseconds
    #[arg(long, env, default_value_t = 1000)]
    pub builder_timeout: u64,

    /// Upper bound in milliseconds on the builder leg of a multiplexed call
    #[arg(long, env)]
    pub builder_call_timeout: Option<u64>,
}

impl BuilderArgs {
    fn get_auth_jwt(&self) -> eyre::Result<JwtSecret> {
        if let Some(secret) = self.builder_jwt_token {
            Ok(secret)
        } else if let Some(path) = self.builder_jwt_path.as_ref() {
            Ok(JwtSecret::from_file(path)?)
        } else {
            bail!("Missing Builder JWT secret");
        }
    }

    /// Builds the builder engine client, or `None` when no builder url is configured.
    pub fn new_rpc_client(&self) -> eyre::Result<Option<RpcClient>> {
        let Some(url) = self.builder_url.clone() else {
            return Ok(None);
        };
        let client = RpcClient::new(
            url,
            self.get_auth_jwt()?,
            self.builder_timeout,
            PayloadSource::Builder,
        )?;
        Ok(Some(client))
    }

    pub fn builder_call_timeout(&self) -> Option<Duration> {
        self.builder_call_timeout.map(Duration::from_millis)
    }
}
