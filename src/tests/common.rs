use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use alloy_primitives::B256;
use alloy_rpc_types_engine::{
    ForkchoiceState, ForkchoiceUpdated, PayloadId, PayloadStatus, PayloadStatusEnum,
};
use http::header::AUTHORIZATION;
use jsonrpsee::RpcModule;
use jsonrpsee::core::{RpcResult, async_trait};
use jsonrpsee::server::{ServerBuilder, ServerHandle};
use op_alloy_rpc_types_engine::{
    OpExecutionPayloadEnvelopeV3, OpExecutionPayloadEnvelopeV4, OpPayloadAttributes,
};
use parking_lot::Mutex;
use tower::{Layer as TowerLayer, Service};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};

use crate::{
    BlockLabel, ClientResult, EngineApiExt, L2BlockRef, L2Chain, NewPayload,
    OpExecutionPayloadEnvelope, PayloadInfo, RpcClientError, SystemConfig,
};

const ENVELOPE_V4: &str = r#"{"executionPayload":{"parentHash":"0xe927a1448525fb5d32cb50ee1408461a945ba6c39bd5cf5621407d500ecc8de9","feeRecipient":"0x0000000000000000000000000000000000000000","stateRoot":"0x10f8a0830000e8edef6d00cc727ff833f064b1950afd591ae41357f97e543119","receiptsRoot":"0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421","logsBloom":"0x00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000","prevRandao":"0xe0d8b4521a7da1582a713244ffb6a86aa1726932087386e2dc7973f43fc6cb24","blockNumber":"0x1","gasLimit":"0x2ffbd2","gasUsed":"0x0","timestamp":"0x1235","extraData":"0xd883010d00846765746888676f312e32312e30856c696e7578","baseFeePerGas":"0x342770c0","blockHash":"0x44d0fa5f2f73a938ebb96a2a21679eb8dea3e7b7dd8fd9f35aa756dda8bf0a8a","transactions":[],"withdrawals":[],"blobGasUsed":"0x0","excessBlobGas":"0x0","withdrawalsRoot":"0x123400000000000000000000000000000000000000000000000000000000babe"},"blockValue":"0x0","blobsBundle":{"commitments":[],"proofs":[],"blobs":[]},"shouldOverrideBuilder":false,"parentBeaconBlockRoot":"0xdead00000000000000000000000000000000000000000000000000000000beef","executionRequests":["0xdeadbeef"]}"#;

const ENVELOPE_V3: &str = r#"{"executionPayload":{"parentHash":"0xe927a1448525fb5d32cb50ee1408461a945ba6c39bd5cf5621407d500ecc8de9","feeRecipient":"0x0000000000000000000000000000000000000000","stateRoot":"0x10f8a0830000e8edef6d00cc727ff833f064b1950afd591ae41357f97e543119","receiptsRoot":"0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421","logsBloom":"0x00000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000000","prevRandao":"0xe0d8b4521a7da1582a713244ffb6a86aa1726932087386e2dc7973f43fc6cb24","blockNumber":"0x1","gasLimit":"0x2ffbd2","gasUsed":"0x0","timestamp":"0x1235","extraData":"0xd883010d00846765746888676f312e32312e30856c696e7578","baseFeePerGas":"0x342770c0","blockHash":"0x44d0fa5f2f73a938ebb96a2a21679eb8dea3e7b7dd8fd9f35aa756dda8bf0a8a","transactions":[],"withdrawals":[],"blobGasUsed":"0x0","excessBlobGas":"0x0"},"blockValue":"0x0","blobsBundle":{"commitments":[],"proofs":[],"blobs":[]},"shouldOverrideBuilder":false,"parentBeaconBlockRoot":"0xdead00000000000000000000000000000000000000000000000000000000beef"}"#;

pub fn test_envelope_v3(block_hash: B256) -> OpExecutionPayloadEnvelopeV3 {
    let mut envelope: OpExecutionPayloadEnvelopeV3 = serde_json::from_str(ENVELOPE_V3).unwrap();
    envelope.execution_payload.payload_inner.payload_inner.block_hash = block_hash;
    envelope
}

pub fn test_envelope_v4(block_hash: B256) -> OpExecutionPayloadEnvelopeV4 {
    let mut envelope: OpExecutionPayloadEnvelopeV4 = serde_json::from_str(ENVELOPE_V4).unwrap();
    envelope
        .execution_payload
        .payload_inner
        .payload_inner
        .payload_inner
        .block_hash = block_hash;
    envelope
}

pub fn test_payload(block_hash: B256) -> OpExecutionPayloadEnvelope {
    OpExecutionPayloadEnvelope::V3(test_envelope_v3(block_hash))
}

pub fn valid_fcu(payload_id: Option<PayloadId>) -> ForkchoiceUpdated {
    ForkchoiceUpdated {
        payload_status: PayloadStatus::from_status(PayloadStatusEnum::Valid),
        payload_id,
    }
}

pub fn fcu_with_status(status: PayloadStatusEnum) -> ForkchoiceUpdated {
    ForkchoiceUpdated::new(PayloadStatus::from_status(status))
}

pub fn test_attributes() -> OpPayloadAttributes {
    serde_json::from_value(serde_json::json!({
        "timestamp": "0x1235",
        "prevRandao": B256::repeat_byte(0x42),
        "suggestedFeeRecipient": "0x0000000000000000000000000000000000000000",
        "withdrawals": [],
        "parentBeaconBlockRoot": B256::ZERO,
        "gasLimit": "0x1c9c380",
    }))
    .unwrap()
}

pub fn test_state() -> ForkchoiceState {
    ForkchoiceState {
        head_block_hash: B256::repeat_byte(0x01),
        safe_block_hash: B256::repeat_byte(0x02),
        finalized_block_hash: B256::repeat_byte(0x03),
    }
}

fn unavailable() -> RpcClientError {
    RpcClientError::Other("engine unavailable".to_string())
}

/// In-process chain client with canned responses that records every call it receives.
#[derive(Clone, Default)]
pub struct MockChain {
    calls: Arc<Mutex<Vec<&'static str>>>,
    pub fcu_requests: Arc<Mutex<Vec<(ForkchoiceState, Option<OpPayloadAttributes>)>>>,
    pub get_payload_requests: Arc<Mutex<Vec<PayloadInfo>>>,
    /// `None` makes the call fail
    fcu_response: Option<ForkchoiceUpdated>,
    /// `None` makes the call fail
    payload: Option<OpExecutionPayloadEnvelope>,
    delay: Option<Duration>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            fcu_response: Some(valid_fcu(None)),
            payload: Some(test_payload(B256::ZERO)),
            ..Default::default()
        }
    }

    pub fn with_fcu(mut self, response: ForkchoiceUpdated) -> Self {
        self.fcu_response = Some(response);
        self
    }

    pub fn with_payload(mut self, payload: OpExecutionPayloadEnvelope) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fcu_response = None;
        self.payload = None;
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    async fn record(&self, call: &'static str) {
        self.calls.lock().push(call);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn block_ref(&self, number: u64) -> L2BlockRef {
        L2BlockRef {
            number,
            hash: B256::with_last_byte(number as u8),
            ..Default::default()
        }
    }
}

#[async_trait]
impl EngineApiExt for MockChain {
    async fn get_payload(
        &self,
        payload_info: PayloadInfo,
    ) -> ClientResult<OpExecutionPayloadEnvelope> {
        self.get_payload_requests.lock().push(payload_info);
        self.record("get_payload").await;
        self.payload.clone().ok_or_else(unavailable)
    }

    async fn fork_choice_updated(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: Option<OpPayloadAttributes>,
    ) -> ClientResult<ForkchoiceUpdated> {
        self.fcu_requests
            .lock()
            .push((fork_choice_state, payload_attributes));
        self.record("fork_choice_updated").await;
        self.fcu_response.clone().ok_or_else(unavailable)
    }
}

#[async_trait]
impl L2Chain for MockChain {
    async fn new_payload(&self, _new_payload: NewPayload) -> ClientResult<PayloadStatus> {
        self.record("new_payload").await;
        Ok(PayloadStatus::from_status(PayloadStatusEnum::Valid))
    }

    async fn payload_by_hash(&self, _hash: B256) -> ClientResult<OpExecutionPayloadEnvelope> {
        self.record("payload_by_hash").await;
        self.payload.clone().ok_or_else(unavailable)
    }

    async fn payload_by_number(&self, _number: u64) -> ClientResult<OpExecutionPayloadEnvelope> {
        self.record("payload_by_number").await;
        self.payload.clone().ok_or_else(unavailable)
    }

    async fn l2_block_ref_by_label(&self, _label: BlockLabel) -> ClientResult<L2BlockRef> {
        self.record("l2_block_ref_by_label").await;
        Ok(self.block_ref(10))
    }

    async fn l2_block_ref_by_hash(&self, _hash: B256) -> ClientResult<L2BlockRef> {
        self.record("l2_block_ref_by_hash").await;
        Ok(self.block_ref(11))
    }

    async fn l2_block_ref_by_number(&self, number: u64) -> ClientResult<L2BlockRef> {
        self.record("l2_block_ref_by_number").await;
        Ok(self.block_ref(number))
    }

    async fn system_config_by_l2_hash(&self, _hash: B256) -> ClientResult<SystemConfig> {
        self.record("system_config_by_l2_hash").await;
        Ok(SystemConfig {
            gas_limit: 30_000_000,
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub target: String,
    pub fields: String,
}

/// Collects every event emitted while installed as the thread's default subscriber.
#[derive(Clone, Default)]
pub struct LogCapture {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl LogCapture {
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub fn errors(&self) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == Level::ERROR)
            .cloned()
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|event| event.fields.contains(needle))
    }
}

#[derive(Default)]
struct FieldVisitor(String);

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.push_str(&format!("{}={:?} ", field.name(), value));
    }
}

impl<S: Subscriber> tracing_subscriber::Layer<S> for LogCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            fields: visitor.0,
        });
    }
}

/// Engine API server double answering the calls the builder client makes.
#[derive(Clone)]
pub struct MockEngineServer {
    pub fcu_requests: Arc<Mutex<Vec<(ForkchoiceState, Option<OpPayloadAttributes>)>>>,
    pub get_payload_requests: Arc<Mutex<Vec<PayloadId>>>,
    pub auth_headers: Arc<Mutex<Vec<String>>>,
    pub fcu_response: ForkchoiceUpdated,
    pub get_payload_v3_response: OpExecutionPayloadEnvelopeV3,
    pub get_payload_v4_response: OpExecutionPayloadEnvelopeV4,
}

impl MockEngineServer {
    pub fn new() -> Self {
        Self {
            fcu_requests: Default::default(),
            get_payload_requests: Default::default(),
            auth_headers: Default::default(),
            fcu_response: valid_fcu(None),
            get_payload_v3_response: test_envelope_v3(B256::ZERO),
            get_payload_v4_response: test_envelope_v4(B256::ZERO),
        }
    }

    pub fn saw_bearer_token(&self) -> bool {
        let headers = self.auth_headers.lock();
        !headers.is_empty() && headers.iter().all(|h| h.starts_with("Bearer "))
    }
}

pub async fn spawn_server(mock: MockEngineServer) -> (ServerHandle, SocketAddr) {
    let middleware = tower::ServiceBuilder::new().layer(RecordAuthLayer {
        headers: mock.auth_headers.clone(),
    });
    let server = ServerBuilder::default()
        .set_http_middleware(middleware)
        .build("127.0.0.1:0")
        .await
        .unwrap();
    let server_addr = server.local_addr().expect("Missing local address");

    let mut module: RpcModule<()> = RpcModule::new(());

    let fcu_mock = mock.clone();
    module
        .register_method("engine_forkchoiceUpdatedV3", move |params, _, _| {
            let params: (ForkchoiceState, Option<OpPayloadAttributes>) = params.parse()?;
            fcu_mock.fcu_requests.lock().push(params);
            RpcResult::Ok(fcu_mock.fcu_response.clone())
        })
        .unwrap();

    let v3_mock = mock.clone();
    module
        .register_method("engine_getPayloadV3", move |params, _, _| {
            let params: (PayloadId,) = params.parse()?;
            v3_mock.get_payload_requests.lock().push(params.0);
            RpcResult::Ok(v3_mock.get_payload_v3_response.clone())
        })
        .unwrap();

    let v4_mock = mock;
    module
        .register_method("engine_getPayloadV4", move |params, _, _| {
            let params: (PayloadId,) = params.parse()?;
            v4_mock.get_payload_requests.lock().push(params.0);
            RpcResult::Ok(v4_mock.get_payload_v4_response.clone())
        })
        .unwrap();

    (server.start(module), server_addr)
}

#[derive(Clone)]
struct RecordAuthLayer {
    headers: Arc<Mutex<Vec<String>>>,
}

impl<S> TowerLayer<S> for RecordAuthLayer {
    type Service = RecordAuth<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RecordAuth {
            headers: self.headers.clone(),
            inner,
        }
    }
}

#[derive(Clone)]
struct RecordAuth<S> {
    headers: Arc<Mutex<Vec<String>>>,
    inner: S,
}

impl<S, B> Service<http::Request<B>> for RecordAuth<S>
where
    S: Service<http::Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<B>) -> Self::Future {
        if let Some(value) = request.headers().get(AUTHORIZATION) {
            self.headers
                .lock()
                .push(value.to_str().unwrap_or_default().to_string());
        }
        self.inner.call(request)
    }
}
