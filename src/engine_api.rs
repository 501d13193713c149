use alloy_primitives::B256;
use alloy_rpc_types_engine::{ForkchoiceState, ForkchoiceUpdated, PayloadId, PayloadStatus};
use jsonrpsee::{
    core::{RpcResult, async_trait},
    proc_macros::rpc,
};
use op_alloy_rpc_types_engine::{
    OpExecutionPayloadEnvelopeV3, OpExecutionPayloadEnvelopeV4, OpPayloadAttributes,
};

use crate::{
    BlockLabel, ClientResult, L2BlockRef, NewPayload, OpExecutionPayloadEnvelope, PayloadInfo,
    SystemConfig,
};

/// Engine API methods the builder client calls on a remote engine.
#[rpc(client, namespace = "engine")]
pub trait EngineApi {
    #[method(name = "forkchoiceUpdatedV3")]
    async fn fork_choice_updated_v3(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: Option<OpPayloadAttributes>,
    ) -> RpcResult<ForkchoiceUpdated>;

    #[method(name = "getPayloadV3")]
    async fn get_payload_v3(
        &self,
        payload_id: PayloadId,
    ) -> RpcResult<OpExecutionPayloadEnvelopeV3>;

    #[method(name = "getPayloadV4")]
    async fn get_payload_v4(
        &self,
        payload_id: PayloadId,
    ) -> RpcResult<OpExecutionPayloadEnvelopeV4>;
}

/// Payload construction calls. This is everything a builder backend has to support.
#[async_trait]
pub trait EngineApiExt: Send + Sync {
    async fn get_payload(&self, payload_info: PayloadInfo)
    -> ClientResult<OpExecutionPayloadEnvelope>;

    async fn fork_choice_updated(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: Option<OpPayloadAttributes>,
    ) -> ClientResult<ForkchoiceUpdated>;
}

/// Full chain client capability set the consensus driver depends on.
#[async_trait]
pub trait L2Chain: EngineApiExt {
    async fn new_payload(&self, new_payload: NewPayload) -> ClientResult<PayloadStatus>;

    async fn payload_by_hash(&self, hash: B256) -> ClientResult<OpExecutionPayloadEnvelope>;

    async fn payload_by_number(&self, number: u64) -> ClientResult<OpExecutionPayloadEnvelope>;

    async fn l2_block_ref_by_label(&self, label: BlockLabel) -> ClientResult<L2BlockRef>;

    async fn l2_block_ref_by_hash(&self, hash: B256) -> ClientResult<L2BlockRef>;

    async fn l2_block_ref_by_number(&self, number: u64) -> ClientResult<L2BlockRef>;

    async fn system_config_by_l2_hash(&self, hash: B256) -> ClientResult<SystemConfig>;
}
