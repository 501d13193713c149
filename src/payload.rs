use alloy_primitives::{B256, Bytes};
use alloy_rpc_types_engine::{ExecutionPayloadV3, PayloadId};
use op_alloy_rpc_types_engine::{
    OpExecutionPayloadEnvelopeV3, OpExecutionPayloadEnvelopeV4, OpExecutionPayloadV4,
};

/// Identifies a build job previously started through a forkchoice update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadInfo {
    pub id: PayloadId,
    pub timestamp: u64,
}

impl PayloadInfo {
    pub fn new(id: PayloadId, timestamp: u64) -> Self {
        Self { id, timestamp }
    }

    /// Engine API version to retrieve this payload with. Payloads at or after the Isthmus
    /// activation carry execution requests and are fetched through `engine_getPayloadV4`.
    pub fn version(&self, isthmus_time: Option<u64>) -> PayloadVersion {
        match isthmus_time {
            Some(activation) if self.timestamp >= activation => PayloadVersion::V4,
            _ => PayloadVersion::V3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum OpExecutionPayloadEnvelope {
    V3(OpExecutionPayloadEnvelopeV3),
    V4(OpExecutionPayloadEnvelopeV4),
}

impl OpExecutionPayloadEnvelope {
    pub fn version(&self) -> PayloadVersion {
        match self {
            OpExecutionPayloadEnvelope::V3(_) => PayloadVersion::V3,
            OpExecutionPayloadEnvelope::V4(_) => PayloadVersion::V4,
        }
    }

    pub fn block_hash(&self) -> B256 {
        match self {
            OpExecutionPayloadEnvelope::V3(payload) => {
                payload
                    .execution_payload
                    .payload_inner
                    .payload_inner
                    .block_hash
            }
            OpExecutionPayloadEnvelope::V4(payload) => {
                payload
                    .execution_payload
                    .payload_inner
                    .payload_inner
                    .payload_inner
                    .block_hash
            }
        }
    }

    pub fn gas_used(&self) -> u64 {
        match self {
            OpExecutionPayloadEnvelope::V3(payload) => {
                payload
                    .execution_payload
                    .payload_inner
                    .payload_inner
                    .gas_used
            }
            OpExecutionPayloadEnvelope::V4(payload) => {
                payload
                    .execution_payload
                    .payload_inner
                    .payload_inner
                    .payload_inner
                    .gas_used
            }
        }
    }

    pub fn tx_count(&self) -> usize {
        match self {
            OpExecutionPayloadEnvelope::V3(payload) => payload
                .execution_payload
                .payload_inner
                .payload_inner
                .transactions
                .len(),
            OpExecutionPayloadEnvelope::V4(payload) => payload
                .execution_payload
                .payload_inner
                .payload_inner
                .payload_inner
                .transactions
                .len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPayloadV3 {
    pub payload: ExecutionPayloadV3,
    pub versioned_hashes: Vec<B256>,
    pub parent_beacon_block_root: B256,
}

#[derive(Debug, Clone)]
pub struct NewPayloadV4 {
    pub payload: OpExecutionPayloadV4,
    pub versioned_hashes: Vec<B256>,
    pub parent_beacon_block_root: B256,
    pub execution_requests: Vec<Bytes>,
}

/// Parameters of an `engine_newPayload` call, including the parent beacon block root.
#[derive(Debug, Clone)]
pub enum NewPayload {
    V3(NewPayloadV3),
    V4(NewPayloadV4),
}

impl NewPayload {
    pub fn version(&self) -> PayloadVersion {
        match self {
            NewPayload::V3(_) => PayloadVersion::V3,
            NewPayload::V4(_) => PayloadVersion::V4,
        }
    }

    pub fn parent_beacon_block_root(&self) -> B256 {
        match self {
            NewPayload::V3(v3) => v3.parent_beacon_block_root,
            NewPayload::V4(v4) => v4.parent_beacon_block_root,
        }
    }
}

impl From<OpExecutionPayloadEnvelope> for NewPayload {
    fn from(envelope: OpExecutionPayloadEnvelope) -> Self {
        match envelope {
            OpExecutionPayloadEnvelope::V3(v3) => NewPayload::V3(NewPayloadV3 {
                payload: v3.execution_payload,
                versioned_hashes: vec![],
                parent_beacon_block_root: v3.parent_beacon_block_root,
            }),
            OpExecutionPayloadEnvelope::V4(v4) => NewPayload::V4(NewPayloadV4 {
                payload: v4.execution_payload,
                versioned_hashes: vec![],
                parent_beacon_block_root: v4.parent_beacon_block_root,
                execution_requests: v4.execution_requests,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadVersion {
    V3,
    V4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadSource {
    Fallback,
    Builder,
}

impl std::fmt::Display for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadSource::Fallback => write!(f, "fallback"),
            PayloadSource::Builder => write!(f, "builder"),
        }
    }
}

impl PayloadSource {
    pub fn is_builder(&self) -> bool {
        matches!(self, PayloadSource::Builder)
    }
}
