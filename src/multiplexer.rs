use std::sync::{Arc, OnceLock};
use std::time::Duration;

use alloy_primitives::B256;
use alloy_rpc_types_engine::{
    ForkchoiceState, ForkchoiceUpdated, PayloadId, PayloadStatus, PayloadStatusEnum,
};
use jsonrpsee::core::async_trait;
use op_alloy_rpc_types_engine::OpPayloadAttributes;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::{
    BlockLabel, ClientResult, EngineApiExt, L2BlockRef, L2Chain, MultiplexerMetrics, NewPayload,
    OpExecutionPayloadEnvelope, PayloadInfo, PayloadSource, RpcClientError, SystemConfig,
};

/// Failures of the builder leg. These never reach the caller, they are logged and counted.
#[derive(Error, Debug)]
pub enum BuilderError {
    #[error(transparent)]
    Call(#[from] RpcClientError),
    #[error("builder call timed out after {0:?}")]
    Timeout(Duration),
    #[error("builder returned different payload id: {builder:?}, expected {fallback:?}")]
    PayloadIdMismatch {
        fallback: Option<PayloadId>,
        builder: Option<PayloadId>,
    },
}

/// Chain client that layers a best-effort builder engine behind an authoritative fallback.
///
/// Every call is answered by the fallback. The builder is only consulted for payload
/// construction, after the fallback succeeded, and its failures degrade to the fallback
/// result instead of surfacing to the caller.
#[derive(Clone)]
pub struct BuilderMultiplexer {
    fallback: Arc<dyn L2Chain>,
    builder: Arc<dyn EngineApiExt>,
    builder_timeout: Option<Duration>,
    /// Registered on first use, against the recorder installed by then
    metrics: Arc<OnceLock<MultiplexerMetrics>>,
}

impl BuilderMultiplexer {
    pub fn new(fallback: Arc<dyn L2Chain>, builder: Arc<dyn EngineApiExt>) -> Self {
        Self {
            fallback,
            builder,
            builder_timeout: None,
            metrics: Arc::new(OnceLock::new()),
        }
    }

    /// Bounds the builder leg of each call. The fallback leg is only bounded by the caller.
    pub fn with_builder_timeout(mut self, timeout: Duration) -> Self {
        self.builder_timeout = Some(timeout);
        self
    }

    pub fn with_metrics(mut self, metrics: MultiplexerMetrics) -> Self {
        self.metrics = Arc::new(OnceLock::from(metrics));
        self
    }

    fn metrics(&self) -> &MultiplexerMetrics {
        self.metrics.get_or_init(MultiplexerMetrics::default)
    }

    async fn with_builder_deadline<T>(
        &self,
        call: impl Future<Output = ClientResult<T>>,
    ) -> Result<T, BuilderError> {
        match self.builder_timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| BuilderError::Timeout(timeout))?
                .map_err(BuilderError::from),
            None => call.await.map_err(BuilderError::from),
        }
    }

    #[instrument(skip_all, fields(payload_id = %payload_info.id, payload_source))]
    async fn get_payload(
        &self,
        payload_info: PayloadInfo,
    ) -> ClientResult<OpExecutionPayloadEnvelope> {
        let fallback_payload = self.fallback.get_payload(payload_info).await?;

        let builder_payload = self
            .with_builder_deadline(self.builder.get_payload(payload_info))
            .await;

        let (payload, source) = match builder_payload {
            Ok(builder_payload) => {
                info!(
                    message = "returning payload from builder",
                    "payload_id" = %payload_info.id,
                    "block_hash" = %builder_payload.block_hash(),
                    "gas_used" = builder_payload.gas_used(),
                    "tx_count" = builder_payload.tx_count(),
                    "fallback_gas_used" = fallback_payload.gas_used(),
                    "fallback_tx_count" = fallback_payload.tx_count(),
                );
                (builder_payload, PayloadSource::Builder)
            }
            Err(e) => {
                error!(
                    message = "builder get payload failed",
                    "payload_id" = %payload_info.id,
                    "error" = %e,
                );
                (fallback_payload, PayloadSource::Fallback)
            }
        };

        tracing::Span::current().record("payload_source", source.to_string());
        if source.is_builder() {
            self.metrics().builder_payloads.increment(1);
        } else {
            self.metrics().fallback_payloads.increment(1);
        }
        Ok(payload)
    }

    #[instrument(
        skip_all,
        fields(
            head_block_hash = %fork_choice_state.head_block_hash,
            has_attributes = payload_attributes.is_some(),
        )
    )]
    async fn fork_choice_updated(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: Option<OpPayloadAttributes>,
    ) -> ClientResult<ForkchoiceUpdated> {
        let Some(payload_attributes) = payload_attributes else {
            // No block building, nothing for the builder to do.
            return self
                .fallback
                .fork_choice_updated(fork_choice_state, None)
                .await;
        };

        let res = self
            .fallback
            .fork_choice_updated(fork_choice_state, Some(payload_attributes.clone()))
            .await?;
        if res.payload_status.status != PayloadStatusEnum::Valid {
            return Ok(res);
        }

        if let Err(e) = self
            .builder_multiplex(fork_choice_state, payload_attributes, &res)
            .await
        {
            if matches!(e, BuilderError::PayloadIdMismatch { .. }) {
                self.metrics().payload_id_mismatches.increment(1);
            } else {
                self.metrics().builder_fcu_failures.increment(1);
            }
            error!(
                message = "builder forkchoice update failed",
                "head_block_hash" = %fork_choice_state.head_block_hash,
                "error" = %e,
            );
        }

        Ok(res)
    }

    /// Starts the same build job on the builder and checks it agrees with the fallback on the
    /// payload id.
    async fn builder_multiplex(
        &self,
        fork_choice_state: ForkchoiceState,
        payload_attributes: OpPayloadAttributes,
        fallback_res: &ForkchoiceUpdated,
    ) -> Result<(), BuilderError> {
        let builder_res = self
            .with_builder_deadline(
                self.builder
                    .fork_choice_updated(fork_choice_state, Some(payload_attributes)),
            )
            .await?;

        if builder_res.payload_status.status != PayloadStatusEnum::Valid {
            // the builder might not be synced yet
            debug!(
                message = "builder not ready to build",
                "head_block_hash" = %fork_choice_state.head_block_hash,
                "status" = %builder_res.payload_status.status,
            );
            self.metrics().builder_not_ready.increment(1);
            return Ok(());
        }

        if builder_res.payload_id != fallback_res.payload_id {
            return Err(BuilderError::PayloadIdMismatch {
                fallback: fallback_res.payload_id,
                builder: builder_res.payload_id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineApiExt for BuilderMultiplexer {
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
        self.fork_choice_updated(fork_choice_state, payload_attributes)
            .await
    }
}

#[async_trait]
impl L2Chain for BuilderMultiplexer {
    async fn new_payload(&self, new_payload: NewPayload) -> ClientResult<PayloadStatus> {
        self.fallback.new_payload(new_payload).await
    }

    async fn payload_by_hash(&self, hash: B256) -> ClientResult<OpExecutionPayloadEnvelope> {
        self.fallback.payload_by_hash(hash).await
    }

    async fn payload_by_number(&self, number: u64) -> ClientResult<OpExecutionPayloadEnvelope> {
        self.fallback.payload_by_number(number).await
    }

    async fn l2_block_ref_by_label(&self, label: BlockLabel) -> ClientResult<L2BlockRef> {
        self.fallback.l2_block_ref_by_label(label).await
    }

    async fn l2_block_ref_by_hash(&self, hash: B256) -> ClientResult<L2BlockRef> {
        self.fallback.l2_block_ref_by_hash(hash).await
    }

    async fn l2_block_ref_by_number(&self, number: u64) -> ClientResult<L2BlockRef> {
        self.fallback.l2_block_ref_by_number(number).await
    }

    async fn system_config_by_l2_hash(&self, hash: B256) -> ClientResult<SystemConfig> {
        self.fallback.system_config_by_l2_hash(hash).await
    }
}
