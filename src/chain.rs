use alloy_primitives::{Address, B256};
use alloy_rpc_types_eth::BlockNumberOrTag;
use serde::{Deserialize, Serialize};

/// Named L2 block positions understood by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockLabel {
    #[serde(rename = "latest")]
    Unsafe,
    Safe,
    Finalized,
}

impl From<BlockLabel> for BlockNumberOrTag {
    fn from(label: BlockLabel) -> Self {
        match label {
            BlockLabel::Unsafe => BlockNumberOrTag::Latest,
            BlockLabel::Safe => BlockNumberOrTag::Safe,
            BlockLabel::Finalized => BlockNumberOrTag::Finalized,
        }
    }
}

impl std::fmt::Display for BlockLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockLabel::Unsafe => write!(f, "latest"),
            BlockLabel::Safe => write!(f, "safe"),
            BlockLabel::Finalized => write!(f, "finalized"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: B256,
    pub number: u64,
}

/// Reference to an L2 block together with the L1 block it was derived from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L2BlockRef {
    pub hash: B256,
    pub number: u64,
    pub parent_hash: B256,
    pub timestamp: u64,
    #[serde(rename = "l1origin")]
    pub l1_origin: BlockId,
    pub sequence_number: u64,
}

impl L2BlockRef {
    pub fn id(&self) -> BlockId {
        BlockId {
            hash: self.hash,
            number: self.number,
        }
    }
}

/// Rollup system configuration as of a given L2 block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemConfig {
    pub batcher_addr: Address,
    pub overhead: B256,
    pub scalar: B256,
    pub gas_limit: u64,
}
