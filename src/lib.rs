mod client;
pub use client::{auth::*, rpc::*};

mod cli;
pub use cli::*;

mod chain;
pub use chain::*;

mod engine_api;
pub use engine_api::*;

mod metrics;
pub use metrics::*;

mod multiplexer;
pub use multiplexer::*;

mod payload;
pub use payload::*;

mod tracing;
pub use tracing::*;
