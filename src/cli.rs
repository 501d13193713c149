use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing::{Level, info};

use crate::{BuilderArgs, BuilderMultiplexer, L2Chain, init_metrics, init_tracing};

/// Settings for layering a builder engine behind the node's fallback engine client.
///
/// Meant to be flattened into the node's own argument struct.
#[derive(Clone, Parser, Debug)]
pub struct MultiplexerArgs {
    #[clap(flatten)]
    pub builder: BuilderArgs,

    /// Isthmus activation timestamp, payloads from then on are fetched with getPayloadV4
    #[arg(long, env)]
    pub isthmus_time: Option<u64>,

    // Enable tracing
    #[arg(long, env, default_value = "false")]
    pub tracing: bool,

    /// OTLP endpoint
    #[arg(long, env, default_value = "http://localhost:4317")]
    pub otlp_endpoint: String,

    // Enable Prometheus metrics
    #[arg(long, env, default_value = "false")]
    pub metrics: bool,

    /// Host to run the metrics server on
    #[arg(long, env, default_value = "127.0.0.1")]
    pub metrics_host: String,

    /// Port to run the metrics server on
    #[arg(long, env, default_value = "9090")]
    pub metrics_port: u16,

    /// Log level
    #[arg(long, env, default_value = "info")]
    pub log_level: Level,

    /// Log format
    #[arg(long, env, default_value = "text")]
    pub log_format: LogFormat,

    /// Redirect logs to a file
    #[arg(long, env)]
    pub log_file: Option<PathBuf>,
}

impl MultiplexerArgs {
    /// Installs the tracing subscriber and the metrics exporter.
    pub fn init_telemetry(&self) -> eyre::Result<()> {
        init_tracing(self)?;
        init_metrics(self)
    }

    /// Puts the configured builder behind `fallback`. Without a builder url the fallback is
    /// returned as is.
    ///
    /// Counters register with the metrics recorder on first use, so this may run before
    /// [`Self::init_telemetry`].
    pub fn wrap(&self, fallback: Arc<dyn L2Chain>) -> eyre::Result<Arc<dyn L2Chain>> {
        let Some(mut builder_client) = self.builder.new_rpc_client()? else {
            info!(message = "no builder configured, using the fallback engine only");
            return Ok(fallback);
        };
        if let Some(isthmus_time) = self.isthmus_time {
            builder_client = builder_client.with_isthmus_time(isthmus_time);
        }
        info!(
            message = "multiplexing payloads with builder",
            "url" = %builder_client.auth_rpc(),
        );

        let mut multiplexer = BuilderMultiplexer::new(fallback, Arc::new(builder_client));
        if let Some(timeout) = self.builder.builder_call_timeout() {
            multiplexer = multiplexer.with_builder_timeout(timeout);
        }
        Ok(Arc::new(multiplexer))
    }
}

#[derive(Clone, Debug)]
pub enum LogFormat {
    Json,
    Text,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "text" => Ok(LogFormat::Text),
            _ => Err("Invalid log format".into()),
        }
    }
}
