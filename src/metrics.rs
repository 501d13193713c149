use std::net::SocketAddr;

use eyre::Result;
use metrics::Counter;
use metrics_derive::Metrics;
use metrics_exporter_prometheus::PrometheusBuilder;
use metrics_util::layers::{PrefixLayer, Stack};
use tokio::net::TcpListener;
use tracing::{error, info};

use http::StatusCode;
use hyper::service::service_fn;
use hyper::{Request, Response, server::conn::http1};
use hyper_util::rt::TokioIo;
use jsonrpsee::http_client::HttpBody;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::cli::MultiplexerArgs;

#[derive(Metrics)]
#[metrics(scope = "builder_multiplexer")]
pub struct MultiplexerMetrics {
    #[metric(describe = "Count of get_payload calls answered with the builder payload")]
    pub builder_payloads: Counter,

    #[metric(describe = "Count of get_payload calls answered with the fallback payload")]
    pub fallback_payloads: Counter,

    #[metric(describe = "Count of builder forkchoice updates that errored or timed out")]
    pub builder_fcu_failures: Counter,

    #[metric(describe = "Count of builder forkchoice updates with a non valid status")]
    pub builder_not_ready: Counter,

    #[metric(describe = "Count of builder payload ids that differ from the fallback's")]
    pub payload_id_mismatches: Counter,
}

pub fn init_metrics(args: &MultiplexerArgs) -> Result<()> {
    if args.metrics {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();

        Stack::new(recorder)
            .push(PrefixLayer::new("builder-multiplexer"))
            .install()?;

        let metrics_addr = format!("{}:{}", args.metrics_host, args.metrics_port);
        let addr: SocketAddr = metrics_addr.parse()?;
        tokio::spawn(init_metrics_server(addr, handle));
    }
    Ok(())
}

async fn init_metrics_server(addr: SocketAddr, handle: PrometheusHandle) -> eyre::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server running on {}", addr);

    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let handle = handle.clone();
                tokio::task::spawn(async move {
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let response = match req.uri().path() {
                            "/metrics" => Response::builder()
                                .header("content-type", "text/plain")
                                .body(HttpBody::from(handle.render())),
                            _ => Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(HttpBody::empty()),
                        };

                        async { response }
                    });

                    let io = TokioIo::new(stream);

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        error!(message = "Error serving metrics connection", error = %err);
                    }
                });
            }
            Err(e) => {
                error!(message = "Error accepting connection", error = %e);
            }
        }
    }
}
