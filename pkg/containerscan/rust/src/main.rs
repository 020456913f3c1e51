// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

// Correctness
#![deny(clippy::indexing_slicing)]
#![deny(clippy::string_slice)]
#![deny(clippy::cast_possible_wrap)]
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use dd_containerscan::config;
use dd_containerscan::register::AgentInfo;
use dd_containerscan::{AgentConfig, ScanAgent, Scanner, SnapshotStore};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::MissedTickBehavior;

mod cli;

use cli::Args;

static HEALTHY: &[u8] = b"OK\n";
static NOTFOUND: &[u8] = b"Not found";

type HttpResponse = Response<BoxBody<Bytes, std::io::Error>>;

fn text_response(status: StatusCode, body: &'static [u8]) -> Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("Failed to build response: {}", e))
}

fn not_found() -> Result<HttpResponse> {
    text_response(StatusCode::NOT_FOUND, NOTFOUND)
}

fn json_response(body: serde_json::Result<String>) -> Result<HttpResponse> {
    let body = body.context("Failed to serialize response")?;
    Response::builder()
        .header("Content-Type", "application/json")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("Failed to build response: {}", e))
}

/// Maps a request onto the published snapshot. Handlers never trigger a
/// scan; they serve whatever the last successful cycle produced.
fn route(method: &Method, path: &str, store: &SnapshotStore) -> Result<HttpResponse> {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    };

    match (method, path) {
        (&Method::GET, "/") => text_response(StatusCode::OK, HEALTHY),
        (&Method::GET, "/PIDINFO") => json_response(store.current().process_report_json()),
        (&Method::GET, "/PODINFO") => json_response(store.current().container_report_json()),
        (&Method::GET, "/Register") => json_response(AgentInfo::from_env().to_json()),
        _ => {
            debug!("{} Request to unknown endpoint: {}", method, path);
            not_found()
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    store: Arc<SnapshotStore>,
) -> Result<HttpResponse> {
    route(req.method(), req.uri().path(), &store)
}

fn internal_server_error() -> HttpResponse {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(
            Full::new(Bytes::from(&b"Internal Server Error"[..]))
                .map_err(|e| match e {})
                .boxed(),
        )
        .unwrap_or_else(|_| {
            // Last resort if even error response building fails
            Response::new(
                Full::new(Bytes::from(&b"Error"[..]))
                    .map_err(|e| match e {})
                    .boxed(),
            )
        })
}

/// Runs one scan cycle after `initial_delay`, then one per `interval`. A
/// cycle always completes before the next one starts; ticks missed while a
/// cycle overran are skipped.
async fn run_scheduler(agent: Arc<ScanAgent>, initial_delay: Duration, interval: Duration) {
    tokio::time::sleep(initial_delay).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let agent = Arc::clone(&agent);
        if let Err(e) = tokio::task::spawn_blocking(move || agent.run_cycle()).await {
            error!("Scan cycle task failed: {e}");
        }
    }
}

async fn run_agent(config: AgentConfig) -> Result<()> {
    let store = Arc::new(SnapshotStore::new());
    let agent = Arc::new(ScanAgent::new(
        Scanner::new(config.paths.clone()),
        Arc::clone(&store),
    ));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;
    info!("Listening on {addr}");

    // Setup signal handlers
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    info!(
        "Scanning every {:?}, first scan in {:?}",
        config.scan_interval, config.initial_delay
    );
    let scheduler = tokio::spawn(run_scheduler(
        agent,
        config.initial_delay,
        config.scan_interval,
    ));

    loop {
        tokio::select! {
            // Handle incoming connections
            accept_result = listener.accept() => {
                let stream = match accept_result {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Failed to accept connection: {e}");
                        continue;
                    }
                };

                // Use an adapter to access something implementing `tokio::io` traits as if they
                // implement `hyper::rt` IO traits.
                let io = TokioIo::new(stream);
                let store = Arc::clone(&store);

                // Spawn a tokio task to serve multiple connections concurrently
                tokio::task::spawn(async move {
                    if let Err(err) = http1::Builder::new()
                        .serve_connection(
                            io,
                            service_fn(move |req| {
                                let store = Arc::clone(&store);
                                async move {
                                    Ok::<_, anyhow::Error>(
                                        handle_request(req, store).await.unwrap_or_else(|e| {
                                            error!("Request handling failed: {e}");
                                            internal_server_error()
                                        }),
                                    )
                                }
                            }),
                        )
                        .await
                    {
                        error!("Error serving connection: {err}");
                    }
                });
            }
            // Handle SIGTERM
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            // Handle SIGINT
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
        }
    }

    scheduler.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config_path = config::config_file_path(args.config);
    let doc = config::load_config(Some(config_path.clone()));
    let log_level = config::get_log_level(&doc);
    simple_logger::init_with_level(log_level)?;
    info!("Log level set to: {:?}", log_level);

    // A missing or unreadable config file is reported but not fatal, the
    // environment and defaults still make a working agent.
    let doc = match doc {
        Ok(Some(doc)) => Some(doc),
        Ok(None) => {
            warn!(
                "Config file not found at {}. Checking environment variables only.",
                config_path.display()
            );
            None
        }
        Err(e) => {
            warn!("Ignoring config file {}: {e:#}", config_path.display());
            None
        }
    };
    let mut agent_config = AgentConfig::from_yaml(doc.as_ref());
    if let Some(port) = args.port {
        agent_config.http_port = port;
    }

    info!(
        "Starting container-scan-agent (host root {})",
        agent_config.paths.host_root.display()
    );
    run_agent(agent_config).await
}
