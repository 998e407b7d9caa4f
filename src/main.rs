//! Media drive server binary.
//!
//! Serves a sandboxed base directory over HTTP behind Basic auth: HTML
//! directory listings, file downloads with byte ranges, and multipart uploads.
//! Credentials live in a JSON settings file that is re-read on every request.

mod atomic;
mod auth;
mod config;
mod error;
mod files;
mod http;
mod listing;
mod logging;
mod routes;
mod sandbox;
mod settings;
mod upload;

use axum::extract::connect_info::ConnectInfo;
use axum::http::Request;
use axum_server::Handle;
use clap::Parser;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::config::Args;
use crate::http::resolve_client_ip;
use crate::sandbox::Sandbox;
use crate::settings::{SettingsStore, parse_interface};

/// Starts the server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let config_path = std::path::absolute(args.config_path())?;
    info!(path = %config_path.display(), "using config file");

    let store = Arc::new(SettingsStore::new(config_path));
    let settings = store.load().await.map_err(io::Error::other)?;
    let sandbox = Arc::new(Sandbox::open(Path::new(&settings.base_directory)).await?);
    info!(root = %sandbox.root_path().display(), "sandbox root");

    let mut addr = settings.bind_addr().map_err(io::Error::other)?;
    if let Some(bind) = args.bind.as_deref() {
        addr.set_ip(parse_interface(bind).map_err(io::Error::other)?);
    }
    if let Some(port) = args.port {
        addr.set_port(port);
    }

    let app = routes::build_router(sandbox, store).layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<_>| {
                let connect_ip = request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip());
                let client_ip = resolve_client_ip(request.headers(), connect_ip)
                    .map(|ip| ip.to_string())
                    .unwrap_or_else(|| "unknown".to_string());

                info_span!(
                    env!("CARGO_CRATE_NAME"),
                    client_ip,
                    method = ?request.method(),
                    path = ?request.uri().path(),
                )
            })
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let handle = Handle::new();
    info!("Server running at http://{}", addr);

    let server = axum_server::bind(addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
