//! fbox server binary.
//!
//! Clients declare a batch of files, receive an 8-digit box code, upload the
//! content (through this server or straight to an S3 compatible store), and
//! share the code for download until the box expires and is archived.

mod admin;
mod atomic;
mod cards;
mod clock;
mod config;
mod error;
mod files;
mod http;
mod locking;
mod logging;
mod model;
mod rate;
mod registry;
mod service;
mod storage;
mod sweeper;
mod token;
mod version;

use axum::extract::{Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, info_span};

use crate::admin::AdminPassword;
use crate::clock::SystemClock;
use crate::config::Args;
use crate::http::{build_cors_layer, resolve_client_ip};
use crate::registry::Registry;
use crate::service::BoxService;
use crate::storage::build_backend;
use crate::sweeper::Sweeper;
use crate::token::TokenSigner;

shadow!(build);

/// Starts the fbox server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let storage = build_backend(&args, args.url_ttl())
        .await
        .map_err(io::Error::other)?;
    info!(backend = ?storage.kind(), "storage ready");
    let registry = Arc::new(
        Registry::load(storage, Arc::new(SystemClock), args.box_policy())
            .await
            .map_err(io::Error::other)?,
    );
    let service = Arc::new(BoxService::new(
        registry.clone(),
        TokenSigner::new(args.secret_key.clone()),
        args.rate_limits(),
    ));
    let admin_password = AdminPassword(Arc::from(args.admin_password.as_str()));

    let shutdown = CancellationToken::new();
    let sweeper = Arc::new(Sweeper::new(registry, args.sweep_interval()));
    let sweeper_task = sweeper.spawn(shutdown.clone());

    let admin_routes = Router::new()
        .route("/api/admin/boxes", get(admin::list_boxes))
        .route("/api/admin/boxes/{code}", get(admin::get_box))
        .route_layer(middleware::from_fn(admin::require_admin));

    let mut app = Router::new()
        .route("/api/files/capacity", get(files::get_capacity))
        .route("/api/files/", post(files::create_box))
        .route(
            "/api/files/{code}",
            get(files::get_box).patch(files::finalize_box),
        )
        .route(
            "/api/files/{code}/{filename}",
            get(files::download_file)
                .post(files::upload_chunk)
                .patch(files::finalize_file),
        )
        .route("/api/cards/", post(cards::issue_card))
        .route("/api/cards/detail", post(cards::card_detail))
        .route("/api/cards/renew", post(cards::renew_card))
        .route("/api/version", get(version::get_version_info))
        .merge(admin_routes)
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
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
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(service))
        .layer(Extension(admin_password));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", http_addr);
    tokio::spawn(shutdown_signal(handle.clone(), shutdown.clone()));

    let result = axum_server::bind(http_addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await;

    shutdown.cancel();
    if let Some(task) = sweeper_task
        && let Err(err) = task.await
    {
        error!(error = %err, "sweeper task failed");
    }
    result
}

async fn shutdown_signal(handle: Handle, shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    shutdown.cancel();
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
