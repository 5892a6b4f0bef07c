use std::{io, net::SocketAddr, time::Duration};

use axum::{
    extract::MatchedPath,
    http::{self, header, StatusCode, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use axum_server::{bind, bind_rustls, tls_rustls::RustlsConfig, Handle as ServerHandle};
use croupier::{api::gateway, services, Config, KeyValueDatabase};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::{self, CorsLayer},
    trace::TraceLayer,
    ServiceBuilderExt as _,
};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() {
    croupier::clap::parse();

    // Initialize config
    let raw_config = Figment::new()
        .merge(
            Toml::file(Env::var("CROUPIER_CONFIG").expect(
                "The CROUPIER_CONFIG env var needs to be set. Example: /etc/croupier.toml",
            ))
            .nested(),
        )
        .merge(Env::prefixed("CROUPIER_").global());

    let config = match raw_config.extract::<Config>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    config.warn_deprecated();

    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn").unwrap()
        }
    };

    let subscriber = registry.with(filter_layer).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();

    info!("Loading database");
    if let Err(error) = KeyValueDatabase::load_or_create(config).await {
        error!(?error, "The database couldn't be loaded or created");

        std::process::exit(1);
    };

    info!("Starting server");
    run_server().await.unwrap();
}

async fn run_server() -> io::Result<()> {
    let config = &services().globals.config;
    let addr = SocketAddr::from((config.address, config.port));

    let middlewares = ServiceBuilder::new()
        .sensitive_headers([header::AUTHORIZATION])
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &http::Request<_>| {
                let path = if let Some(path) = request.extensions().get::<MatchedPath>() {
                    path.as_str()
                } else {
                    request.uri().path()
                };

                tracing::info_span!("http_request", %path)
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([http::Method::GET])
                .allow_headers([header::ORIGIN, header::CONTENT_TYPE, header::AUTHORIZATION])
                .max_age(Duration::from_secs(86400)),
        );

    let app = Router::new()
        .route("/ws/room/:room_id", get(gateway::upgrade))
        .route("/", get(it_works))
        .fallback(not_found)
        .layer(middlewares)
        .into_make_service();

    let handle = ServerHandle::new();

    tokio::spawn(shutdown_signal(handle.clone()));

    match &config.tls {
        Some(tls) => {
            let conf = RustlsConfig::from_pem_file(&tls.certs, &tls.key).await?;
            bind_rustls(addr, conf).handle(handle).serve(app).await?;
        }
        None => {
            bind(addr).handle(handle).serve(app).await?;
        }
    }

    Ok(())
}

async fn shutdown_signal(handle: ServerHandle) {
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

    let sig: &str;

    tokio::select! {
        _ = ctrl_c => { sig = "Ctrl+C"; },
        _ = terminate => { sig = "SIGTERM"; },
    }

    warn!("Received {}, shutting down...", sig);

    // Stop accepting upgrades, tell every session to say goodbye, then give
    // stragglers the configured window before the listener dies
    services().globals.shutdown();
    handle.graceful_shutdown(Some(Duration::from_secs(
        services().globals.config.shutdown_grace_s,
    )));
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    warn!("Not found: {uri}");
    StatusCode::NOT_FOUND
}

async fn it_works() -> &'static str {
    "Hello from Croupier!"
}
