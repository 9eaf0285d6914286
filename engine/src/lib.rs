//! The ingestion engine: config, models, job store, tag cache, event bus,
//! site handler registry, extractor, tagger, Booru client, and the HTTP
//! control/query API.

#[macro_use]
extern crate serde_derive;

cfg_if::cfg_if! {
    if #[cfg(feature = "api")] {
        extern crate serde_json;

        use std::net::{IpAddr, SocketAddr};
        use tower_http::cors::CorsLayer;
        use axum::http::Method;
    }
}

mod args;
pub mod conf;
pub mod models;
pub mod pipeline;
#[cfg(feature = "api")]
mod routes;
pub mod utils;

pub use conf::Conf;

#[cfg(feature = "client")]
pub mod client;
#[cfg(feature = "client")]
pub use client::{BooruClient, Error};

#[cfg(feature = "api")]
/// Build the axum app: mount every route group and layer tracing/cors.
///
/// # Arguments
///
/// * `state` - The shared application state
/// * `conf` - The engine configuration
fn build_app(state: utils::AppState, conf: &Conf) -> axum::Router {
    use axum::extract::DefaultBodyLimit;
    use axum::http::header::{HeaderName, HeaderValue};
    use axum::{http::Request, response::Response};
    use routes::{basic, docs, events, jobs, system};
    use std::time::Duration;
    use tower_http::trace::{DefaultMakeSpan, TraceLayer};
    use tracing::{event, Level, Span};
    use utils::ids::{ReqId, ReqIdLayer};

    let mut app = axum::Router::new();
    app = basic::mount(app);
    app = docs::mount(app);
    app = events::mount(app);
    app = jobs::mount(app);
    app = system::mount(app);

    let cors = if conf.cors.insecure {
        CorsLayer::permissive()
    } else {
        let cors = CorsLayer::new().allow_methods([Method::GET, Method::POST, Method::DELETE]);
        let origins = conf
            .cors
            .domains
            .iter()
            .map(|domain| domain.parse())
            .collect::<Result<Vec<HeaderValue>, _>>()
            .expect("Failed to parse CORS domains");
        cors.allow_origin(origins)
    };
    app = app
        .layer(DefaultBodyLimit::max(conf.max_upload_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(|req: &Request<_>, span: &Span| {
                    let path = req.uri().path();
                    let req_id = req
                        .extensions()
                        .get::<ReqId>()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    event!(parent: span, Level::INFO, path, req_id, msg = "starting request");
                })
                .on_response(|response: &Response, latency: Duration, span: &Span| {
                    let code = response.status();
                    event!(
                        parent: span,
                        Level::INFO,
                        code = code.as_u16(),
                        latency_ms = latency.as_millis() as u64,
                        msg = "responding to request"
                    );
                }),
        )
        .layer(ReqIdLayer)
        .layer(cors)
        .layer(tower_http::set_header::SetResponseHeaderLayer::overriding(
            HeaderName::from_static("ingest-engine-version"),
            HeaderValue::from_str(env!("CARGO_PKG_VERSION"))
                .expect("engine version is not a valid header value"),
        ));
    app.with_state(state)
}

#[cfg(feature = "api")]
/// Launch the HTTP control/query API.
///
/// # Panics
///
/// Panics if the bind address cannot be parsed or bound after repeated retries.
pub async fn axum(config: Conf) {
    utils::trace::setup("ingest-engine", &config.tracing);
    let shared = utils::Shared::new(config.clone()).await;
    tracing::info!(host = %config.bind_host, port = config.bind_port, "starting ingest engine api");
    let state = utils::AppState::new(shared);
    let app = build_app(state, &config);
    let bind_addr: IpAddr = config
        .bind_host
        .parse()
        .expect("failed to parse bind host");
    let addr = SocketAddr::new(bind_addr, config.bind_port);
    let mut attempts = 0;
    loop {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .unwrap_or_else(|_| panic!("failed to bind to {addr}"));
        match axum::serve(listener, app.clone()).await {
            Ok(()) => break,
            Err(error) => tracing::error!(%error, "api server crashed, retrying bind"),
        }
        attempts += 1;
        assert!(attempts <= 10, "failed to bind server in 10 attempts");
        tokio::time::sleep(std::time::Duration::from_secs(3)).await;
    }
}
