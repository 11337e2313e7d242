//! HTTP surface: the metrics endpoint, a landing page, and optional TLS.
//!
//! Handlers do no metric work themselves. A scrape request is sent to the
//! writer thread and the rendered exposition text comes back over a oneshot
//! channel, so concurrent scrapes are serialized in arrival order.

use std::net::SocketAddr;
use std::path::Path;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::collector::ScrapeRequest;
use crate::config::WebConfig;

#[derive(Clone)]
struct AppState {
    scrape_tx: mpsc::Sender<ScrapeRequest>,
    metrics_path: String,
}

#[derive(Debug)]
enum MetricsError {
    WriterGone,
    EncodingFailed,
}

impl IntoResponse for MetricsError {
    fn into_response(self) -> Response {
        match self {
            MetricsError::WriterGone => {
                (StatusCode::SERVICE_UNAVAILABLE, "collector is shut down").into_response()
            }
            MetricsError::EncodingFailed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
            }
        }
    }
}

async fn root_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Named Process Exporter</title></head>\n\
         <body>\n\
         <h1>Named Process Exporter</h1>\n\
         <p><a href=\"{}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.metrics_path
    ))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, MetricsError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    state
        .scrape_tx
        .send(ScrapeRequest { reply: reply_tx })
        .await
        .map_err(|_| MetricsError::WriterGone)?;
    let body = reply_rx
        .await
        .map_err(|_| MetricsError::WriterGone)?
        .map_err(|_| MetricsError::EncodingFailed)?;
    Ok((
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        body,
    )
        .into_response())
}

/// Accepts the Go-style `:9256` shorthand for an all-interfaces bind.
pub fn parse_listen_addr(listen_address: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    if listen_address.starts_with(':') {
        format!("0.0.0.0{listen_address}").parse()
    } else {
        listen_address.parse()
    }
}

/// Serves the exporter until SIGINT/SIGTERM. With a TLS block in the web
/// config the listener speaks HTTPS, otherwise plain HTTP.
pub async fn serve(
    listen_address: &str,
    metrics_path: &str,
    web_config: WebConfig,
    scrape_tx: mpsc::Sender<ScrapeRequest>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = parse_listen_addr(listen_address)?;
    let state = AppState {
        scrape_tx,
        metrics_path: metrics_path.to_string(),
    };
    let app = Router::new()
        .route("/", get(root_handler))
        .route(metrics_path, get(metrics_handler))
        .with_state(state);

    let shutdown_signal = async {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
        }
    };

    match web_config.tls_server_config {
        Some(tls) => {
            let tls_config = load_tls_config(&tls.cert_file, &tls.key_file).await?;
            info!("listening on https://{addr}{metrics_path}");
            let server = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service());
            tokio::select! {
                result = server => result?,
                _ = shutdown_signal => {}
            }
        }
        None => {
            let listener = TcpListener::bind(addr).await?;
            info!("listening on http://{addr}{metrics_path}");
            let server = axum::serve(listener, app);
            tokio::select! {
                result = server => result?,
                _ = shutdown_signal => {}
            }
        }
    }
    Ok(())
}

async fn load_tls_config(
    cert_file: &Path,
    key_file: &Path,
) -> Result<RustlsConfig, std::io::Error> {
    info!(
        "loading TLS certificate from {} and key from {}",
        cert_file.display(),
        key_file.display()
    );
    RustlsConfig::from_pem_file(cert_file, key_file).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_accepts_port_only_form() {
        assert_eq!(
            parse_listen_addr(":9256").expect("addr"),
            "0.0.0.0:9256".parse::<SocketAddr>().expect("addr")
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9999").expect("addr"),
            "127.0.0.1:9999".parse::<SocketAddr>().expect("addr")
        );
        assert!(parse_listen_addr("not-an-addr").is_err());
    }
}
