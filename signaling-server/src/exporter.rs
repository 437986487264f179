//! HTTP exporter for the Prometheus metrics
//!
//! Serves `GET /metrics` from its own thread on a single-threaded tokio
//! runtime. It only reads the shared atomics, so the mio loop never waits
//! on a scraper.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::metrics::Metrics;

/// Prometheus text exposition format
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Build the exporter router
pub fn router(metrics: Arc<Metrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Metrics endpoint
async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)], metrics.render())
}

/// Bind the scrape listener and serve it on a background thread.
///
/// Bind and runtime errors surface here, at startup. The thread runs until
/// the process exits. Returns the bound address.
pub fn spawn(addr: SocketAddr, metrics: Arc<Metrics>) -> io::Result<SocketAddr> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    let local_addr = listener.local_addr()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    thread::Builder::new()
        .name("metrics-exporter".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        log::error!("Metrics listener unusable: {}", e);
                        return;
                    }
                };

                if let Err(e) = axum::serve(listener, router(metrics)).await {
                    log::error!("Metrics exporter stopped: {}", e);
                }
            })
        })?;

    Ok(local_addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::io::{Read, Write};
    use std::time::Duration;
    use tower::ServiceExt;

    fn get_path(metrics: Arc<Metrics>, path: &str) -> (StatusCode, Option<String>, String) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        runtime.block_on(async move {
            let response = router(metrics)
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();

            let status = response.status();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .map(|v| v.to_str().unwrap().to_string());
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();

            (status, content_type, String::from_utf8(body.to_vec()).unwrap())
        })
    }

    #[test]
    fn test_metrics_route_serves_exposition_text() {
        let metrics = Arc::new(Metrics::new());
        Metrics::set(&metrics.waiting_patients, 2);

        let (status, content_type, body) = get_path(metrics, "/metrics");

        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(EXPOSITION_CONTENT_TYPE));
        assert!(body.contains("telehealth_waiting_patients 2"));
    }

    #[test]
    fn test_unknown_path_is_not_found() {
        let (status, _, _) = get_path(Arc::new(Metrics::new()), "/");
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_spawned_exporter_sends_complete_body() {
        let metrics = Arc::new(Metrics::new());
        Metrics::set(&metrics.active_calls, 3);

        let addr = spawn("127.0.0.1:0".parse().unwrap(), Arc::clone(&metrics)).unwrap();

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("telehealth_active_calls 3"));
        // Last series is present, so the body was not cut short
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        assert!(body.contains("# TYPE telehealth_uptime_seconds gauge\ntelehealth_uptime_seconds "));
        assert!(body.ends_with('\n'));
    }
}
