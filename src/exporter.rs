use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::PrometheusMetrics;

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

fn serve_metrics(metrics: &PrometheusMetrics) -> Response<Body> {
    match metrics.render() {
        Ok(buffer) => {
            let mut response = Response::new(Body::from(buffer));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
            response
        }
        Err(err) => {
            tracing::error!("failed to encode metrics: {:#}", err);
            respond(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

async fn handle_request(
    metrics: Arc<PrometheusMetrics>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    Ok(match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => serve_metrics(&metrics),
        (&Method::GET, "/health") => Response::new(Body::from("OK")),
        _ => respond(StatusCode::NOT_FOUND, "Not Found"),
    })
}

/// Serves `/metrics` in the Prometheus text format and `/health` on
/// `addr` until `shutdown` is cancelled.
///
/// Returns the address actually bound (useful with port 0) and the
/// handle of the serving task.
pub fn spawn_metrics_server(
    addr: SocketAddr,
    metrics: Arc<PrometheusMetrics>,
    shutdown: CancellationToken,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let make_svc = make_service_fn(move |_conn| {
        let metrics = Arc::clone(&metrics);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(Arc::clone(&metrics), req)
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .with_context(|| format!("cannot bind the metrics server to {}", addr))?
        .serve(make_svc);
    let local_addr = server.local_addr();

    tracing::info!("Prometheus metrics server listening on http://{}/metrics", local_addr);
    tracing::info!("Health check endpoint available at http://{}/health", local_addr);

    let handle = tokio::task::spawn(async move {
        let graceful = server.with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(err) = graceful.await {
            tracing::error!("metrics server failed: {}", err);
        }
    });

    Ok((local_addr, handle))
}

/// Stops the server spawned by [`spawn_metrics_server`] and waits for it.
/// Returns false, after logging why, if the serving task panicked or was
/// cancelled.
pub async fn stop_metrics_server(shutdown: &CancellationToken, handle: JoinHandle<()>) -> bool {
    shutdown.cancel();
    match handle.await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!("metrics server task ended abnormally: {}", err);
            false
        }
    }
}
