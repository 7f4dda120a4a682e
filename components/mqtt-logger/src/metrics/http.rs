// Local crates
use crate::helpers::shutdown::Shutdown;

// External crates
use bytes::Bytes;
use http_body_util::Full;
use hyper::{
    body::Incoming,
    header::CONTENT_TYPE,
    http::{Method, Request, Response, StatusCode},
    service::service_fn,
};
use hyper_util::{rt::TokioExecutor, server::conn::auto::Builder as HyperServerBuilder};
use prometheus::{Encoder, TextEncoder};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::instrument;

fn plain_response(status: StatusCode, body: &'static [u8]) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body)));
    *response.status_mut() = status;
    response
}

/// Encode every registered prometheus metric in text exposition format.
pub fn render_metrics() -> Result<(String, Vec<u8>), prometheus::Error> {
    let metric_families = prometheus::gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((encoder.format_type().to_string(), buffer))
}

#[instrument(
    name = "metrics_server::handler",
    target = "metrics::http",
    skip_all,
    level = "debug"
)]
async fn metrics_handler(_req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    tracing::debug!("Collecting all registered prometheus metrics");

    let (content_type, buffer) = match render_metrics() {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode prometheus metrics");
            return Ok(plain_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                b"Failed to encode metrics",
            ));
        }
    };
    tracing::debug!(
        writer_buffer = %buffer.len(),
        "Encoded collected metrics into prometheus text format"
    );

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    if let Ok(value) = content_type.parse::<hyper::header::HeaderValue>() {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    Ok(response)
}

/// Serve `GET /metrics` on `addr` until `shutdown` is triggered.
#[instrument(
    name = "metrics_server::start_metrics_server",
    target = "metrics::http",
    skip_all,
    level = "debug"
)]
pub async fn start_metrics_server(addr: SocketAddr, shutdown: Shutdown) -> std::io::Result<()> {
    // Hyper 1.0 no longer binds the listener itself
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(
        metrics_endpoint = %addr,
        "Pipeline metrics available at http://{addr}/metrics"
    );

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.wait() => break,
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to accept metrics connection");
                    continue;
                }
            },
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let service = service_fn(|req: Request<Incoming>| async move {
            match (req.method(), req.uri().path()) {
                (&Method::GET, "/metrics") => metrics_handler(req).await,
                _ => Ok(plain_response(StatusCode::NOT_FOUND, b"Not Found")),
            }
        });

        tracing::trace!(peer = %peer, "Spawning task to serve metrics connection");
        tokio::spawn(async move {
            if let Err(err) = HyperServerBuilder::new(TokioExecutor::new())
                .serve_connection(io, service)
                .await
            {
                tracing::error!(error = %err, "Metrics server error");
            }
        });
    }

    tracing::debug!("Metrics server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::metrics::MESSAGES_RECEIVED_TOTAL;

    #[test]
    fn rendered_metrics_include_pipeline_counters() {
        MESSAGES_RECEIVED_TOTAL.inc();
        let (content_type, body) = render_metrics().expect("metrics encode");
        let body = String::from_utf8(body).expect("text exposition is utf-8");

        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("mqtt_logger_messages_received_total"));
    }
}
