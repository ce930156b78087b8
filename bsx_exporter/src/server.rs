//! Metrics HTTP Server
//!
//! Serves the Prometheus text format on the telemetry path, a small landing
//! page on `/` and a liveness probe on `/health`.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bsx_core::export;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use tokio::task::JoinHandle;

use crate::source::MetricsSource;

const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Metrics HTTP server
pub struct MetricsServer {
    addr: SocketAddr,
    router: Arc<Router>,
}

struct Router {
    telemetry_path: String,
    source: Arc<dyn MetricsSource>,
}

impl MetricsServer {
    pub fn new(addr: SocketAddr, telemetry_path: impl Into<String>, source: Arc<dyn MetricsSource>) -> Self {
        Self {
            addr,
            router: Arc::new(Router {
                telemetry_path: telemetry_path.into(),
                source,
            }),
        }
    }

    /// Bind and serve in a background task until `shutdown` resolves.
    /// Returns the bound address, which differs from the requested one when
    /// port 0 was asked for.
    pub fn start<F>(self, shutdown: F) -> Result<(SocketAddr, JoinHandle<Result<(), hyper::Error>>), hyper::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router;
        let make_svc = make_service_fn(move |_conn| {
            let router = router.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let router = router.clone();
                    async move { router.handle(req).await }
                }))
            }
        });

        let server = Server::try_bind(&self.addr)?.serve(make_svc);
        let local = server.local_addr();
        tracing::info!(address = %local, "Metrics server listening");

        let handle = tokio::spawn(server.with_graceful_shutdown(shutdown));
        Ok((local, handle))
    }
}

impl Router {
    async fn handle(&self, req: Request<Body>) -> Result<Response<Body>, Infallible> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed".into()));
        }
        let path = req.uri().path().to_owned();

        let response = if path == self.telemetry_path {
            self.metrics().await
        } else if path == "/" {
            respond(StatusCode::OK, "text/html; charset=utf-8", landing_page(&self.telemetry_path).into())
        } else if path == "/health" {
            respond(StatusCode::OK, "text/plain", "OK".into())
        } else {
            respond(StatusCode::NOT_FOUND, "text/plain", "Not Found".into())
        };
        Ok(response)
    }

    async fn metrics(&self) -> Response<Body> {
        let families = self.source.families().await;
        match export::encode_text(&families) {
            Ok(text) => respond(StatusCode::OK, TEXT_FORMAT, text.into()),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode metrics");
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", format!("Error: {e}").into())
            }
        }
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn landing_page(telemetry_path: &str) -> String {
    format!(
        "<html>\n\
         <head><title>Beanstalkd Exporter</title></head>\n\
         <body>\n\
         <h1>Beanstalkd Exporter</h1>\n\
         <p><a href=\"{telemetry_path}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bsx_core::export::{system_observations, ScrapeResult};
    use bsx_core::ExporterMetrics;
    use std::collections::BTreeMap;

    struct Fixed {
        metrics: ExporterMetrics,
    }

    #[async_trait]
    impl MetricsSource for Fixed {
        async fn families(&self) -> Vec<prometheus::proto::MetricFamily> {
            let stats = BTreeMap::from([("current-jobs-ready".to_string(), "7".to_string())]);
            let result = ScrapeResult {
                observations: system_observations(&stats, "q:11300"),
            };
            export::gather(&result, &self.metrics)
        }
    }

    fn router() -> Router {
        Router {
            telemetry_path: "/stats".to_string(),
            source: Arc::new(Fixed {
                metrics: ExporterMetrics::new().unwrap(),
            }),
        }
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, String) {
        let req = Request::get(path).body(Body::empty()).unwrap();
        let response = router.handle(req).await.unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_routes() {
        let router = router();

        let (status, body) = get(&router, "/stats").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("current_jobs_ready{instance=\"q:11300\"} 7"));

        let (status, body) = get(&router, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("<title>Beanstalkd Exporter</title>"));
        assert!(body.contains("href=\"/stats\""));

        let (status, body) = get(&router, "/health").await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "OK"));

        let (status, _) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_post_rejected() {
        let req = Request::post("/stats").body(Body::empty()).unwrap();
        let response = router().handle(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_start_on_ephemeral_port() {
        let server = MetricsServer::new(
            "127.0.0.1:0".parse().unwrap(),
            "/metrics",
            Arc::new(Fixed {
                metrics: ExporterMetrics::new().unwrap(),
            }),
        );
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let (addr, handle) = server
            .start(async move {
                let _ = rx.await;
            })
            .unwrap();
        assert_ne!(addr.port(), 0);

        let client = hyper::Client::new();
        let uri: hyper::Uri = format!("http://{addr}/health").parse().unwrap();
        let response = client.get(uri).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
