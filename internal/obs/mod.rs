use axum::extract::MatchedPath;
use axum::http::Request;
use futures_util::future::BoxFuture;
use prometheus::core::Collector;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tower::{Layer, Service};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub http_requests: IntCounterVec,
    pub http_duration: HistogramVec,
    pub queue_jobs: IntCounterVec,
    pub chunk_writes: IntCounterVec,
    pub sessions_finished: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new("cos_http_requests_total", "HTTP requests"),
            &["route", "method", "status"],
        )
        .expect("http_requests");
        let http_duration = HistogramVec::new(
            HistogramOpts::new("cos_http_request_duration_seconds", "HTTP request duration"),
            &["route", "method"],
        )
        .expect("http_duration");
        let queue_jobs = IntCounterVec::new(
            Opts::new("cos_queue_jobs_total", "Consumed queue jobs"),
            &["queue", "result"],
        )
        .expect("queue_jobs");
        let chunk_writes = IntCounterVec::new(
            Opts::new("cos_chunk_writes_total", "Chunk writes"),
            &["result"],
        )
        .expect("chunk_writes");
        let sessions_finished = IntCounterVec::new(
            Opts::new("cos_upload_sessions_finished_total", "Finished upload sessions"),
            &["status"],
        )
        .expect("sessions_finished");

        register_collector(&registry, &http_requests);
        register_collector(&registry, &http_duration);
        register_collector(&registry, &queue_jobs);
        register_collector(&registry, &chunk_writes);
        register_collector(&registry, &sessions_finished);

        Arc::new(Self {
            registry,
            http_requests,
            http_duration,
            queue_jobs,
            chunk_writes,
            sessions_finished,
        })
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    pub fn render(&self) -> String {
        let mut buffer = String::new();
        let encoder = prometheus::TextEncoder::new();
        if let Err(err) = encoder.encode_utf8(&self.gather(), &mut buffer) {
            tracing::warn!(error = %err, "metrics encode failed");
        }
        buffer
    }
}

fn register_collector<C>(registry: &Registry, collector: &C)
where
    C: Collector + Clone + 'static,
{
    registry.register(Box::new(collector.clone())).ok();
}

#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Arc<Metrics>,
}

impl MetricsLayer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            metrics: self.metrics.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    metrics: Arc<Metrics>,
}

impl<S, B> Service<Request<B>> for MetricsService<S>
where
    S: Service<Request<B>, Response = axum::response::Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
    B: Send + 'static,
{
    type Response = axum::response::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        let mut inner = self.inner.clone();
        let metrics = self.metrics.clone();
        let method = req.method().clone();
        let path = request_path_label(&req);
        let start = Instant::now();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let status_label = response.status().as_u16().to_string();
            metrics
                .http_requests
                .with_label_values(&[&path, method.as_str(), &status_label])
                .inc();
            metrics
                .http_duration
                .with_label_values(&[&path, method.as_str()])
                .observe(start.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

fn request_path_label<B>(req: &Request<B>) -> String {
    if let Some(matched) = req.extensions().get::<MatchedPath>() {
        return matched.as_str().to_string();
    }
    req.uri().path().to_string()
}

#[cfg(test)]
mod tests {
    use super::{Metrics, MetricsLayer};
    use axum::body::Body;
    use axum::http::Request;
    use axum::response::Response;
    use std::convert::Infallible;
    use std::task::{Context, Poll};
    use tower::{Layer, Service};

    #[derive(Clone, Copy)]
    struct OkService;

    impl Service<Request<Body>> for OkService {
        type Response = Response;
        type Error = Infallible;
        type Future = futures_util::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            futures_util::future::ready(Ok(Response::new(Body::empty())))
        }
    }

    #[tokio::test]
    async fn layer_counts_requests_by_route_and_status() {
        let metrics = Metrics::new();
        let mut service = MetricsLayer::new(metrics.clone()).layer(OkService);
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .expect("request");
        service.call(request).await.expect("response");
        let count = metrics
            .http_requests
            .with_label_values(&["/healthz", "GET", "200"])
            .get();
        assert_eq!(count, 1);
    }

    #[test]
    fn render_produces_exposition_text() {
        let metrics = Metrics::new();
        metrics.queue_jobs.with_label_values(&["q", "ok"]).inc();
        let text = metrics.render();
        assert!(text.contains("cos_queue_jobs_total"));
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let metrics = Metrics::new();
        super::register_collector(&metrics.registry, &metrics.queue_jobs);
        metrics.queue_jobs.with_label_values(&["q", "ok"]).inc();
        assert!(!metrics.render().is_empty());
    }
}
