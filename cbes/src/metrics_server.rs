//! Read-only metrics HTTP surface (`spec.md` §6): `/metrics/prometheus`
//! (text exposition) and `/metrics/dropwizard?pretty` (JSON). Its liveness
//! doubles as the "startup complete" probe (`spec.md` §4.7 step 13).

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use metric::{Registry, Sample};
use observability_deps::tracing::info;

/// A running metrics server; dropping the returned handle's `shutdown`
/// sender stops it.
pub struct MetricsServer {
    shutdown: tokio::sync::oneshot::Sender<()>,
    join: tokio::task::JoinHandle<()>,
}

impl MetricsServer {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.join.await;
    }
}

/// Bind and serve the metrics endpoints on `port`, returning immediately
/// with a handle; the server itself runs on a spawned task.
pub fn serve(port: u16, registry: Arc<Registry>) -> Result<MetricsServer, hyper::Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let (tx, rx) = tokio::sync::oneshot::channel();

    let make_svc = make_service_fn(move |_conn| {
        let registry = Arc::clone(&registry);
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, Arc::clone(&registry)))) }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    info!(%addr, "metrics HTTP endpoint listening");

    let join = tokio::spawn(async move {
        let graceful = server.with_graceful_shutdown(async {
            let _ = rx.await;
        });
        if let Err(err) = graceful.await {
            observability_deps::tracing::error!(%err, "metrics server exited with an error");
        }
    });

    Ok(MetricsServer { shutdown: tx, join })
}

async fn handle(req: Request<Body>, registry: Arc<Registry>) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path();
    let pretty = req.uri().query().map(|q| q.contains("pretty")).unwrap_or(false);

    let body = match path {
        "/metrics/prometheus" => prometheus_text(&registry.report()),
        "/metrics/dropwizard" => dropwizard_json(&registry.report(), pretty),
        _ => {
            return Ok(Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("not found"))
                .unwrap())
        }
    };

    Ok(Response::new(Body::from(body)))
}

fn prometheus_text(samples: &[Sample]) -> String {
    let mut out = String::new();
    for sample in samples {
        out.push_str("# TYPE ");
        out.push_str(sample.name);
        out.push(' ');
        out.push_str(sample.kind);
        out.push('\n');

        out.push_str(sample.name);
        if !sample.attributes.is_empty() {
            out.push('{');
            let labels = sample
                .attributes
                .iter()
                .map(|(k, v)| format!("{k}=\"{v}\""))
                .collect::<Vec<_>>()
                .join(",");
            out.push_str(&labels);
            out.push('}');
        }
        out.push(' ');
        out.push_str(&sample.value.to_string());
        out.push('\n');
    }
    out
}

fn dropwizard_json(samples: &[Sample], pretty: bool) -> String {
    let value: Vec<serde_json::Value> = samples
        .iter()
        .map(|sample| {
            serde_json::json!({
                "name": sample.name,
                "description": sample.description,
                "kind": sample.kind,
                "attributes": sample.attributes,
                "value": sample.value,
            })
        })
        .collect();

    if pretty {
        serde_json::to_string_pretty(&value).unwrap_or_default()
    } else {
        serde_json::to_string(&value).unwrap_or_default()
    }
}
