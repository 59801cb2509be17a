mod gateway;

use crate::gateway::{Gateway, GatewayConfig};
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pipeline::TransactionId;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::os::unix::fs::PermissionsExt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::UnixListener;

const MAX_BATCH: usize = 10_000;

type HttpResponse = Response<BoxBody<Bytes, hyper::Error>>;

fn empty() -> BoxBody<Bytes, hyper::Error> {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody<Bytes, hyper::Error> {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

fn status(code: StatusCode) -> HttpResponse {
    let mut res = Response::new(empty());
    *res.status_mut() = code;
    res
}

fn json<T: Serialize>(code: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => {
            let mut res = Response::new(full(body));
            *res.status_mut() = code;
            res.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            res
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize response");
            status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Serialize)]
struct Created {
    ids: Vec<TransactionId>,
}

fn parse_query_params(req: &Request<Incoming>) -> HashMap<String, String> {
    let query = req.uri().query().unwrap_or("");
    form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

/// Missing means one; anything above `MAX_BATCH` is refused.
fn parse_count(raw: Option<&str>) -> Option<usize> {
    match raw {
        None => Some(1),
        Some(raw) => raw.trim().parse().ok().filter(|n| *n <= MAX_BATCH),
    }
}

async fn create_transactions(gateway: &Gateway, count: usize) -> HttpResponse {
    match gateway.producer.generate(count).await {
        Ok(created) => json(
            StatusCode::ACCEPTED,
            &Created {
                ids: created.iter().map(|tx| tx.id).collect(),
            },
        ),
        Err(e) => {
            tracing::error!(error = %e, count, "failed to create transactions");
            status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn get_transaction(gateway: &Gateway, raw_id: &str) -> HttpResponse {
    let Ok(id) = TransactionId::from_str(raw_id) else {
        return status(StatusCode::BAD_REQUEST);
    };

    match gateway.store.get(id).await {
        Ok(Some(tx)) => json(StatusCode::OK, &tx),
        Ok(None) => status(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(error = %e, transaction_id = %id, "failed to read transaction");
            status(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn route(
    req: Request<Incoming>,
    gateway: Arc<Gateway>,
) -> Result<HttpResponse, hyper::Error> {
    let path = req.uri().path().to_string();

    let res = match (req.method(), path.as_str()) {
        (&Method::GET, "/health") => Response::new(full("OK")),
        (&Method::POST, "/transactions") => {
            let params = parse_query_params(&req);
            match parse_count(params.get("count").map(String::as_str)) {
                Some(count) => create_transactions(&gateway, count).await,
                None => status(StatusCode::BAD_REQUEST),
            }
        }
        (&Method::GET, "/transactions-summary") => match gateway.store.summary().await {
            Ok(summary) => json(StatusCode::OK, &summary),
            Err(e) => {
                tracing::error!(error = %e, "failed to summarize transactions");
                status(StatusCode::SERVICE_UNAVAILABLE)
            }
        },
        (&Method::GET, path) => match path.strip_prefix("/transactions/") {
            Some(raw_id) => get_transaction(&gateway, raw_id).await,
            None => status(StatusCode::NOT_FOUND),
        },
        _ => status(StatusCode::NOT_FOUND),
    };

    Ok(res)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    {
        use tracing_subscriber::{EnvFilter, fmt};
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = fmt().with_env_filter(env_filter).try_init();
    }

    let config = GatewayConfig::from_env()?;
    let gateway = Arc::new(Gateway::new(&config.pipeline).await?);

    let socket_path = &config.listen_path;
    if std::fs::metadata(socket_path).is_ok() {
        std::fs::remove_file(socket_path)?;
    }

    let listener = UnixListener::bind(socket_path)?;

    let permissions = std::fs::Permissions::from_mode(0o666);
    std::fs::set_permissions(socket_path, permissions)?;
    tracing::info!(socket = %socket_path, "gateway listening");

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        let (stream, _) = tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to accept connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let gateway = Arc::clone(&gateway);

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .keep_alive(true)
                .half_close(false)
                .max_buf_size(16 * 1024)
                .serve_connection(io, service_fn(move |req| route(req, Arc::clone(&gateway))))
                .await
            {
                tracing::debug!(error = ?err, "error serving connection");
            }
        });
    }

    tracing::info!("gateway shutting down");
    gateway.close().await;
    let _ = std::fs::remove_file(socket_path);

    Ok(())
}
