//! Health & Status API endpoints
//!
//! Provides HTTP endpoints for monitoring and operations:
//! - GET /health - Simple health check
//! - GET /metrics - Prometheus metrics
//! - GET /status - Offsets, job counts and uptime
//! - GET /failed - Failed jobs with their last error
//! - POST /replay/<id> - Requeue a failed job

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use eyre::Result;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::db::JobRecord;
use crate::metrics;
use crate::store::RelayStore;
use crate::types::{Direction, Job};

/// Server start time for uptime calculation
static START_TIME: OnceLock<Instant> = OnceLock::new();

const FAILED_JOBS_LIMIT: i64 = 100;

/// What the endpoints read from and where replayed jobs go
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn RelayStore>,
    pub replay: HashMap<Direction, mpsc::Sender<Job>>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    uptime_seconds: u64,
    offsets: HashMap<String, u64>,
    jobs: HashMap<String, i64>,
}

#[derive(Serialize)]
struct FailedResponse {
    jobs: Vec<JobRecord>,
}

#[derive(Serialize)]
struct ReplayResponse {
    id: i64,
    direction: Direction,
    retry_count: u32,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Metrics,
    Status,
    Failed,
    Replay(i64),
    BadRequest(String),
    NotFound,
}

/// Pick the route from the request line
fn route(request: &str) -> Route {
    let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(method), Some(path)) => (method, path),
        _ => return Route::BadRequest("malformed request line".to_string()),
    };
    let path = path.split('?').next().unwrap_or(path);

    match (method, path) {
        ("GET", "/health") => Route::Health,
        ("GET", "/metrics") => Route::Metrics,
        ("GET", "/status") => Route::Status,
        ("GET", "/failed") => Route::Failed,
        ("POST", p) if p.starts_with("/replay/") => match p["/replay/".len()..].parse() {
            Ok(id) => Route::Replay(id),
            Err(_) => Route::BadRequest(format!("invalid job id in {}", p)),
        },
        _ => Route::NotFound,
    }
}

struct Response {
    status: &'static str,
    content_type: &'static str,
    body: Vec<u8>,
}

impl Response {
    fn json<T: Serialize>(status: &'static str, value: &T) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec()),
        }
    }

    fn error(status: &'static str, message: impl Into<String>) -> Self {
        Self::json(
            status,
            &ErrorResponse {
                error: message.into(),
            },
        )
    }

    fn head(&self) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status,
            self.content_type,
            self.body.len()
        )
    }
}

/// Start the API server (combines metrics, status and replay endpoints)
pub async fn start_api_server(addr: SocketAddr, state: ApiState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server started");

    START_TIME.get_or_init(Instant::now);
    metrics::UP.set(1.0);

    loop {
        let (mut socket, _) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            if socket.readable().await.is_ok() {
                let _ = socket.try_read(&mut buf);
            }

            let request = String::from_utf8_lossy(&buf);
            let response = handle(route(&request), &state).await;

            let _ = socket.write_all(response.head().as_bytes()).await;
            let _ = socket.write_all(&response.body).await;
        });
    }
}

async fn handle(route: Route, state: &ApiState) -> Response {
    match route {
        Route::Health => Response {
            status: "200 OK",
            content_type: "text/plain",
            body: b"OK".to_vec(),
        },
        Route::Metrics => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            let _ = encoder.encode(&prometheus::gather(), &mut buffer);
            Response {
                status: "200 OK",
                content_type: "text/plain; charset=utf-8",
                body: buffer,
            }
        }
        Route::Status => Response::json("200 OK", &build_status_response(state).await),
        Route::Failed => match state.store.failed_jobs(FAILED_JOBS_LIMIT).await {
            Ok(jobs) => Response::json("200 OK", &FailedResponse { jobs }),
            Err(e) => Response::error("500 Internal Server Error", e.to_string()),
        },
        Route::Replay(id) => replay(id, state).await,
        Route::BadRequest(message) => Response::error("400 Bad Request", message),
        Route::NotFound => Response::error("404 Not Found", "not found"),
    }
}

async fn build_status_response(state: &ApiState) -> StatusResponse {
    let uptime = START_TIME
        .get()
        .map(|t| t.elapsed().as_secs())
        .unwrap_or(0);

    let offsets = state
        .store
        .offsets()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(direction, height)| (direction.to_string(), height))
        .collect();

    let jobs = state
        .store
        .count_by_status()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|(status, count)| (status.to_string(), count))
        .collect();

    StatusResponse {
        status: "ok".to_string(),
        uptime_seconds: uptime,
        offsets,
        jobs,
    }
}

async fn replay(id: i64, state: &ApiState) -> Response {
    let job = match state.store.requeue_failed(id).await {
        Ok(Some(job)) => job,
        Ok(None) => return Response::error("404 Not Found", format!("job {} is not failed", id)),
        Err(e) => return Response::error("500 Internal Server Error", e.to_string()),
    };

    let Some(queue) = state.replay.get(&job.direction) else {
        return Response::error(
            "409 Conflict",
            format!("direction {} is not relayed by this process", job.direction),
        );
    };

    let body = ReplayResponse {
        id: job.id,
        direction: job.direction,
        retry_count: job.retry_count,
    };
    tracing::info!(job_id = job.id, key = %job.key(), retry_count = job.retry_count, "Replaying failed job");

    // The job is `detected` again, so a restart would resume it anyway
    if queue.send(job).await.is_err() {
        return Response::error("503 Service Unavailable", "submission pipeline stopped");
    }
    Response::json("200 OK", &body)
}
