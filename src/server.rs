use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Result, anyhow};
use hyper::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue,
};
use hyper::body::HttpBody;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::observability::MetricsCollector;
use crate::pipeline::{PipelineOrchestrator, RunStatus};
use crate::serving::Predictor;

const BANNER: &str = "Sensor fault detection service.\n\
GET /train runs the training pipeline.\n\
POST /predict with a CSV body returns the rows with a prediction column.\n";

/// Everything a request handler needs. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<PipelineOrchestrator>,
    predictor: Predictor,
    metrics: MetricsCollector,
    max_upload_bytes: usize,
}

impl AppState {
    pub fn new(orchestrator: Arc<PipelineOrchestrator>, predictor: Predictor) -> Self {
        let metrics = orchestrator.metrics();
        Self {
            orchestrator,
            predictor,
            metrics,
            max_upload_bytes: ServerConfig::default().max_upload_bytes,
        }
    }

    /// Largest `/predict` body accepted; bigger uploads get 413.
    pub fn with_upload_limit(mut self, max_upload_bytes: usize) -> Self {
        self.max_upload_bytes = max_upload_bytes;
        self
    }
}

/// HTTP front end running on its own thread and tokio runtime.
pub struct ApiServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl ApiServer {
    pub fn start(listen: SocketAddr, state: AppState) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    addr_tx.send(Err(format!("failed to build runtime: {err}"))).ok();
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, Infallible>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(format!("failed to bind {listen}: {err}"))).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    error!(error = %err, "API server error");
                }
            });
        });

        let address = match addr_rx.recv() {
            Ok(Ok(address)) => address,
            Ok(Err(message)) => {
                let _ = thread.join();
                return Err(anyhow!("API server failed to start: {message}"));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(anyhow!("API server thread exited before binding"));
            }
        };
        info!(%address, "API server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}

pub async fn handle_request(
    req: Request<Body>,
    state: AppState,
) -> Result<Response<Body>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::OPTIONS, _) => {
            let mut response = respond(StatusCode::NO_CONTENT, "text/plain", Body::empty());
            let headers = response.headers_mut();
            headers.insert(
                ACCESS_CONTROL_ALLOW_METHODS,
                HeaderValue::from_static("GET, POST, OPTIONS"),
            );
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
            response
        }
        (&Method::GET, "/") => text(StatusCode::OK, BANNER),
        (&Method::GET, "/train") | (&Method::POST, "/train") => train(state).await,
        (&Method::POST, "/predict") => predict(req, state).await,
        (&Method::GET, "/metrics") => text(StatusCode::OK, state.metrics.snapshot().to_prometheus()),
        (&Method::GET, "/metrics.json") => {
            let body = serde_json::to_vec(&state.metrics.snapshot())
                .unwrap_or_else(|_| b"{}".to_vec());
            respond(StatusCode::OK, "application/json", Body::from(body))
        }
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    };
    Ok(response)
}

async fn train(state: AppState) -> Response<Body> {
    let orchestrator = state.orchestrator.clone();
    match tokio::task::spawn_blocking(move || orchestrator.run()).await {
        Ok(Ok(RunStatus::AlreadyRunning)) => {
            text(StatusCode::OK, "Training pipeline is already running.")
        }
        Ok(Ok(RunStatus::Completed(_))) => text(StatusCode::OK, "Training completed successfully."),
        Ok(Err(err)) => text(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Training failed: {err}"),
        ),
        Err(err) => {
            error!(error = %err, "Training task did not finish");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Training failed: {err}"),
            )
        }
    }
}

async fn predict(req: Request<Body>, state: AppState) -> Response<Body> {
    let body = match read_body(req, state.max_upload_bytes).await {
        Ok(body) => body,
        Err(response) => {
            state.metrics.record_prediction(false);
            return response;
        }
    };

    let predictor = state.predictor.clone();
    let outcome = tokio::task::spawn_blocking(move || predictor.predict_csv(&body)).await;
    match outcome {
        Ok(Ok(csv)) => {
            state.metrics.record_prediction(true);
            let mut response = respond(StatusCode::OK, "text/csv", Body::from(csv));
            response.headers_mut().insert(
                CONTENT_DISPOSITION,
                HeaderValue::from_static("attachment; filename=\"predictions.csv\""),
            );
            response
        }
        Ok(Err(err)) => {
            state.metrics.record_prediction(false);
            warn!(error = %err, "Prediction request failed");
            text(err.status_code(), err.to_string())
        }
        Err(err) => {
            state.metrics.record_prediction(false);
            error!(error = %err, "Prediction task did not finish");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Prediction failed: {err}"),
            )
        }
    }
}

/// Collect the request body, stopping as soon as it exceeds `limit` bytes.
async fn read_body(req: Request<Body>, limit: usize) -> Result<Vec<u8>, Response<Body>> {
    let too_large = || {
        text(
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("Upload exceeds the limit of {limit} bytes"),
        )
    };

    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if declared.is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut body = req.into_body();
    let mut collected = Vec::new();
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(|err| {
            text(
                StatusCode::BAD_REQUEST,
                format!("Failed to read request body: {err}"),
            )
        })?;
        if collected.len() + chunk.len() > limit {
            return Err(too_large());
        }
        collected.extend_from_slice(&chunk);
    }
    Ok(collected)
}

fn text(status: StatusCode, body: impl Into<String>) -> Response<Body> {
    respond(status, "text/plain; charset=utf-8", Body::from(body.into()))
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}
