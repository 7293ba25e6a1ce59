use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use hyper::header::CONTENT_TYPE;
use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::counter::DownloadCounter;
use crate::download::{DownloadHandler, DownloadRequest};
use crate::error::CounterError;
use crate::logger::log_request;
use crate::store::ResourceStore;
use crate::tracking::TrackingPolicy;
use crate::utils::get_url_path;
use crate::Result;

const COUNT_ROUTE: &str = "/download-count/";

/// 请求处理需要的共享状态
pub struct AppState {
    pub handler: DownloadHandler,
    pub counter: Arc<DownloadCounter>,
    pub resources: Arc<dyn ResourceStore>,
    pub tracking: TrackingPolicy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountInfo {
    pub id: String,
    pub count: u64,
    pub tracked: bool,
    pub download_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SetCount {
    count: u64,
}

pub struct DownloadServer {
    addr: SocketAddr,
    state: Arc<AppState>,
}

impl DownloadServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        info!("Creating download server on {}", addr);
        Self {
            addr,
            state: Arc::new(state),
        }
    }

    #[tracing::instrument(skip(self, shutdown))]
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting download server on {}", self.addr);
        let state = self.state.clone();

        let make_svc = make_service_fn(move |conn: &AddrStream| {
            let remote_addr = conn.remote_addr();
            debug!("New connection from: {}", remote_addr);
            let state = state.clone();

            async move {
                Ok::<_, hyper::Error>(service_fn(move |req| {
                    debug!("Received request from {}: {} {}", remote_addr, req.method(), req.uri());
                    let state = state.clone();
                    async move { Ok::<_, hyper::Error>(Self::route(req, state).await) }
                }))
            }
        });

        let server = Server::try_bind(&self.addr)
            .map_err(|e| CounterError::Network(e.to_string()))?
            .serve(make_svc)
            .with_graceful_shutdown(shutdown);
        info!("Download server is ready to accept connections");

        if let Err(e) = server.await {
            error!("Server error: {}", e);
            return Err(CounterError::Network(e.to_string()));
        }

        Ok(())
    }

    /// 路由并把错误映射成响应
    pub async fn route(req: Request<Body>, state: Arc<AppState>) -> Response<Body> {
        let started = Instant::now();
        let path = get_url_path(&req.uri().to_string()).to_string();

        let response = match Self::dispatch(req, &state).await {
            Ok(response) => response,
            Err(e) => {
                let status = e.status_code();
                if status.is_server_error() {
                    error!("Request {} failed: {}", path, e);
                } else {
                    warn!("Request {} rejected: {}", path, e);
                }
                text_response(status, e.to_string())
            }
        };

        log_request(&path, response.status().as_u16(), started.elapsed());
        response
    }

    async fn dispatch(req: Request<Body>, state: &AppState) -> Result<Response<Body>> {
        let path = req.uri().path().to_string();

        if let Some(id) = path.strip_prefix(COUNT_ROUTE) {
            let id = id.trim_end_matches('/').to_string();
            let method = req.method().clone();
            return match method {
                Method::GET => Self::count_info(&id, state).await,
                Method::PUT => Self::set_count(&id, req, state).await,
                _ => Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed")),
            };
        }

        if req.method() != Method::GET && req.method() != Method::HEAD {
            return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed"));
        }

        let is_download_path = path == "/download"
            || path.starts_with(&format!("/{}/", state.tracking.route_prefix()));
        if is_download_path {
            if let Some(request) = DownloadRequest::from_request(&req, state.tracking.route_prefix()) {
                if let Some(response) = state.handler.handle(&request).await? {
                    return Ok(response);
                }
            }
        }

        warn!("No handler found for request: {}", path);
        Ok(text_response(StatusCode::NOT_FOUND, "Not found"))
    }

    async fn count_info(id: &str, state: &AppState) -> Result<Response<Body>> {
        let resource = state
            .resources
            .get(id)
            .await?
            .ok_or_else(|| CounterError::ResourceNotFound(id.to_string()))?;

        let tracked = state.tracking.is_tracked(&resource.path);
        let info = CountInfo {
            id: resource.id.clone(),
            count: state.counter.get_count(&resource.id).await?,
            tracked,
            download_url: tracked.then(|| state.tracking.download_url(&resource)),
        };
        json_response(StatusCode::OK, &info)
    }

    async fn set_count(id: &str, req: Request<Body>, state: &AppState) -> Result<Response<Body>> {
        if state.resources.get(id).await?.is_none() {
            return Err(CounterError::ResourceNotFound(id.to_string()));
        }

        let body = hyper::body::to_bytes(req.into_body())
            .await
            .map_err(|e| CounterError::Network(e.to_string()))?;
        let update: SetCount = serde_json::from_slice(&body)
            .map_err(|e| CounterError::InvalidInput(e.to_string()))?;

        state.counter.set_count(id, update.count).await?;
        Self::count_info(id, state).await
    }
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Body>> {
    let body = serde_json::to_vec(value)?;
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .map_err(|e| CounterError::Network(e.to_string()))
}
