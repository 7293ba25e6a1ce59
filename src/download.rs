use std::sync::Arc;
use std::time::SystemTime;

use hyper::header::{
    HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, IF_MODIFIED_SINCE,
    LAST_MODIFIED,
};
use hyper::{Body, Method, Request, Response, StatusCode, Version};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::CountPolicy;
use crate::counter::DownloadCounter;
use crate::error::CounterError;
use crate::store::{Resource, ResourceStore};
use crate::tracking::parse_download_route;
use crate::utils::{format_http_date, header_safe_file_name, parse_http_date, unix_seconds};
use crate::Result;

/// 一次下载请求中核心关心的部分
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub resource_id: String,
    pub if_modified_since: Option<String>,
    pub version: Version,
    pub head: bool,
}

impl DownloadRequest {
    pub fn new(resource_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            if_modified_since: None,
            version: Version::HTTP_11,
            head: false,
        }
    }

    pub fn with_if_modified_since(mut self, value: impl Into<String>) -> Self {
        self.if_modified_since = Some(value.into());
        self
    }

    /// 从 `/<prefix>/<id>/<name>` 或 `?p=<id>` 中取出资源 ID
    pub fn from_request(req: &Request<Body>, route_prefix: &str) -> Option<Self> {
        let resource_id = match parse_download_route(req.uri().path(), route_prefix) {
            Some((id, _name)) => id.to_string(),
            None => req.uri().query().and_then(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .find(|(key, value)| key == "p" && !value.is_empty())
                    .map(|(_, value)| value.into_owned())
            })?,
        };

        Some(Self {
            resource_id,
            if_modified_since: req
                .headers()
                .get(IF_MODIFIED_SINCE)
                .and_then(|value| value.to_str().ok())
                .map(String::from),
            version: req.version(),
            head: req.method() == Method::HEAD,
        })
    }
}

/// 客户端缓存的时间与文件修改时间（按秒）相等时视为有效
pub fn is_client_cache_valid(if_modified_since: Option<&str>, modified: SystemTime) -> bool {
    match if_modified_since.and_then(parse_http_date) {
        Some(client_date) => unix_seconds(client_date) == unix_seconds(modified),
        None => false,
    }
}

pub struct DownloadHandler {
    resources: Arc<dyn ResourceStore>,
    counter: Arc<DownloadCounter>,
    policy: CountPolicy,
}

impl DownloadHandler {
    pub fn new(
        resources: Arc<dyn ResourceStore>,
        counter: Arc<DownloadCounter>,
        policy: CountPolicy,
    ) -> Self {
        Self {
            resources,
            counter,
            policy,
        }
    }

    /// 处理一次下载。资源无法解析时返回 `Ok(None)`，交给上层处理
    ///
    /// 计数总在写出任何响应之前完成，计数失败则整个请求失败。
    #[tracing::instrument(skip(self, request), fields(resource = %request.resource_id))]
    pub async fn handle(&self, request: &DownloadRequest) -> Result<Option<Response<Body>>> {
        let resource = match self.resources.get(&request.resource_id).await? {
            Some(resource) => resource,
            None => {
                debug!("Resource {} not resolved, delegating", request.resource_id);
                return Ok(None);
            }
        };

        if self.policy == CountPolicy::EveryRequest {
            self.count(&resource).await?;
        }

        // 客户端缓存有效
        if is_client_cache_valid(request.if_modified_since.as_deref(), resource.modified) {
            info!("Client cache valid for resource {}, sending 304", resource.id);
            return Ok(Some(not_modified(request.version)?));
        }

        // 需要重新发送文件，先打开，打不开的不算一次完整下载
        let file = if request.head {
            None
        } else {
            Some(tokio::fs::File::open(&resource.path).await?)
        };

        if self.policy == CountPolicy::FullDelivery {
            self.count(&resource).await?;
        }

        let response = full_response(&resource, file)?;
        info!(
            "Sending resource {} ({} bytes, {})",
            resource.id, resource.size, resource.mime_type
        );
        Ok(Some(response))
    }

    async fn count(&self, resource: &Resource) -> Result<u64> {
        let count = self.counter.increment_count(&resource.id).await?;
        debug!("Counted download #{} of resource {}", count, resource.id);
        Ok(count)
    }
}

fn not_modified(version: Version) -> Result<Response<Body>> {
    Response::builder()
        .status(StatusCode::NOT_MODIFIED)
        .version(version)
        .body(Body::empty())
        .map_err(|e| CounterError::Network(e.to_string()))
}

fn full_response(resource: &Resource, file: Option<tokio::fs::File>) -> Result<Response<Body>> {
    let disposition = format!(
        "attachment; filename={}",
        header_safe_file_name(&resource.file_name())
    );
    let content_type = HeaderValue::from_str(&resource.mime_type)
        .map_err(|e| CounterError::InvalidInput(format!("bad mime type: {}", e)))?;

    let body = match file {
        Some(file) => Body::wrap_stream(ReaderStream::new(file)),
        None => Body::empty(),
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(LAST_MODIFIED, format_http_date(resource.modified))
        .header(CONTENT_TYPE, content_type)
        .header(CONTENT_DISPOSITION, disposition)
        .header(CONTENT_LENGTH, resource.size)
        .body(body)
        .map_err(|e| CounterError::Network(e.to_string()))
}
