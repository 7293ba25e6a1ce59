use std::path::Path;

use crate::config::TrackingConfig;
use crate::store::Resource;

/// 哪些资源需要统计下载，以及它们的下载地址
#[derive(Debug, Clone)]
pub struct TrackingPolicy {
    extensions: Vec<String>,
    route_prefix: String,
}

impl TrackingPolicy {
    pub fn new(config: &TrackingConfig) -> Self {
        Self {
            extensions: config
                .extensions
                .iter()
                .map(|ext| ext.trim().trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            route_prefix: config.route_prefix.trim_matches('/').to_string(),
        }
    }

    pub fn route_prefix(&self) -> &str {
        &self.route_prefix
    }

    /// 按后缀匹配，`tar.gz` 这类多段扩展名同样适用
    pub fn is_tracked(&self, path: &Path) -> bool {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().to_ascii_lowercase(),
            None => return false,
        };

        self.extensions.iter().any(|ext| {
            name.len() > ext.len() + 1
                && name.ends_with(ext.as_str())
                && name.as_bytes()[name.len() - ext.len() - 1] == b'.'
        })
    }

    /// `/<prefix>/<id>/<slug>`
    pub fn download_url(&self, resource: &Resource) -> String {
        format!("/{}/{}/{}", self.route_prefix, resource.id, slugify(&resource.slug))
    }
}

/// 解析 `/<prefix>/<id>/<name>`，末尾斜杠可有可无
pub fn parse_download_route<'a>(path: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    let rest = path.strip_prefix('/')?.strip_prefix(prefix)?.strip_prefix('/')?;
    let rest = rest.strip_suffix('/').unwrap_or(rest);

    let mut parts = rest.splitn(2, '/');
    let id = parts.next().filter(|id| !id.is_empty())?;
    let name = parts.next().unwrap_or("");
    if name.contains('/') {
        return None;
    }
    Some((id, name))
}

fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || c == '.' || c == '_' {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    slug.trim_matches('-').to_string()
}
