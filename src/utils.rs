use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

/// 从 URL 字符串中提取路径部分
pub fn get_url_path(url: &str) -> &str {
    url.split('?')
        .next()
        .unwrap_or(url)
        .split('#')
        .next()
        .unwrap_or(url)
}

/// 计算字符串的哈希值
///
/// # Returns
/// 返回16位的十六进制哈希字符串
///
/// # Examples
/// ```
/// use download_counter::utils::hash_key;
///
/// let hash = hash_key("attachment/42");
/// assert_eq!(hash.len(), 16);
/// ```
pub fn hash_key(key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// 资源 ID 转为可安全用作文件名的字符串
///
/// 只含 `[A-Za-z0-9_-]` 的 ID 原样保留，其它的取哈希
pub fn safe_file_component(id: &str) -> String {
    let plain = !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if plain {
        id.to_string()
    } else {
        hash_key(id)
    }
}

/// 按 RFC 1123 (GMT) 格式化时间
///
/// # Examples
/// ```
/// use std::time::{Duration, UNIX_EPOCH};
/// use download_counter::utils::format_http_date;
///
/// let t = UNIX_EPOCH + Duration::from_secs(784111777);
/// assert_eq!(format_http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
/// ```
pub fn format_http_date(time: SystemTime) -> String {
    httpdate::fmt_http_date(time)
}

/// 解析 HTTP 日期，支持 RFC 1123、RFC 850 和 asctime 三种格式
pub fn parse_http_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value.trim()).ok()
}

/// HTTP 日期只精确到秒
pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// 把文件名中不能放进响应头的字符替换掉
pub fn header_safe_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != ';' && c != '\\' => c,
            _ => '_',
        })
        .collect()
}
