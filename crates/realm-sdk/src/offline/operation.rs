use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// 写操作的 HTTP 方法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// 离线期间排队的写操作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineOperation {
    pub id: String,
    pub method: HttpMethod,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
    /// 入队时间（UTC 毫秒）
    pub timestamp: i64,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
}

impl OfflineOperation {
    /// 重试次数已用完
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    pub fn age_ms(&self, now_ms: i64) -> i64 {
        crate::utils::time::elapsed_ms(now_ms, self.timestamp)
    }
}

/// 待入队的操作（id、时间戳和重试计数由队列分配）
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub method: HttpMethod,
    pub endpoint: String,
    pub data: Option<Value>,
    pub options: Option<Value>,
    /// 覆盖队列默认的最大重试次数
    pub max_retries: Option<u32>,
}

impl PendingOperation {
    pub fn new<S: Into<String>>(method: HttpMethod, endpoint: S) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            data: None,
            options: None,
            max_retries: None,
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: Value) -> Self {
        self.options = Some(options);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// 一次 `process()` 的结果
///
/// 队列本身不执行网络请求，`successful` 始终为空；调用方重新发送 `retrying`
/// 中的操作，成功后调用 `remove`。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub successful: Vec<OfflineOperation>,
    pub failed: Vec<OfflineOperation>,
    pub retrying: Vec<OfflineOperation>,
}
