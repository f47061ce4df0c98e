use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealmError {
    #[error("KV store error: {0}")]
    KvStore(String),
    /// 存储配额已满（可通过淘汰后重试恢复）
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    IO(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Transport error: {0}")]
    Transport(String),
    /// 更新了未注册的状态切片（编程错误）
    #[error("State slice not registered: {0}")]
    NotRegistered(String),
    /// 同一切片在自身通知阶段被再次更新
    #[error("Reentrant update on state slice: {0}")]
    ReentrantUpdate(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Config error: {0}")]
    Config(String),
    /// 回调（handler / subscriber / middleware）返回的错误
    #[error("Handler error: {0}")]
    Handler(String),
}

impl From<serde_json::Error> for RealmError {
    fn from(error: serde_json::Error) -> Self {
        RealmError::Serialization(error.to_string())
    }
}

impl From<sled::Error> for RealmError {
    fn from(error: sled::Error) -> Self {
        RealmError::KvStore(error.to_string())
    }
}

impl From<std::io::Error> for RealmError {
    fn from(error: std::io::Error) -> Self {
        RealmError::IO(error.to_string())
    }
}

impl RealmError {
    /// 判断是否为配额错误（持久化缓存据此决定是否淘汰后重试）
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, RealmError::QuotaExceeded(_))
    }

    /// 判断是否为编程错误（应当直接暴露给调用方，而不是降级处理）
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            RealmError::NotRegistered(_) | RealmError::ReentrantUpdate(_)
        )
    }

    /// 从任意回调错误信息构造
    pub fn handler<S: Into<String>>(message: S) -> Self {
        RealmError::Handler(message.into())
    }
}

pub type Result<T> = std::result::Result<T, RealmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RealmError::QuotaExceeded("full".to_string()).is_quota_exceeded());
        assert!(!RealmError::KvStore("io".to_string()).is_quota_exceeded());
        assert!(RealmError::NotRegistered("player".to_string()).is_programming_error());
        assert!(!RealmError::NotConnected.is_programming_error());
    }

    #[test]
    fn test_error_display() {
        let err = RealmError::NotRegistered("inventory".to_string());
        assert_eq!(err.to_string(), "State slice not registered: inventory");

        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let err: RealmError = json_err.into();
        assert!(matches!(err, RealmError::Serialization(_)));
    }
}
