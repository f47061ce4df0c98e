//! SDK 版本与构建元信息
//!
//! - **SDK Version** → Cargo.toml（唯一权威源）
//! - **Build Metadata** → build.rs 中由 vergen 生成

/// SDK semver，来自 Cargo.toml
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// git commit（非 git 工作区构建时为 "unknown"）
pub const GIT_SHA: &str = match option_env!("VERGEN_GIT_SHA") {
    Some(sha) => sha,
    None => "unknown",
};

/// 构建时间
pub const BUILD_TIME: &str = match option_env!("VERGEN_BUILD_TIMESTAMP") {
    Some(ts) => ts,
    None => "unknown",
};

/// 版本摘要，用于日志打印
pub fn version_string() -> String {
    format!("realm-sdk {} ({}, built {})", SDK_VERSION, GIT_SHA, BUILD_TIME)
}
