//! 编译期生成 BUILD_TIMESTAMP、GIT_SHA 等元信息（供 version.rs 使用）

use vergen::EmitBuilder;

fn main() {
    // 非 git 工作区下 git_sha 取不到，忽略错误，version.rs 用 option_env! 兜底
    let _ = EmitBuilder::builder()
        .build_timestamp()
        .git_sha(true)
        .emit();
}
