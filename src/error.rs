use std::path::PathBuf;

use thiserror::Error;

/// 补丁流程中可区分的错误类型
///
/// 所有操作对外返回 `anyhow::Result`，需要区分错误类型时通过
/// `err.downcast_ref::<PatchError>()` 取回。
#[derive(Debug, Error)]
pub enum PatchError {
    /// 没有任何容器实现能打开该路径
    #[error("不支持的归档格式或归档已损坏: {}", .0.display())]
    UnsupportedArchive(PathBuf),

    /// 容器已关闭
    #[error("容器已关闭: {}", .0.display())]
    ResourceClosed(PathBuf),

    /// 还原属主需要 root 权限
    #[error("应用补丁需要 root 权限 (当前 euid = {euid})，或使用 --ignore-euid 跳过检查")]
    PrivilegeRequired { euid: u32 },

    /// 并行任务失败，包装提交顺序最早的那个错误
    #[error("任务 #{index} 执行失败")]
    TaskFailure {
        index: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },

    /// join_all 之后不能再提交任务
    #[error("任务执行器已关闭，无法继续添加任务")]
    RunnerClosed,

    /// 缓存索引中不存在该成员
    #[error("{} 中不存在成员: {member}", .container.display())]
    MissingMember { container: PathBuf, member: String },

    /// 违反节点结构约束 (例如向文件节点添加子项)
    #[error("非法的节点操作: {0}")]
    InvalidNode(String),

    /// 外部差分工具返回非零状态
    #[error("差分工具执行失败 ({status}): {command}\n{output}")]
    DeltaToolFailure {
        command: String,
        status: String,
        output: String,
    },

    /// 还原后的文件校验和与清单不一致
    #[error("{} 的校验和不匹配: 期望 {expected}, 实际 {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// 输出位置已存在且不是目录，例如未指定 TARGET 时旧版本是归档文件
    #[error("目标不是目录: {}，旧版本为归档时必须指定 TARGET", .0.display())]
    TargetNotDirectory(PathBuf),

    /// 补丁包结构不完整
    #[error("无效的补丁包 {}: {reason}", .path.display())]
    InvalidBundle { path: PathBuf, reason: String },
}
