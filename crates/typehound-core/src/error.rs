//! 错误类型
use thiserror::Error;

/// 引擎对外暴露的全部错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MagicError {
    /// cookie 无法创建，实例不可用
    #[error("failed to open magic cookie: {0}")]
    OpenFailed(String),

    /// 主库与备用库均加载失败，实例不可用
    #[error("failed to load signature database: {0}")]
    LoadFailed(String),

    /// 在已关闭的句柄上发起操作
    #[error("magic handle is closed")]
    HandleClosed,

    /// 单次检测失败，仅影响本次请求
    #[error("detection failed: {0}")]
    DetectFailed(String),

    /// 请求在执行前被撤回
    #[error("request cancelled before execution")]
    Cancelled,
}

impl MagicError {
    /// 是否为实例级致命错误（构造期）
    pub fn is_fatal(&self) -> bool {
        matches!(self, MagicError::OpenFailed(_) | MagicError::LoadFailed(_))
    }
}

/// 将后端的 anyhow 错误链压平为原因字符串
pub(crate) fn reason(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

pub type Result<T> = std::result::Result<T, MagicError>;
