//! 检测选项与数据库配置（模块）
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::flags::MagicFlags;

/// 特征库来源
#[derive(Clone, PartialEq, Eq)]
pub enum DatabaseSource {
    /// 磁盘上的已编译特征库
    Path(PathBuf),
    /// 内存中的特征库内容
    Buffer(Arc<[u8]>),
    /// 随库内置的默认特征库
    Builtin,
}

impl DatabaseSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        DatabaseSource::Path(path.into())
    }

    pub fn buffer(bytes: impl Into<Arc<[u8]>>) -> Self {
        DatabaseSource::Buffer(bytes.into())
    }

    /// 用于日志与 `Magic::database()` 的简短标签
    pub fn label(&self) -> String {
        match self {
            DatabaseSource::Path(p) => p.display().to_string(),
            DatabaseSource::Buffer(b) => format!("<buffer: {} bytes>", b.len()),
            DatabaseSource::Builtin => "<builtin>".to_string(),
        }
    }
}

impl fmt::Debug for DatabaseSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// 主库 + 备用库；由调用方显式给出，不存在进程级隐藏状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub primary: DatabaseSource,
    pub fallback: Option<DatabaseSource>,
}

impl DatabaseConfig {
    pub fn new(primary: DatabaseSource) -> Self {
        Self { primary, fallback: None }
    }

    pub fn with_fallback(mut self, fallback: DatabaseSource) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(DatabaseSource::Builtin)
    }
}

/// 检测器构造选项
#[derive(Debug, Clone, Default)]
pub struct MagicOptions {
    /// 初始选项位集；默认空集（描述模式）
    pub flags: MagicFlags,
    /// 特征库配置；默认内置库
    pub database: DatabaseConfig,
}

impl MagicOptions {
    pub fn new(flags: MagicFlags) -> Self {
        Self { flags, database: DatabaseConfig::default() }
    }

    pub fn database(mut self, database: DatabaseConfig) -> Self {
        self.database = database;
        self
    }
}
