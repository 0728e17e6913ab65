//! 对外入口：持有一个句柄，所有请求经串行化队列在后台执行
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::backend::Library;
use crate::error::MagicError;
use crate::flags::MagicFlags;
use crate::format::Detection;
use crate::handle::{HandleState, Input, ResourceHandle};
use crate::options::{DatabaseConfig, DatabaseSource, MagicOptions};
use crate::queue::{Completion, Lane, Pending, RequestId, WorkerPool, Work};
use crate::signature::SignatureLibrary;

/// 内容类型检测器
///
/// - 同一检测器上的请求严格按提交顺序执行，且一次只执行一个；
/// - 不同检测器之间在共享线程池上并行；
/// - 构造时同步完成打开与加载，失败直接返回错误。
pub struct Magic {
    lane: Arc<Lane>,
}

impl Magic {
    /// 内置特征后端 + 进程共享线程池
    pub fn new(options: MagicOptions) -> Result<Self, MagicError> {
        Self::with_pool(options, WorkerPool::shared()?)
    }

    /// 内置特征后端 + 指定线程池
    pub fn with_pool(options: MagicOptions, pool: WorkerPool) -> Result<Self, MagicError> {
        Self::with_library(options, Arc::new(SignatureLibrary), pool)
    }

    /// 指定底层库实现
    pub fn with_library(options: MagicOptions, library: Arc<dyn Library>, pool: WorkerPool) -> Result<Self, MagicError> {
        let mut handle = ResourceHandle::open(library, options.flags)?;
        handle.load(&options.database)?;
        info!(flags = ?options.flags, database = ?handle.database(), threads = pool.threads(), "magic handle ready");
        Ok(Self { lane: Lane::new(handle, pool) })
    }

    /// 检测内存缓冲区（长度为零合法）
    pub fn detect(&self, data: impl Into<Arc<[u8]>>) -> Pending<Detection> {
        let input = Input::Buffer(data.into());
        Pending::submit(&self.lane, |done| Work::Detect { input, done })
    }

    /// 检测文件；路径原样交给底层库
    pub fn detect_file(&self, path: impl AsRef<Path>) -> Pending<Detection> {
        let input = Input::Path(path.as_ref().to_path_buf());
        Pending::submit(&self.lane, |done| Work::Detect { input, done })
    }

    /// 回调形式的 `detect`；回调在工作线程上恰好调用一次
    pub fn detect_with<F>(&self, data: impl Into<Arc<[u8]>>, callback: F) -> RequestId
    where
        F: FnOnce(Result<Detection, MagicError>) + Send + 'static,
    {
        let done = Completion::callback(Box::new(callback));
        self.lane.submit(Work::Detect { input: Input::Buffer(data.into()), done })
    }

    /// 回调形式的 `detect_file`
    pub fn detect_file_with<F>(&self, path: impl AsRef<Path>, callback: F) -> RequestId
    where
        F: FnOnce(Result<Detection, MagicError>) + Send + 'static,
    {
        let done = Completion::callback(Box::new(callback));
        self.lane.submit(Work::Detect { input: Input::Path(path.as_ref().to_path_buf()), done })
    }

    /// 替换选项；排在之前提交的请求之后，对之后提交的请求生效
    pub fn set_flags(&self, flags: MagicFlags) -> Pending<()> {
        Pending::submit(&self.lane, |done| Work::SetFlags { flags, done })
    }

    /// 重新加载特征库；失败时保留原特征库
    pub fn reload(&self, database: DatabaseConfig) -> Pending<()> {
        Pending::submit(&self.lane, |done| Work::Reload { config: database, done })
    }

    /// 撤回尚未开始执行的请求
    pub fn cancel(&self, id: RequestId) -> bool {
        self.lane.cancel(id)
    }

    /// 当前已生效的选项（不含排队中的修改）
    pub fn flags(&self) -> MagicFlags {
        self.lane.status().flags
    }

    /// 当前已加载的特征库
    pub fn database(&self) -> Option<DatabaseSource> {
        self.lane.status().database
    }

    pub fn state(&self) -> HandleState {
        self.lane.status().state
    }

    /// 排队中（尚未开始）的请求数
    pub fn queued(&self) -> usize {
        self.lane.queued()
    }

    /// 关闭：排队中的请求以 HandleClosed 完成，正在执行的请求照常完成
    pub fn close(&self) {
        self.lane.close();
    }

    pub fn is_closed(&self) -> bool {
        self.lane.is_closed()
    }
}

impl Drop for Magic {
    fn drop(&mut self) {
        self.lane.close();
    }
}
