//! 核心检测库
//!
//! 设计要点：
//! - 底层匹配库只通过 `Library` / `Cookie` 这一窄接口使用；内置实现为基于 TOML 特征库的 `SignatureLibrary`。
//! - 每个句柄一条串行化队列：同一句柄上的请求按提交顺序逐条执行，不同句柄在共享线程池上并行。
//! - 选项修改、重新加载与检测走同一队列，不会出现“半新半旧”的配置。
//! - 结果通过 `Pending` 凭据（crossbeam 通道）或回调送回，调用方不会阻塞在底层调用上。

mod backend;
mod builtins;
mod detectors;
mod encoding;
mod error;
mod flags;
mod format;
mod handle;
mod magic;
mod options;
mod queue;
mod resolver;
mod rules;
mod signature;

pub use backend::{Cookie, Library};
pub use error::{MagicError, Result};
pub use flags::{MagicFlags, UnknownFlag};
pub use format::Detection;
pub use handle::HandleState;
pub use magic::Magic;
pub use options::{DatabaseConfig, DatabaseSource, MagicOptions};
pub use queue::{Pending, RequestId, WorkerPool};
pub use signature::{SignatureCookie, SignatureLibrary, BUILTIN_DATABASE};
