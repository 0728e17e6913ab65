//! 资源句柄：独占一个 cookie，维护选项、已加载库与生命周期状态
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::{Cookie, Library};
use crate::error::{reason, MagicError};
use crate::flags::MagicFlags;
use crate::options::{DatabaseConfig, DatabaseSource};
use crate::resolver::DatabaseResolver;

/// 生命周期：Created → Loading → Ready → (Detecting ⇄ Ready)* → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Created,
    Loading,
    Ready,
    Detecting,
    Closed,
}

/// 检测输入：内存缓冲区或文件路径（路径原样传递，不做重编码）
#[derive(Debug, Clone)]
pub(crate) enum Input {
    Buffer(Arc<[u8]>),
    Path(PathBuf),
}

/// 底层库 panic 时给出的原因
const INTERNAL_ERROR: &str = "internal library error";

/// 底层库的 panic 只影响本次操作，映射为对应的错误
fn guarded<R>(on_panic: fn(String) -> MagicError, f: impl FnOnce() -> Result<R, MagicError>) -> Result<R, MagicError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| Err(on_panic(INTERNAL_ERROR.to_string())))
}

pub(crate) struct ResourceHandle {
    library: Arc<dyn Library>,
    cookie: Option<Box<dyn Cookie>>,
    flags: MagicFlags,
    database: Option<DatabaseSource>,
    state: HandleState,
}

impl ResourceHandle {
    /// 打开 cookie（尚未加载特征库）
    pub(crate) fn open(library: Arc<dyn Library>, flags: MagicFlags) -> Result<Self, MagicError> {
        let cookie = library.open(flags.effective()).map_err(|e| MagicError::OpenFailed(reason(&e)))?;
        Ok(Self { library, cookie: Some(cookie), flags, database: None, state: HandleState::Created })
    }

    pub(crate) fn state(&self) -> HandleState {
        self.state
    }

    pub(crate) fn flags(&self) -> MagicFlags {
        self.flags
    }

    pub(crate) fn database(&self) -> Option<&DatabaseSource> {
        self.database.as_ref()
    }

    fn cookie_mut(&mut self) -> Result<&mut Box<dyn Cookie>, MagicError> {
        match self.state {
            HandleState::Closed => Err(MagicError::HandleClosed),
            _ => self.cookie.as_mut().ok_or(MagicError::HandleClosed),
        }
    }

    /// 首次加载：主库失败后回退到备用库
    pub(crate) fn load(&mut self, config: &DatabaseConfig) -> Result<(), MagicError> {
        if self.state == HandleState::Closed {
            return Err(MagicError::HandleClosed);
        }
        let flags = self.flags;
        self.state = HandleState::Loading;
        let cookie = self.cookie.as_mut().ok_or(MagicError::HandleClosed)?;
        match DatabaseResolver::new(config).load_into(cookie.as_mut(), flags) {
            Ok(source) => {
                self.database = Some(source);
                self.state = HandleState::Ready;
                Ok(())
            }
            Err(e) => {
                // 未加载成功的句柄不可用于检测
                self.state = HandleState::Created;
                Err(e)
            }
        }
    }

    /// 重新加载：在新 cookie 上加载，成功后才替换旧 cookie
    pub(crate) fn reload(&mut self, config: &DatabaseConfig) -> Result<(), MagicError> {
        if self.state == HandleState::Closed {
            return Err(MagicError::HandleClosed);
        }
        let (library, flags) = (&self.library, self.flags);
        let (fresh, source) = guarded(MagicError::LoadFailed, || {
            let mut fresh = library.open(flags.effective()).map_err(|e| MagicError::OpenFailed(reason(&e)))?;
            let source = DatabaseResolver::new(config).load_into(fresh.as_mut(), flags)?;
            Ok((fresh, source))
        })?;
        if let Some(mut old) = self.cookie.replace(fresh) {
            old.close();
        }
        info!(database = ?source, "signature database reloaded");
        self.database = Some(source);
        self.state = HandleState::Ready;
        Ok(())
    }

    /// 替换选项；下一条请求开始执行时生效
    pub(crate) fn set_flags(&mut self, flags: MagicFlags) -> Result<(), MagicError> {
        let cookie = self.cookie_mut()?;
        guarded(MagicError::DetectFailed, || {
            cookie.set_flags(flags.effective()).map_err(|e| MagicError::DetectFailed(reason(&e)))
        })?;
        self.flags = flags;
        debug!(?flags, "flags updated");
        Ok(())
    }

    /// 执行一次检测，返回库的原始输出及本次生效的选项
    pub(crate) fn detect(&mut self, input: &Input) -> Result<(String, MagicFlags), MagicError> {
        match self.state {
            HandleState::Ready => {}
            HandleState::Closed => return Err(MagicError::HandleClosed),
            other => return Err(MagicError::DetectFailed(format!("handle not ready ({:?})", other))),
        }
        let flags = self.flags;
        self.state = HandleState::Detecting;
        let cookie = self.cookie.as_mut().ok_or(MagicError::HandleClosed)?;

        let out = guarded(MagicError::DetectFailed, || {
            match input {
                Input::Buffer(data) => cookie.buffer(data),
                Input::Path(path) => cookie.file(path),
            }
            .map_err(|e| MagicError::DetectFailed(reason(&e)))
        });
        self.state = HandleState::Ready;
        out.map(|raw| (raw, flags))
    }

    /// 幂等关闭；cookie 只释放一次
    pub(crate) fn close(&mut self) {
        if let Some(mut cookie) = self.cookie.take() {
            cookie.close();
            debug!("magic cookie released");
        }
        self.state = HandleState::Closed;
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.close();
    }
}
