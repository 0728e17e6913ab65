//! 特征库解析：主库失败后才尝试备用库
use tracing::{info, warn};

use crate::backend::Cookie;
use crate::error::{reason, MagicError};
use crate::flags::MagicFlags;
use crate::options::{DatabaseConfig, DatabaseSource};

/// 给出加载候选并执行“主库 → 备用库”的加载流程
#[derive(Debug, Clone)]
pub(crate) struct DatabaseResolver<'a> {
    config: &'a DatabaseConfig,
}

impl<'a> DatabaseResolver<'a> {
    pub(crate) fn new(config: &'a DatabaseConfig) -> Self {
        Self { config }
    }

    /// 候选顺序：主库，然后备用库（与主库相同则不重复）
    pub(crate) fn candidates(&self) -> Vec<&'a DatabaseSource> {
        let mut out = vec![&self.config.primary];
        if let Some(fb) = &self.config.fallback {
            if fb != &self.config.primary {
                out.push(fb);
            }
        }
        out
    }

    /// 依次加载候选；返回实际生效的来源
    /// 只有在上一个候选明确失败后才会尝试下一个，失败原因全部保留在错误中
    pub(crate) fn load_into(&self, cookie: &mut dyn Cookie, flags: MagicFlags) -> Result<DatabaseSource, MagicError> {
        let mut failures: Vec<String> = Vec::new();
        for source in self.candidates() {
            match cookie.load(source) {
                Ok(()) => {
                    if !failures.is_empty() {
                        warn!(database = ?source, primary_error = %failures[0], "primary database failed, using fallback");
                    }
                    info!(database = ?source, ?flags, "signature database loaded");
                    return Ok(source.clone());
                }
                Err(e) => failures.push(format!("{:?}: {}", source, reason(&e))),
            }
        }
        Err(MagicError::LoadFailed(failures.join("; ")))
    }
}
