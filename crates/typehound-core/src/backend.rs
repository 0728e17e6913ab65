//! 匹配库的窄接口：open / load / buffer / file / close
//!
//! 引擎只通过这两个 trait 接触底层匹配库。cookie 是有状态的，
//! 同一时刻只允许一个操作使用，因此 `Cookie` 只要求 `Send`，不要求 `Sync`。
use anyhow::Result;
use std::path::Path;

use crate::flags::MagicFlags;
use crate::options::DatabaseSource;

/// 一个已打开的匹配库实例
pub trait Cookie: Send {
    /// 加载特征库；失败时 cookie 保持可再次加载
    fn load(&mut self, source: &DatabaseSource) -> Result<()>;

    /// 替换选项位集
    fn set_flags(&mut self, flags: MagicFlags) -> Result<()>;

    /// 对内存缓冲区做检测，返回库的原始输出
    fn buffer(&mut self, data: &[u8]) -> Result<String>;

    /// 对路径做检测，返回库的原始输出
    fn file(&mut self, path: &Path) -> Result<String>;

    /// 释放底层资源；句柄保证只调用一次
    fn close(&mut self) {}
}

/// 匹配库工厂
pub trait Library: Send + Sync {
    fn open(&self, flags: MagicFlags) -> Result<Box<dyn Cookie>>;
}
