//! 检测选项位集（与 libmagic 的 MAGIC_* 数值保持一致）
use bitflags::bitflags;
use std::fmt;
use std::str::FromStr;

bitflags! {
    /// 可组合的检测选项；默认空集 = 人类可读描述模式
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MagicFlags: u32 {
        /// 打开调试输出（trace 级别逐条规则日志）
        const DEBUG            = 0x000001;
        /// 跟随符号链接
        const SYMLINK          = 0x000002;
        /// 读取块/字符设备的内容
        const DEVICES          = 0x000008;
        /// 返回 MIME 类型
        const MIME_TYPE        = 0x000010;
        /// 返回全部命中，而非仅最佳命中
        const CONTINUE         = 0x000020;
        /// 向诊断流输出警告
        const CHECK            = 0x000040;
        /// 读取后恢复访问时间
        const PRESERVE_ATIME   = 0x000080;
        /// 不转义不可打印字符
        const RAW              = 0x000100;
        /// 打开/读取失败视为错误，而非描述字符串
        const ERROR            = 0x000200;
        /// 返回 MIME 编码
        const MIME_ENCODING    = 0x000400;
        /// MIME_TYPE | MIME_ENCODING
        const MIME             = Self::MIME_TYPE.bits() | Self::MIME_ENCODING.bits();
        /// 返回 Apple creator/type
        const APPLE            = 0x000800;
        const NO_CHECK_TAR      = 0x002000;
        const NO_CHECK_SOFT     = 0x004000;
        const NO_CHECK_APPTYPE  = 0x008000;
        const NO_CHECK_ELF      = 0x010000;
        const NO_CHECK_TEXT     = 0x020000;
        const NO_CHECK_CDF      = 0x040000;
        const NO_CHECK_TOKENS   = 0x100000;
        const NO_CHECK_ENCODING = 0x200000;
    }
}

impl Default for MagicFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// kebab-case 名称表（配置文件与 CLI 使用）
const NAMES: &[(&str, MagicFlags)] = &[
    ("debug", MagicFlags::DEBUG),
    ("symlink", MagicFlags::SYMLINK),
    ("devices", MagicFlags::DEVICES),
    ("mime-type", MagicFlags::MIME_TYPE),
    ("continue", MagicFlags::CONTINUE),
    ("check", MagicFlags::CHECK),
    ("preserve-atime", MagicFlags::PRESERVE_ATIME),
    ("raw", MagicFlags::RAW),
    ("error", MagicFlags::ERROR),
    ("mime-encoding", MagicFlags::MIME_ENCODING),
    ("mime", MagicFlags::MIME),
    ("apple", MagicFlags::APPLE),
    ("no-check-tar", MagicFlags::NO_CHECK_TAR),
    ("no-check-soft", MagicFlags::NO_CHECK_SOFT),
    ("no-check-apptype", MagicFlags::NO_CHECK_APPTYPE),
    ("no-check-elf", MagicFlags::NO_CHECK_ELF),
    ("no-check-text", MagicFlags::NO_CHECK_TEXT),
    ("no-check-cdf", MagicFlags::NO_CHECK_CDF),
    ("no-check-tokens", MagicFlags::NO_CHECK_TOKENS),
    ("no-check-encoding", MagicFlags::NO_CHECK_ENCODING),
];

impl MagicFlags {
    /// 从原始整数构造；未识别的位被忽略（向前兼容，不报错）
    pub fn from_raw(bits: u32) -> Self {
        Self::from_bits_truncate(bits)
    }

    /// 交给 cookie 的实际选项：
    /// - CONTINUE 隐含 RAW，便于按分隔符拆分多条结果
    /// - 始终带 ERROR，使不可读文件以错误形式返回
    pub(crate) fn effective(self) -> Self {
        let mut flags = self | MagicFlags::ERROR;
        if flags.contains(MagicFlags::CONTINUE) {
            flags |= MagicFlags::RAW;
        }
        flags
    }
}

/// 名称解析失败
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownFlag(pub String);

impl fmt::Display for UnknownFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown flag name: {}", self.0)
    }
}

impl std::error::Error for UnknownFlag {}

impl FromStr for MagicFlags {
    type Err = UnknownFlag;

    /// 解析 `mime-type,continue` 或 `mime-type|continue`；空串为空集
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut flags = MagicFlags::empty();
        for part in s.split(|c: char| c == ',' || c == '|') {
            let name = part.trim();
            if name.is_empty() || name.eq_ignore_ascii_case("none") { continue; }
            let name = name.to_ascii_lowercase().replace('_', "-");
            match NAMES.iter().find(|(n, _)| *n == name) {
                Some((_, f)) => flags |= *f,
                None => return Err(UnknownFlag(part.trim().to_string())),
            }
        }
        Ok(flags)
    }
}
