//! 内置特征库后端：`Library` / `Cookie` 的纯 Rust 实现
//!
//! 检测顺序：
//! - 空输入直接返回 "empty"
//! - 内置结构化检查（ELF / CDF / tar）
//! - 二进制规则（按强度降序）
//! - 若内容为文本：文本规则，随后是通用文本描述
//! - 均未命中则为 "data"
use anyhow::{anyhow, Context, Result};
use std::fs::{File, FileTimes};
use std::io::Read;
use std::path::Path;
use tracing::{debug, trace, warn};

use crate::backend::{Cookie, Library};
use crate::builtins;
use crate::detectors::DetectorSet;
use crate::encoding;
use crate::flags::MagicFlags;
use crate::options::DatabaseSource;
use crate::rules::{load_rule_specs, parse_rule_specs, ParsedDatabase};

/// 随库内置的默认特征库
pub const BUILTIN_DATABASE: &str = include_str!("../magic/default.toml");

/// 单个文件最多读取的字节数
pub(crate) const READ_MAX: u64 = 1024 * 1024; // 1 MiB

/// 无 MIME 信息时的回退值
const OCTET_STREAM: &str = "application/octet-stream";
const BINARY: &str = "binary";
/// continue 模式下多条结果的分隔符
pub(crate) const CONTINUE_SEPARATOR: &str = "\n- ";

/// 内置特征库的工厂
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureLibrary;

impl Library for SignatureLibrary {
    fn open(&self, flags: MagicFlags) -> Result<Box<dyn Cookie>> {
        Ok(Box::new(SignatureCookie::new(flags)))
    }
}

/// 一次命中（描述 / MIME 类型 / MIME 编码 / Apple 类型）
#[derive(Debug, Clone)]
struct Hit {
    description: String,
    mime: String,
    encoding: String,
    apple: Option<String>,
}

impl Hit {
    fn new(description: impl Into<String>, mime: impl Into<String>, encoding: impl Into<String>) -> Self {
        Self { description: description.into(), mime: mime.into(), encoding: encoding.into(), apple: None }
    }
}

/// 绑定了选项与已加载特征库的 cookie
pub struct SignatureCookie {
    flags: MagicFlags,
    set: Option<DetectorSet>,
}

impl SignatureCookie {
    pub fn new(flags: MagicFlags) -> Self {
        Self { flags, set: None }
    }

    fn parse(source: &DatabaseSource) -> Result<ParsedDatabase> {
        match source {
            DatabaseSource::Path(p) => load_rule_specs(p),
            DatabaseSource::Buffer(b) => parse_rule_specs(b).context("malformed database buffer"),
            DatabaseSource::Builtin => parse_rule_specs(BUILTIN_DATABASE.as_bytes()).context("malformed builtin database"),
        }
    }

    /// 对内容给出全部命中（至少一条）
    fn hits(&self, set: &DetectorSet, data: &[u8]) -> Vec<Hit> {
        if data.is_empty() {
            return vec![Hit::new("empty", "application/x-empty", BINARY)];
        }
        let flags = self.flags;
        let debug_rules = flags.contains(MagicFlags::DEBUG);
        let soft = !flags.contains(MagicFlags::NO_CHECK_SOFT);

        let text = if flags.contains(MagicFlags::NO_CHECK_TEXT) {
            None
        } else {
            encoding::classify(data, flags.contains(MagicFlags::NO_CHECK_ENCODING))
        };
        let charset = text.as_ref().map(|t| t.encoding.mime_encoding()).unwrap_or(BINARY);

        let mut hits: Vec<Hit> = builtins::check(data, flags)
            .into_iter()
            .map(|b| Hit::new(b.description, b.mime, charset))
            .collect();

        if soft {
            for d in set.detectors.iter().filter(|d| !d.text) {
                let matched = d.matches(data);
                if debug_rules { trace!(rule = %d.id, matched, "magic entry"); }
                if matched {
                    hits.push(Hit {
                        description: d.description.clone(),
                        mime: d.mime.clone().unwrap_or_else(|| OCTET_STREAM.to_string()),
                        encoding: charset.to_string(),
                        apple: d.apple.clone(),
                    });
                }
            }
        }

        if let Some(info) = text {
            let base = info.describe();
            if soft {
                let tokens = !flags.contains(MagicFlags::NO_CHECK_TOKENS);
                for d in set.detectors.iter().filter(|d| d.text && (tokens || !d.is_token_rule())) {
                    let matched = d.matches(data);
                    if debug_rules { trace!(rule = %d.id, matched, "text magic entry"); }
                    if matched {
                        let description = if d.description.is_empty() { base.clone() } else { format!("{}, {}", d.description, base) };
                        hits.push(Hit {
                            description,
                            mime: d.mime.clone().unwrap_or_else(|| "text/plain".to_string()),
                            encoding: charset.to_string(),
                            apple: d.apple.clone(),
                        });
                    }
                }
            }
            hits.push(Hit::new(base, "text/plain", charset));
        }

        if hits.is_empty() {
            hits.push(Hit::new("data", OCTET_STREAM, BINARY));
        }
        hits
    }

    /// 按选项把命中渲染成库的原始输出
    fn render(&self, hits: &[Hit]) -> String {
        let flags = self.flags;
        let one = |h: &Hit| -> String {
            let want_type = flags.contains(MagicFlags::MIME_TYPE);
            let want_enc = flags.contains(MagicFlags::MIME_ENCODING);
            match (want_type, want_enc) {
                (true, true) => format!("{}; charset={}", h.mime, h.encoding),
                (true, false) => h.mime.clone(),
                (false, true) => h.encoding.clone(),
                _ if flags.contains(MagicFlags::APPLE) => h.apple.clone().unwrap_or_else(|| "UNKNUNKN".to_string()),
                _ => h.description.clone(),
            }
        };
        let out = if flags.contains(MagicFlags::CONTINUE) {
            hits.iter().map(one).collect::<Vec<_>>().join(CONTINUE_SEPARATOR)
        } else {
            hits.first().map(one).unwrap_or_default()
        };
        if flags.contains(MagicFlags::RAW) { out } else { escape_unprintable(&out) }
    }

    fn classify(&self, data: &[u8]) -> Result<String> {
        let set = self.set.as_ref().ok_or_else(|| anyhow!("no magic files loaded"))?;
        Ok(self.render(&self.hits(set, data)))
    }

    /// 非普通文件（目录、链接、设备等）的单条结果
    fn special(&self, description: String, mime: &str) -> String {
        self.render(&[Hit::new(description, mime, BINARY)])
    }

    /// 打开失败：带 ERROR 时为错误，否则为描述字符串
    fn open_failure(&self, path: &Path, err: std::io::Error) -> Result<String> {
        let msg = format!("cannot open `{}' ({})", path.display(), err);
        if self.flags.contains(MagicFlags::ERROR) {
            Err(anyhow!(msg))
        } else {
            Ok(msg)
        }
    }

    #[cfg(unix)]
    fn special_file(&self, ft: &std::fs::FileType) -> Option<String> {
        use std::os::unix::fs::FileTypeExt;
        if ft.is_fifo() {
            return Some(self.special("fifo (named pipe)".into(), "inode/fifo"));
        }
        if ft.is_socket() {
            return Some(self.special("socket".into(), "inode/socket"));
        }
        if !self.flags.contains(MagicFlags::DEVICES) {
            if ft.is_block_device() {
                return Some(self.special("block special".into(), "inode/blockdevice"));
            }
            if ft.is_char_device() {
                return Some(self.special("character special".into(), "inode/chardevice"));
            }
        }
        None
    }

    #[cfg(not(unix))]
    fn special_file(&self, _ft: &std::fs::FileType) -> Option<String> {
        None
    }
}

impl Cookie for SignatureCookie {
    fn load(&mut self, source: &DatabaseSource) -> Result<()> {
        let parsed = Self::parse(source)?;
        for (id, why) in &parsed.skipped {
            if self.flags.contains(MagicFlags::CHECK) {
                warn!(rule = %id, reason = %why, "skipping magic entry");
            } else {
                debug!(rule = %id, reason = %why, "skipping magic entry");
            }
        }
        let set = DetectorSet::from_specs(parsed.name, &parsed.specs)?;
        debug!(database = ?source, name = ?set.name, rules = set.len(), "signature database compiled");
        self.set = Some(set);
        Ok(())
    }

    fn set_flags(&mut self, flags: MagicFlags) -> Result<()> {
        self.flags = flags;
        Ok(())
    }

    fn buffer(&mut self, data: &[u8]) -> Result<String> {
        self.classify(data)
    }

    fn file(&mut self, path: &Path) -> Result<String> {
        // 先确认库已加载，避免对文件做无用的 IO
        if self.set.is_none() {
            return Err(anyhow!("no magic files loaded"));
        }
        let follow = self.flags.contains(MagicFlags::SYMLINK);
        let meta = if follow { std::fs::metadata(path) } else { std::fs::symlink_metadata(path) };
        let meta = match meta {
            Ok(m) => m,
            Err(e) => return self.open_failure(path, e),
        };
        let ft = meta.file_type();

        if ft.is_symlink() {
            let target = std::fs::read_link(path).map(|t| t.display().to_string()).unwrap_or_default();
            return Ok(self.special(format!("symbolic link to {}", target), "inode/symlink"));
        }
        if ft.is_dir() {
            return Ok(self.special("directory".into(), "inode/directory"));
        }
        if let Some(out) = self.special_file(&ft) {
            return Ok(out);
        }

        let atime = meta.accessed().ok();
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => return self.open_failure(path, e),
        };
        let mut buf = Vec::new();
        if let Err(e) = (&file).take(READ_MAX).read_to_end(&mut buf) {
            return self.open_failure(path, e);
        }

        if self.flags.contains(MagicFlags::PRESERVE_ATIME) {
            if let Some(t) = atime {
                if let Err(e) = file.set_times(FileTimes::new().set_accessed(t)) {
                    debug!(path = %path.display(), error = %e, "cannot restore access time");
                }
            }
        }

        self.classify(&buf)
    }

    fn close(&mut self) {
        self.set = None;
    }
}

/// 将不可打印字符转义为 `\ooo`（八进制，按 UTF-8 字节）
pub(crate) fn escape_unprintable(s: &str) -> String {
    if !s.chars().any(char::is_control) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 8);
    for c in s.chars() {
        if c.is_control() && c != '\n' {
            let mut tmp = [0u8; 4];
            for b in c.encode_utf8(&mut tmp).bytes() {
                out.push_str(&format!("\\{:03o}", b));
            }
        } else {
            out.push(c);
        }
    }
    out
}
