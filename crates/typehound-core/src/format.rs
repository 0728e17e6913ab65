//! 结果整形：单条字符串或（continue 模式）有序的多条结果
use serde::Serialize;
use std::fmt;

use crate::flags::MagicFlags;
use crate::signature::{escape_unprintable, CONTINUE_SEPARATOR};

/// 一次检测的结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Detection {
    /// 最佳命中
    Single(String),
    /// 全部命中，首条即最佳命中，顺序与库输出一致
    All(Vec<String>),
}

impl Detection {
    /// 最佳命中（continue 模式下为第一条）
    pub fn first(&self) -> Option<&str> {
        match self {
            Detection::Single(s) => Some(s.as_str()),
            Detection::All(v) => v.first().map(String::as_str),
        }
    }

    pub fn as_single(&self) -> Option<&str> {
        match self {
            Detection::Single(s) => Some(s.as_str()),
            Detection::All(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        match self {
            Detection::Single(s) => vec![s],
            Detection::All(v) => v,
        }
    }
}

impl fmt::Display for Detection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Detection::Single(s) => f.write_str(s),
            Detection::All(v) => f.write_str(&v.join(CONTINUE_SEPARATOR)),
        }
    }
}

/// 按本次请求生效的选项整形库的原始输出
///
/// continue 模式下库以 RAW 输出，拆分后再按调用方选项逐条转义，
/// 使第一条与单结果模式的输出一致
pub(crate) fn format_result(raw: &str, flags: MagicFlags) -> Detection {
    if flags.contains(MagicFlags::CONTINUE) {
        let mut parts: Vec<&str> = raw.split(CONTINUE_SEPARATOR).collect();
        // 只丢弃末尾的空余段，中间的空段保留
        if parts.last().is_some_and(|s| s.is_empty()) {
            parts.pop();
        }
        let raw_output = flags.contains(MagicFlags::RAW);
        let parts = parts
            .into_iter()
            .map(|s| {
                let s = if raw_output { s.to_string() } else { escape_unprintable(s) };
                trim_artifacts(&s).to_string()
            })
            .collect();
        Detection::All(parts)
    } else {
        Detection::Single(trim_artifacts(raw).to_string())
    }
}

/// 去掉尾部空白、多余分隔符，以及空的 "charset="
fn trim_artifacts(s: &str) -> &str {
    let mut out = s.trim_end();
    loop {
        let before = out.len();
        if let Some(rest) = out.strip_suffix("charset=") {
            out = rest;
        }
        out = out.trim_end_matches(|c: char| c == ';' || c == ',' || c.is_whitespace());
        if out.len() == before {
            return out;
        }
    }
}
