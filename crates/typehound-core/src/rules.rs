//! 特征库文件加载（TOML）
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::path::Path;

/// 当前支持的特征库格式版本
pub(crate) const DATABASE_FORMAT: u32 = 1;

/// 默认强度（越高越优先）
const DEFAULT_STRENGTH: u32 = 50;
/// regex 规则默认搜索窗口
const DEFAULT_RANGE: usize = 4096;

/// 库头信息
#[derive(Debug, Clone, Deserialize)]
struct DatabaseHeader {
    format: Option<u32>,
    #[serde(default)]
    name: Option<String>,
}

/// 单条规则的配置（hex / string / regex / tokens 四选一）
#[derive(Debug, Clone, Deserialize)]
struct RuleEntry {
    pub id: String,
    #[serde(default, alias = "name")]
    pub description: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub apple: Option<String>,
    #[serde(default)]
    pub strength: Option<u32>,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub hex: Option<String>,
    #[serde(default)]
    pub string: Option<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub range: Option<usize>,
    #[serde(default)]
    pub tokens: Option<Vec<String>>,
    #[serde(default)]
    pub min_tokens: Option<usize>,
    #[serde(default)]
    pub text: bool,
}

/// 顶层文件结构
#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    database: Option<DatabaseHeader>,
    #[serde(default)]
    rules: Vec<RuleEntry>,
}

/// 模式字节：精确值 / 通配 / 范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PatternByte {
    Exact(u8),
    Any,
    Range(u8, u8),
}

impl PatternByte {
    pub(crate) fn matches(&self, b: u8) -> bool {
        match *self {
            PatternByte::Exact(v) => v == b,
            PatternByte::Any => true,
            PatternByte::Range(lo, hi) => (lo..=hi).contains(&b),
        }
    }
}

/// 归一化后的测试类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RuleTest {
    Bytes(Vec<PatternByte>),
    Regex { pattern: String, range: usize },
    Tokens { words: Vec<String>, min: usize },
}

/// 归一化后的规则规格（内部使用）
#[derive(Debug, Clone)]
pub(crate) struct RuleSpec {
    pub id: String,
    pub description: String,
    pub mime: Option<String>,
    pub apple: Option<String>,
    pub strength: u32,
    pub offset: usize,
    pub text: bool,
    pub test: RuleTest,
}

/// 解析结果：可用规则 + 被跳过的规则（id, 原因）
#[derive(Debug, Default)]
pub(crate) struct ParsedDatabase {
    pub name: Option<String>,
    pub specs: Vec<RuleSpec>,
    pub skipped: Vec<(String, String)>,
}

/// 从文件加载
pub(crate) fn load_rule_specs(path: &Path) -> Result<ParsedDatabase> {
    if path.as_os_str().is_empty() {
        bail!("no database path");
    }
    let bytes = std::fs::read(path).with_context(|| format!("cannot read `{}'", path.display()))?;
    parse_rule_specs(&bytes).with_context(|| format!("malformed database `{}'", path.display()))
}

/// 从内存内容解析并归一化为 RuleSpec 列表
pub(crate) fn parse_rule_specs(bytes: &[u8]) -> Result<ParsedDatabase> {
    let txt = std::str::from_utf8(bytes).context("database is not valid UTF-8")?;
    let parsed: RuleFile = toml::from_str(txt)?;

    let header = parsed.database.ok_or_else(|| anyhow!("missing [database] header"))?;
    match header.format {
        Some(DATABASE_FORMAT) => {}
        Some(v) => bail!("unsupported database format {} (expected {})", v, DATABASE_FORMAT),
        None => bail!("missing database format"),
    }

    let mut out = ParsedDatabase { name: header.name, ..Default::default() };
    for e in parsed.rules {
        let id = e.id.clone();
        match normalize(e) {
            Ok(spec) => out.specs.push(spec),
            Err(err) => out.skipped.push((id, err.to_string())),
        }
    }

    if out.specs.is_empty() {
        bail!("no usable magic entries");
    }
    Ok(out)
}

fn normalize(e: RuleEntry) -> Result<RuleSpec> {
    let description = e.description.unwrap_or_default();
    if description.is_empty() && e.mime.is_none() {
        bail!("rule has neither description nor mime");
    }

    // 四种测试字段互斥，按 hex → string → regex → tokens 的顺序取第一个
    let test = match (e.hex, e.string, e.regex, e.tokens) {
        (Some(h), _, _, _) => RuleTest::Bytes(parse_hex_pattern(&h)?),
        (None, Some(s), _, _) => {
            if s.is_empty() { bail!("empty string test"); }
            RuleTest::Bytes(s.bytes().map(PatternByte::Exact).collect())
        }
        (None, None, Some(r), _) => {
            regex::bytes::Regex::new(&r).map_err(|err| anyhow!("bad regex: {}", err))?;
            RuleTest::Regex { pattern: r, range: e.range.unwrap_or(DEFAULT_RANGE) }
        }
        (None, None, None, Some(words)) => {
            let words: Vec<String> = words.into_iter().filter(|w| !w.is_empty()).collect();
            if words.is_empty() { bail!("empty token list"); }
            let min = e.min_tokens.unwrap_or(1).max(1);
            RuleTest::Tokens { words, min }
        }
        _ => bail!("rule has no test (hex, string, regex or tokens)"),
    };

    Ok(RuleSpec {
        id: e.id,
        description,
        mime: e.mime,
        apple: e.apple,
        strength: e.strength.unwrap_or(DEFAULT_STRENGTH),
        offset: e.offset,
        text: e.text,
        test,
    })
}

/// 解析十六进制模式，例如 "FF D8 FF ?? 00-1F"
pub(crate) fn parse_hex_pattern(s: &str) -> Result<Vec<PatternByte>> {
    let bytes = s
        .split_whitespace()
        .map(|part| {
            if part == "??" || part == "?" {
                return Ok(PatternByte::Any);
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let lo = u8::from_str_radix(lo, 16).map_err(|_| anyhow!("invalid hex: {}", lo))?;
                let hi = u8::from_str_radix(hi, 16).map_err(|_| anyhow!("invalid hex: {}", hi))?;
                if lo > hi { bail!("invalid range: {}", part); }
                return Ok(PatternByte::Range(lo, hi));
            }
            u8::from_str_radix(part, 16).map(PatternByte::Exact).map_err(|_| anyhow!("invalid hex: {}", part))
        })
        .collect::<Result<Vec<_>>>()?;
    if bytes.is_empty() { bail!("empty hex pattern"); }
    Ok(bytes)
}
