//! 编译后的特征集合（字节模式 / bytes 正则 / 关键字自动机）
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};
use anyhow::{Context, Result};
use std::collections::HashSet;

use crate::rules::{PatternByte, RuleSpec, RuleTest};

/// 编译后的测试
pub(crate) enum CompiledTest {
    Bytes(Vec<PatternByte>),
    Regex { re: regex::bytes::Regex, range: usize },
    Tokens { ac: AhoCorasick, count: usize, min: usize },
}

/// 单条已编译规则
pub(crate) struct Detector {
    pub(crate) id: String,
    pub(crate) description: String,
    pub(crate) mime: Option<String>,
    pub(crate) apple: Option<String>,
    pub(crate) strength: u32,
    pub(crate) offset: usize,
    pub(crate) text: bool,
    pub(crate) test: CompiledTest,
}

impl Detector {
    /// 规则是否命中 `buf`
    pub(crate) fn matches(&self, buf: &[u8]) -> bool {
        if self.offset > buf.len() { return false; }
        let tail = &buf[self.offset..];
        match &self.test {
            CompiledTest::Bytes(pat) => {
                tail.len() >= pat.len() && pat.iter().zip(tail).all(|(p, &b)| p.matches(b))
            }
            CompiledTest::Regex { re, range } => {
                let end = (*range).min(tail.len());
                re.is_match(&tail[..end])
            }
            CompiledTest::Tokens { ac, count, min } => {
                // 只统计不同关键字的命中数，且要求词边界，避免 "classify" 命中 "class"
                let mut seen: HashSet<usize> = HashSet::new();
                for m in ac.find_iter(tail) {
                    if is_word_boundary(tail, m.start(), m.end()) {
                        seen.insert(m.pattern().as_usize());
                        if seen.len() >= *min || seen.len() == *count { break; }
                    }
                }
                seen.len() >= (*min).min(*count)
            }
        }
    }

    pub(crate) fn is_token_rule(&self) -> bool {
        matches!(self.test, CompiledTest::Tokens { .. })
    }
}

/// 关键字两端若为单词字符，则要求其外侧不是单词字符（"std::" 之后可以紧跟标识符）
fn is_word_boundary(buf: &[u8], start: usize, end: usize) -> bool {
    let word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let before = start == 0 || !word(buf[start]) || !word(buf[start - 1]);
    let after = end >= buf.len() || !word(buf[end - 1]) || !word(buf[end]);
    before && after
}

/// 字节级检测器集合：按强度降序（同强度保持库中顺序）
pub(crate) struct DetectorSet {
    pub(crate) name: Option<String>,
    pub(crate) detectors: Vec<Detector>,
}

impl DetectorSet {
    /// 从规则条目构建检测器集合
    pub(crate) fn from_specs(name: Option<String>, specs: &[RuleSpec]) -> Result<Self> {
        let mut detectors = Vec::with_capacity(specs.len());
        for r in specs {
            let test = match &r.test {
                RuleTest::Bytes(p) => CompiledTest::Bytes(p.clone()),
                RuleTest::Regex { pattern, range } => {
                    let re = regex::bytes::Regex::new(pattern).with_context(|| format!("rule {}", r.id))?;
                    CompiledTest::Regex { re, range: *range }
                }
                RuleTest::Tokens { words, min } => {
                    let ac = AhoCorasickBuilder::new()
                        .match_kind(MatchKind::LeftmostLongest)
                        .build(words)
                        .with_context(|| format!("rule {}", r.id))?;
                    CompiledTest::Tokens { ac, count: words.len(), min: *min }
                }
            };
            detectors.push(Detector {
                id: r.id.clone(),
                description: r.description.clone(),
                mime: r.mime.clone(),
                apple: r.apple.clone(),
                strength: r.strength,
                offset: r.offset,
                text: r.text,
                test,
            });
        }
        // 稳定排序：强度降序
        detectors.sort_by(|a, b| b.strength.cmp(&a.strength));
        Ok(Self { name, detectors })
    }

    pub(crate) fn len(&self) -> usize {
        self.detectors.len()
    }
}
