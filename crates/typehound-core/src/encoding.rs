//! 文本编码判定（ASCII / UTF-8 / UTF-16 / ISO-8859 / 二进制）

/// 超过该长度的行视为“很长的行”
const MAX_LINE_LEN: usize = 300;

/// 识别出的文本编码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TextEncoding {
    Ascii,
    Utf8,
    Utf8Bom,
    Utf16Le,
    Utf16Be,
    Latin1,
}

impl TextEncoding {
    pub(crate) fn description(self) -> &'static str {
        match self {
            TextEncoding::Ascii => "ASCII text",
            TextEncoding::Utf8 => "UTF-8 Unicode text",
            TextEncoding::Utf8Bom => "UTF-8 Unicode (with BOM) text",
            TextEncoding::Utf16Le => "Little-endian UTF-16 Unicode text",
            TextEncoding::Utf16Be => "Big-endian UTF-16 Unicode text",
            TextEncoding::Latin1 => "ISO-8859 text",
        }
    }

    pub(crate) fn mime_encoding(self) -> &'static str {
        match self {
            TextEncoding::Ascii => "us-ascii",
            TextEncoding::Utf8 | TextEncoding::Utf8Bom => "utf-8",
            TextEncoding::Utf16Le => "utf-16le",
            TextEncoding::Utf16Be => "utf-16be",
            TextEncoding::Latin1 => "iso-8859-1",
        }
    }
}

/// 文本判定结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TextInfo {
    pub(crate) encoding: TextEncoding,
    /// UTF-16 不统计行信息
    lines: Option<LineStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LineStats {
    crlf: usize,
    cr: usize,
    lf: usize,
    long_lines: bool,
}

impl TextInfo {
    /// 完整描述，例如 "ASCII text, with CRLF line terminators"
    pub(crate) fn describe(&self) -> String {
        let mut s = self.encoding.description().to_string();
        let Some(lines) = self.lines else { return s };
        if lines.long_lines {
            s.push_str(", with very long lines");
        }
        let mut kinds = Vec::new();
        if lines.crlf > 0 { kinds.push("CRLF"); }
        if lines.cr > 0 { kinds.push("CR"); }
        if lines.lf > 0 && !kinds.is_empty() { kinds.push("LF"); }
        if lines.crlf == 0 && lines.cr == 0 && lines.lf == 0 {
            s.push_str(", with no line terminators");
        } else if !kinds.is_empty() {
            s.push_str(&format!(", with {} line terminators", kinds.join(", ")));
        }
        s
    }
}

/// 单字节是否可出现在文本中（BEL..CR、ESC、可打印 ASCII）
fn is_text_ascii(b: u8) -> bool {
    matches!(b, 0x07..=0x0D | 0x1B | 0x20..=0x7E)
}

/// 判定缓冲区的文本编码；非文本返回 None
/// `ascii_only` 为真时只识别 ASCII（关闭编码检查）
pub(crate) fn classify(buf: &[u8], ascii_only: bool) -> Option<TextInfo> {
    if buf.is_empty() { return None; }

    let encoding = if buf.iter().all(|&b| is_text_ascii(b)) {
        TextEncoding::Ascii
    } else if ascii_only {
        return None;
    } else if let Some(enc) = utf16_with_bom(buf) {
        return Some(TextInfo { encoding: enc, lines: None });
    } else if let Some(enc) = utf8(buf) {
        enc
    } else if buf.iter().all(|&b| is_text_ascii(b) || b >= 0xA0) {
        TextEncoding::Latin1
    } else {
        return None;
    };

    Some(TextInfo { encoding, lines: Some(line_stats(buf)) })
}

fn utf8(buf: &[u8]) -> Option<TextEncoding> {
    let (body, bom) = match buf.strip_prefix(&[0xEF, 0xBB, 0xBF][..]) {
        Some(rest) => (rest, true),
        None => (buf, false),
    };
    let s = std::str::from_utf8(body).ok()?;
    if !s.chars().all(|c| !c.is_ascii() || is_text_ascii(c as u8)) {
        return None;
    }
    Some(if bom { TextEncoding::Utf8Bom } else { TextEncoding::Utf8 })
}

fn utf16_with_bom(buf: &[u8]) -> Option<TextEncoding> {
    if buf.len() < 2 || buf.len() % 2 != 0 { return None; }
    let (enc, le) = match (buf[0], buf[1]) {
        (0xFF, 0xFE) => (TextEncoding::Utf16Le, true),
        (0xFE, 0xFF) => (TextEncoding::Utf16Be, false),
        _ => return None,
    };
    let units = buf[2..].chunks_exact(2).map(|c| if le { u16::from_le_bytes([c[0], c[1]]) } else { u16::from_be_bytes([c[0], c[1]]) });
    for ch in char::decode_utf16(units) {
        let ch = ch.ok()?;
        if ch.is_ascii() && !is_text_ascii(ch as u8) { return None; }
    }
    Some(enc)
}

fn line_stats(buf: &[u8]) -> LineStats {
    let (mut crlf, mut cr, mut lf) = (0, 0, 0);
    let mut line_len = 0usize;
    let mut long_lines = false;
    let mut i = 0;
    while i < buf.len() {
        match buf[i] {
            b'\r' if buf.get(i + 1) == Some(&b'\n') => { crlf += 1; i += 1; line_len = 0; }
            b'\r' => { cr += 1; line_len = 0; }
            b'\n' => { lf += 1; line_len = 0; }
            _ => {
                line_len += 1;
                if line_len > MAX_LINE_LEN { long_lines = true; }
            }
        }
        i += 1;
    }
    LineStats { crlf, cr, lf, long_lines }
}
