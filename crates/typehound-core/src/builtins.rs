//! 内置结构化检查：tar、ELF、CDF（复合文档）
use crate::flags::MagicFlags;

/// 内置检查的命中
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BuiltinMatch {
    pub(crate) description: String,
    pub(crate) mime: &'static str,
}

/// 依次执行未被禁用的内置检查
pub(crate) fn check(buf: &[u8], flags: MagicFlags) -> Vec<BuiltinMatch> {
    let mut out = Vec::new();
    if !flags.contains(MagicFlags::NO_CHECK_ELF) {
        out.extend(elf(buf));
    }
    if !flags.contains(MagicFlags::NO_CHECK_CDF) {
        out.extend(cdf(buf));
    }
    if !flags.contains(MagicFlags::NO_CHECK_TAR) {
        out.extend(tar(buf));
    }
    out
}

/// POSIX/GNU tar：偏移 257 处的 "ustar"
fn tar(buf: &[u8]) -> Option<BuiltinMatch> {
    let magic = buf.get(257..265)?;
    let description = if magic == b"ustar  \0" {
        "POSIX tar archive (GNU)"
    } else if &magic[..5] == b"ustar" {
        "POSIX tar archive"
    } else {
        return None;
    };
    Some(BuiltinMatch { description: description.to_string(), mime: "application/x-tar" })
}

/// OLE2 复合文档
fn cdf(buf: &[u8]) -> Option<BuiltinMatch> {
    const SIG: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
    if buf.len() < 32 || buf[..8] != SIG { return None; }
    let major = u16::from_le_bytes([buf[26], buf[27]]);
    Some(BuiltinMatch {
        description: format!("Composite Document File V{} Document", major),
        mime: "application/CDFV2",
    })
}

/// ELF 头解析：位宽、字节序、类型、架构
fn elf(buf: &[u8]) -> Option<BuiltinMatch> {
    if buf.len() < 20 || &buf[..4] != b"\x7fELF" { return None; }
    let class = match buf[4] { 1 => "32-bit", 2 => "64-bit", _ => return None };
    let little = match buf[5] { 1 => true, 2 => false, _ => return None };
    let rd16 = |at: usize| {
        let b = [buf[at], buf[at + 1]];
        if little { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) }
    };
    let (kind, mime) = match rd16(16) {
        1 => ("relocatable", "application/x-object"),
        2 => ("executable", "application/x-executable"),
        3 => ("shared object", "application/x-sharedlib"),
        4 => ("core file", "application/x-coredump"),
        _ => ("unknown type", "application/octet-stream"),
    };
    let machine = match rd16(18) {
        0x03 => "Intel 80386",
        0x08 => "MIPS",
        0x14 => "PowerPC",
        0x15 => "64-bit PowerPC",
        0x28 => "ARM",
        0x3E => "x86-64",
        0xB7 => "ARM aarch64",
        0xF3 => "UCB RISC-V",
        _ => "unknown arch",
    };
    let osabi = match buf[7] { 0 => "SYSV", 3 => "GNU/Linux", 9 => "FreeBSD", _ => "unknown ABI" };
    Some(BuiltinMatch {
        description: format!(
            "ELF {} {} {}, {}, version {} ({})",
            class,
            if little { "LSB" } else { "MSB" },
            kind,
            machine,
            buf[6],
            osabi
        ),
        mime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elf_header() -> Vec<u8> {
        let mut h = vec![0u8; 64];
        h[..4].copy_from_slice(b"\x7fELF");
        h[4] = 2; // 64-bit
        h[5] = 1; // LSB
        h[6] = 1;
        h[16] = 2; // ET_EXEC
        h[18] = 0x3E;
        h
    }

    #[test]
    fn elf_details() {
        let m = check(&elf_header(), MagicFlags::empty());
        assert_eq!(m[0].description, "ELF 64-bit LSB executable, x86-64, version 1 (SYSV)");
        assert_eq!(m[0].mime, "application/x-executable");
        assert!(check(&elf_header(), MagicFlags::NO_CHECK_ELF).is_empty());
    }

    #[test]
    fn tar_at_offset_257() {
        let mut buf = vec![0u8; 512];
        buf[257..265].copy_from_slice(b"ustar\x0000");
        assert_eq!(check(&buf, MagicFlags::empty())[0].description, "POSIX tar archive");
        buf[257..265].copy_from_slice(b"ustar  \0");
        assert_eq!(check(&buf, MagicFlags::empty())[0].description, "POSIX tar archive (GNU)");
        assert!(check(&buf, MagicFlags::NO_CHECK_TAR).is_empty());
    }

    #[test]
    fn cdf_signature() {
        let mut buf = vec![0u8; 64];
        buf[..8].copy_from_slice(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1]);
        buf[26] = 3;
        assert_eq!(check(&buf, MagicFlags::empty())[0].mime, "application/CDFV2");
        assert!(check(&buf, MagicFlags::NO_CHECK_CDF).is_empty());
    }
}
