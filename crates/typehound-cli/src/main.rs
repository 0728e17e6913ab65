use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use tracing::{info, warn};
use typehound_core::{
    DatabaseConfig, DatabaseSource, Detection, Magic, MagicError, MagicFlags, MagicOptions, Pending, UnknownFlag,
    WorkerPool,
};
use walkdir::WalkDir;

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "typehound", version, about = "按内容检测文件类型")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 检测文件（或标准输入）的内容类型
    Detect {
        /// 待检测路径；"-" 表示从标准输入读取
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// 输出 MIME 类型
        #[arg(long)]
        mime_type: bool,

        /// 输出 MIME 编码
        #[arg(long)]
        mime_encoding: bool,

        /// 输出 "类型; charset=编码"
        #[arg(long, short = 'i')]
        mime: bool,

        /// 输出全部命中（continue 模式）
        #[arg(long, short = 'k')]
        all: bool,

        /// 跟随符号链接
        #[arg(long, short = 'L')]
        follow_symlinks: bool,

        /// 不转义不可打印字符
        #[arg(long, short = 'r')]
        raw: bool,

        /// 输出 Apple creator/type
        #[arg(long)]
        apple: bool,

        /// 读取后恢复访问时间
        #[arg(long)]
        preserve_atime: bool,

        /// 把块/字符设备当作普通文件读取
        #[arg(long, short = 's')]
        devices: bool,

        /// 额外选项名，逗号分隔（例如 "no-check-tar,no-check-cdf"）
        #[arg(long, value_parser = parse_flags)]
        flags: Option<MagicFlags>,

        /// 特征库路径（TOML），默认使用内置特征库
        #[arg(long)]
        database: Option<PathBuf>,

        /// 主库加载失败时使用的备用特征库；"builtin" 表示内置特征库
        #[arg(long)]
        fallback: Option<PathBuf>,

        /// 线程数（每个线程一个检测句柄；"auto"=CPU 核心数）
        #[arg(long, default_value = "auto")]
        threads: String,

        /// 以 JSON 数组输出
        #[arg(long)]
        json: bool,

        /// 递归检测目录下的所有文件
        #[arg(long, short = 'R')]
        recursive: bool,
    },
}

/// JSON 输出条目
#[derive(Serialize)]
struct OutputItem<'a> {
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a Detection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Detect {
            paths,
            mime_type,
            mime_encoding,
            mime,
            all,
            follow_symlinks,
            raw,
            apple,
            preserve_atime,
            devices,
            flags,
            database,
            fallback,
            threads,
            json,
            recursive,
        } => {
            let mut f = flags.unwrap_or_default();
            let toggles = [
                (mime_type, MagicFlags::MIME_TYPE),
                (mime_encoding, MagicFlags::MIME_ENCODING),
                (mime, MagicFlags::MIME),
                (all, MagicFlags::CONTINUE),
                (follow_symlinks, MagicFlags::SYMLINK),
                (raw, MagicFlags::RAW),
                (apple, MagicFlags::APPLE),
                (preserve_atime, MagicFlags::PRESERVE_ATIME),
                (devices, MagicFlags::DEVICES),
            ];
            for (on, bit) in toggles {
                if on { f |= bit; }
            }

            let options = MagicOptions::new(f).database(database_config(database, fallback));
            // 解析线程参数："auto" 表示自动（等于 CPU 核数）；其他为具体数值
            let threads_opt = parse_threads(&threads);
            let pool = WorkerPool::new(threads_opt).context("build worker pool")?;
            let handles = (0..pool.threads())
                .map(|_| Magic::with_pool(options.clone(), pool.clone()))
                .collect::<Result<Vec<_>, MagicError>>()
                .context("open magic handle")?;
            info!(flags = ?f, handles = handles.len(), "starting detection");

            let targets = collect_targets(&paths, recursive);
            // 轮流分配到各句柄：同一句柄内串行，句柄之间并行
            let mut tickets = Vec::with_capacity(targets.len());
            for (i, target) in targets.into_iter().enumerate() {
                let magic = &handles[i % handles.len()];
                let ticket = match &target {
                    Target::Stdin => read_stdin().map(|buf| magic.detect(buf)),
                    Target::File(p) => Ok(magic.detect_file(p)),
                    Target::Unreadable { reason, .. } => Err(anyhow::anyhow!("{}", reason)),
                };
                tickets.push((target.label(), ticket));
            }

            let stdout = io::stdout();
            let mut out = BufWriter::new(stdout.lock());
            let failed = write_results(&mut out, tickets, json).context("write results")?;
            out.flush().ok();

            info!(failed, "detection finished");
        }
    }

    Ok(())
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    // 日志写到 stderr，stdout 只保留检测结果
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// 解析线程参数
fn parse_threads(s: &str) -> Option<usize> {
    if s.eq_ignore_ascii_case("auto") { return None; }
    match s.parse::<usize>() {
        Ok(n) if n >= 1 => Some(n),
        _ => None,
    }
}

fn parse_flags(s: &str) -> Result<MagicFlags, UnknownFlag> {
    s.parse()
}

fn database_config(database: Option<PathBuf>, fallback: Option<PathBuf>) -> DatabaseConfig {
    let source = |p: PathBuf| {
        if p.as_os_str() == "builtin" { DatabaseSource::Builtin } else { DatabaseSource::Path(p) }
    };
    let mut cfg = DatabaseConfig::new(database.map(source).unwrap_or(DatabaseSource::Builtin));
    if let Some(fb) = fallback {
        cfg = cfg.with_fallback(source(fb));
    }
    cfg
}

enum Target {
    Stdin,
    File(PathBuf),
    Unreadable { path: String, reason: String },
}

impl Target {
    fn label(&self) -> String {
        match self {
            Target::Stdin => "/dev/stdin".to_string(),
            Target::File(p) => p.display().to_string(),
            Target::Unreadable { path, .. } => path.clone(),
        }
    }
}

/// 展开命令行路径；递归模式下目录展开为其中的文件（按文件名排序，保证输出稳定）
fn collect_targets(paths: &[PathBuf], recursive: bool) -> Vec<Target> {
    let mut out = Vec::new();
    for p in paths {
        if p.as_os_str() == "-" {
            out.push(Target::Stdin);
            continue;
        }
        if !(recursive && p.is_dir()) {
            out.push(Target::File(p.clone()));
            continue;
        }
        for entry in WalkDir::new(p).follow_links(false).sort_by_file_name() {
            match entry {
                Ok(e) if e.file_type().is_dir() => {}
                Ok(e) => out.push(Target::File(e.into_path())),
                Err(err) => {
                    let at = err.path().unwrap_or(p.as_path()).display().to_string();
                    warn!(path = %at, error = %err, "unreadable directory entry");
                    out.push(Target::Unreadable { path: at, reason: err.to_string() });
                }
            }
        }
    }
    out
}

fn read_stdin() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    io::stdin().lock().read_to_end(&mut buf).context("read stdin")?;
    Ok(buf)
}

/// 按提交顺序等待并输出结果；返回失败条数
fn write_results(
    out: &mut dyn Write,
    tickets: Vec<(String, Result<Pending<Detection>>)>,
    json: bool,
) -> Result<usize> {
    let mut failed = 0usize;
    let mut first = true;
    if json { write!(out, "[")?; }
    for (label, ticket) in tickets {
        let outcome = ticket.and_then(|t| t.wait().map_err(anyhow::Error::from));
        if outcome.is_err() { failed += 1; }
        if json {
            if !first { write!(out, ",")?; } else { first = false; }
            let item = match &outcome {
                Ok(d) => OutputItem { path: &label, result: Some(d), error: None },
                Err(e) => OutputItem { path: &label, result: None, error: Some(format!("{:#}", e)) },
            };
            serde_json::to_writer(&mut *out, &item)?;
        } else {
            match &outcome {
                Ok(d) => writeln!(out, "{}: {}", label, d)?,
                Err(e) => writeln!(out, "{}: ERROR: {:#}", label, e)?,
            }
        }
    }
    if json { writeln!(out, "]")?; }
    Ok(failed)
}
