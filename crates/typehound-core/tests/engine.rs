use anyhow::{bail, Result};
use regex::Regex;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use typehound_core::{
    Cookie, DatabaseConfig, DatabaseSource, Detection, HandleState, Library, Magic, MagicError, MagicFlags,
    MagicOptions, WorkerPool,
};

const CPP: &str = "#include <iostream>\n#include <vector>\n\nnamespace demo {\n\ntemplate <typename T>\nclass Stack {\npublic:\n  void push(const T& v) { items_.push_back(v); }\nprivate:\n  std::vector<T> items_;\n};\n\n}  // namespace demo\n\nint main() {\n  demo::Stack<int> s;\n  s.push(1);\n  std::cout << \"ok\" << std::endl;\n  return 0;\n}\n";

const CUSTOM_DB: &str = r#"
[database]
format = 1
name = "test"

[[rules]]
id = "thing"
description = "Thing archive"
mime = "application/x-thing"
offset = 0
string = "THNG"
"#;

fn pool(threads: usize) -> WorkerPool {
    WorkerPool::new(Some(threads)).unwrap()
}

fn magic(flags: MagicFlags) -> Magic {
    Magic::with_pool(MagicOptions::new(flags), pool(2)).unwrap()
}

fn cpp_file() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.cpp");
    std::fs::write(&path, CPP).unwrap();
    (dir, path)
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

/// 测试用底层库：记录调用顺序、并发度与 cookie 释放次数
#[derive(Default)]
struct Probe {
    seen: Mutex<Vec<String>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    started: AtomicUsize,
    closed: AtomicUsize,
}

struct MockLibrary {
    delay: Duration,
    probe: Arc<Probe>,
}

impl MockLibrary {
    fn new(delay: Duration) -> (Arc<Self>, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        (Arc::new(Self { delay, probe: Arc::clone(&probe) }), probe)
    }
}

struct MockCookie {
    flags: MagicFlags,
    database: Option<String>,
    delay: Duration,
    probe: Arc<Probe>,
}

impl Library for MockLibrary {
    fn open(&self, flags: MagicFlags) -> Result<Box<dyn Cookie>> {
        Ok(Box::new(MockCookie { flags, database: None, delay: self.delay, probe: Arc::clone(&self.probe) }))
    }
}

impl Cookie for MockCookie {
    fn load(&mut self, source: &DatabaseSource) -> Result<()> {
        let name = match source {
            DatabaseSource::Buffer(b) => String::from_utf8_lossy(b).into_owned(),
            DatabaseSource::Builtin => "builtin".to_string(),
            DatabaseSource::Path(p) if p.exists() => p.display().to_string(),
            DatabaseSource::Path(p) => bail!("no such database {}", p.display()),
        };
        self.database = Some(name);
        Ok(())
    }

    fn set_flags(&mut self, flags: MagicFlags) -> Result<()> {
        self.flags = flags;
        Ok(())
    }

    fn buffer(&mut self, data: &[u8]) -> Result<String> {
        let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(now, Ordering::SeqCst);
        self.probe.started.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.delay);
        let tag = String::from_utf8_lossy(data).into_owned();
        self.probe.seen.lock().unwrap().push(tag.clone());
        self.probe.active.fetch_sub(1, Ordering::SeqCst);
        let db = self.database.clone().unwrap_or_default();
        Ok(format!("{}|{}|{:#x}", tag, db, self.flags.bits()))
    }

    fn file(&mut self, path: &Path) -> Result<String> {
        bail!("cannot open `{}'", path.display())
    }

    fn close(&mut self) {
        self.probe.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn mock_magic(delay: Duration, threads: usize) -> (Magic, Arc<Probe>) {
    let (lib, probe) = MockLibrary::new(delay);
    let opts = MagicOptions::default().database(DatabaseConfig::new(DatabaseSource::buffer(&b"v1"[..])));
    (Magic::with_library(opts, lib, pool(threads)).unwrap(), probe)
}

#[test]
fn cpp_file_in_every_output_mode() {
    let (_dir, path) = cpp_file();
    let detect = |flags| magic(flags).detect_file(&path).wait().unwrap();

    assert_eq!(detect(MagicFlags::MIME_TYPE), Detection::Single("text/x-c++".into()));
    assert_eq!(detect(MagicFlags::MIME_ENCODING), Detection::Single("us-ascii".into()));
    assert_eq!(detect(MagicFlags::MIME), Detection::Single("text/x-c++; charset=us-ascii".into()));

    let described = detect(MagicFlags::empty());
    let re = Regex::new(r"^C\+\+ source, ASCII text").unwrap();
    assert!(re.is_match(described.first().unwrap()), "{}", described);
}

#[test]
fn continue_mode_starts_with_the_single_result() {
    let (_dir, path) = cpp_file();
    let single = magic(MagicFlags::MIME_TYPE).detect_file(&path).wait().unwrap();
    let all = magic(MagicFlags::MIME_TYPE | MagicFlags::CONTINUE).detect_file(&path).wait().unwrap();
    match &all {
        Detection::All(v) => {
            assert!(v.len() >= 2, "{:?}", v);
            assert!(v.iter().all(|s| !s.is_empty()));
        }
        other => panic!("expected all matches, got {:?}", other),
    }
    assert_eq!(all.first(), single.as_single());
}

#[test]
fn nonexistent_path_fails_only_that_request() {
    let m = magic(MagicFlags::MIME_TYPE);
    let missing = m.detect_file("/nonexistent/typehound/input.bin");
    let ok = m.detect(&b"%PDF-1.5\n"[..]);
    match missing.wait() {
        Err(MagicError::DetectFailed(reason)) => assert!(reason.contains("input.bin"), "{}", reason),
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(ok.wait().unwrap().to_string(), "application/pdf");
    assert_eq!(m.state(), HandleState::Ready);
}

#[test]
fn non_ascii_file_name() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tést-ファイル.cpp");
    std::fs::write(&path, CPP).unwrap();
    let d = magic(MagicFlags::MIME_TYPE).detect_file(&path).wait().unwrap();
    assert_eq!(d.to_string(), "text/x-c++");
}

#[test]
fn empty_buffer_is_empty() {
    let m = magic(MagicFlags::empty());
    assert_eq!(m.detect(Vec::new()).wait().unwrap().to_string(), "empty");
}

#[test]
fn requests_on_one_handle_run_in_submission_order() {
    let (m, probe) = mock_magic(Duration::from_millis(2), 4);
    let tickets: Vec<_> = (0..32).map(|i| m.detect(i.to_string().into_bytes())).collect();
    for (i, t) in tickets.into_iter().enumerate() {
        let out = t.wait().unwrap().to_string();
        assert!(out.starts_with(&format!("{}|", i)), "{}", out);
    }
    let seen = probe.seen.lock().unwrap().clone();
    assert_eq!(seen, (0..32).map(|i| i.to_string()).collect::<Vec<_>>());
    assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);
}

#[test]
fn handles_run_in_parallel_on_a_shared_pool() {
    let delay = Duration::from_millis(250);
    let shared = pool(4);
    let (lib, probe) = MockLibrary::new(delay);
    let handles: Vec<Magic> = (0..4)
        .map(|_| Magic::with_library(MagicOptions::default(), lib.clone(), shared.clone()).unwrap())
        .collect();

    let start = Instant::now();
    let tickets: Vec<_> = handles.iter().map(|m| m.detect(&b"x"[..])).collect();
    for t in tickets {
        t.wait().unwrap();
    }
    let parallel = start.elapsed();
    assert!(parallel < delay * 3, "four handles took {:?}", parallel);
    assert!(probe.max_active.load(Ordering::SeqCst) >= 2);

    // 同一句柄上的三个请求必然串行
    let start = Instant::now();
    let tickets: Vec<_> = (0..3).map(|_| handles[0].detect(&b"y"[..])).collect();
    for t in tickets {
        t.wait().unwrap();
    }
    assert!(start.elapsed() >= delay * 3);
}

#[test]
fn control_operations_never_tear_a_detection() {
    let (m, _probe) = mock_magic(Duration::from_millis(20), 2);
    let before: Vec<_> = (0..3).map(|_| m.detect(&b"a"[..])).collect();
    let set = m.set_flags(MagicFlags::MIME_TYPE);
    let reload = m.reload(DatabaseConfig::new(DatabaseSource::buffer(&b"v2"[..])));
    let after: Vec<_> = (0..3).map(|_| m.detect(&b"b"[..])).collect();

    for t in before {
        assert_eq!(t.wait().unwrap().to_string(), "a|v1|0x200");
    }
    set.wait().unwrap();
    reload.wait().unwrap();
    for t in after {
        assert_eq!(t.wait().unwrap().to_string(), "b|v2|0x210");
    }
    assert_eq!(m.flags(), MagicFlags::MIME_TYPE);
    assert_eq!(m.database(), Some(DatabaseSource::buffer(&b"v2"[..])));
}

#[test]
fn failed_reload_keeps_the_loaded_database() {
    let (m, _probe) = mock_magic(Duration::ZERO, 1);
    let bad = m.reload(DatabaseConfig::new(DatabaseSource::path("/no/such/typehound.toml")));
    assert!(matches!(bad.wait(), Err(MagicError::LoadFailed(_))));
    assert_eq!(m.detect(&b"c"[..]).wait().unwrap().to_string(), "c|v1|0x200");
}

#[test]
fn queued_request_can_be_cancelled() {
    let (m, probe) = mock_magic(Duration::from_millis(200), 2);
    let first = m.detect(&b"first"[..]);
    let second = m.detect(&b"second"[..]);
    let third = m.detect(&b"third"[..]);
    wait_until("first request to start", || probe.started.load(Ordering::SeqCst) >= 1);

    assert!(second.cancel());
    assert!(!m.cancel(second.id()));
    assert_eq!(second.wait(), Err(MagicError::Cancelled));
    assert!(first.wait().is_ok());
    assert!(third.wait().is_ok());

    let seen = probe.seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["first".to_string(), "third".to_string()]);
}

#[test]
fn advisory_timeout_returns_the_ticket() {
    let (m, _probe) = mock_magic(Duration::from_millis(300), 1);
    let t = m.detect(&b"slow"[..]);
    let t = match t.wait_timeout(Duration::from_millis(10)) {
        Err(ticket) => ticket,
        Ok(r) => panic!("finished too early: {:?}", r),
    };
    assert!(t.wait().is_ok());
}

#[test]
fn close_rejects_queued_work_and_releases_after_in_flight() {
    let (m, probe) = mock_magic(Duration::from_millis(300), 2);
    let in_flight = m.detect(&b"running"[..]);
    let queued: Vec<_> = (0..3).map(|_| m.detect(&b"queued"[..])).collect();
    wait_until("first request to start", || probe.started.load(Ordering::SeqCst) >= 1);

    m.close();
    assert!(m.is_closed());
    for t in queued {
        assert_eq!(t.wait(), Err(MagicError::HandleClosed));
    }
    assert_eq!(m.detect(&b"late"[..]).wait(), Err(MagicError::HandleClosed));
    // 正在执行的请求不受影响，cookie 在其结束后才释放
    assert_eq!(probe.closed.load(Ordering::SeqCst), 0);
    assert!(in_flight.wait().is_ok());
    wait_until("cookie release", || probe.closed.load(Ordering::SeqCst) == 1);
    assert_eq!(m.state(), HandleState::Closed);

    drop(m);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(probe.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn callback_completion_runs_once() {
    let (m, _probe) = mock_magic(Duration::ZERO, 1);
    let (tx, rx) = crossbeam_channel::unbounded();
    for i in 0..5 {
        let tx = tx.clone();
        m.detect_with(vec![b'0' + i], move |r| tx.send(r).unwrap());
    }
    drop(tx);
    let got: Vec<_> = rx.iter().map(|r| r.unwrap().to_string()).collect();
    assert_eq!(got, vec!["0|v1|0x200", "1|v1|0x200", "2|v1|0x200", "3|v1|0x200", "4|v1|0x200"]);
}

#[test]
fn fallback_database_is_used_after_primary_failure() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("custom.toml");
    std::fs::write(&db, CUSTOM_DB).unwrap();

    let cfg = DatabaseConfig::new(DatabaseSource::path(dir.path().join("missing.toml"))).with_fallback(DatabaseSource::path(&db));
    let m = Magic::with_pool(MagicOptions::new(MagicFlags::MIME_TYPE).database(cfg), pool(1)).unwrap();
    assert_eq!(m.database(), Some(DatabaseSource::path(&db)));
    assert_eq!(m.detect(&b"THNG\0\x01\x02"[..]).wait().unwrap().to_string(), "application/x-thing");

    let cfg = DatabaseConfig::new(DatabaseSource::path(dir.path().join("missing.toml")))
        .with_fallback(DatabaseSource::path(dir.path().join("also-missing.toml")));
    match Magic::with_pool(MagicOptions::default().database(cfg), pool(1)) {
        Err(MagicError::LoadFailed(reason)) => {
            assert!(reason.contains("missing.toml"), "{}", reason);
            assert!(reason.contains("also-missing.toml"), "{}", reason);
        }
        Err(other) => panic!("unexpected error: {:?}", other),
        Ok(_) => panic!("load should fail"),
    }
}

#[test]
fn database_from_memory_buffer() {
    let cfg = DatabaseConfig::new(DatabaseSource::buffer(CUSTOM_DB.as_bytes()));
    let m = Magic::with_pool(MagicOptions::new(MagicFlags::empty()).database(cfg), pool(1)).unwrap();
    assert_eq!(m.detect(&b"THNG\0"[..]).wait().unwrap().to_string(), "Thing archive");
}

#[test]
fn panicking_callback_does_not_stall_the_handle() {
    let (m, _probe) = mock_magic(Duration::ZERO, 1);
    m.detect_with(&b"first"[..], |_| panic!("callback failure"));
    let next = m.detect(&b"second"[..]);
    match next.wait_timeout(Duration::from_secs(5)) {
        Ok(r) => assert_eq!(r.unwrap().to_string(), "second|v1|0x200"),
        Err(_) => panic!("request after a panicking callback never completed"),
    }
    assert_eq!(m.queued(), 0);
}

#[test]
fn busy_handle_does_not_starve_others_on_one_thread() {
    let delay = Duration::from_millis(10);
    let shared = pool(1);
    let (lib, _probe) = MockLibrary::new(delay);
    let busy = Magic::with_library(MagicOptions::default(), lib.clone(), shared.clone()).unwrap();
    let other = Magic::with_library(MagicOptions::default(), lib, shared).unwrap();

    let backlog: Vec<_> = (0..100).map(|_| busy.detect(&b"busy"[..])).collect();
    let start = Instant::now();
    other.detect(&b"other"[..]).wait().unwrap();
    let waited = start.elapsed();
    // 100 条 backlog 串行需要约 1 秒；轮转调度下只需等待一两条
    assert!(waited < delay * 30, "other handle waited {:?}", waited);
    assert!(busy.queued() > 0);

    for t in backlog {
        t.wait().unwrap();
    }
}

#[test]
fn continue_first_match_is_escaped_like_the_single_result() {
    let db = r#"
[database]
format = 1

[[rules]]
id = "tab"
description = "Tab\tsep data"
string = "TABS"
"#;
    let open = |flags| {
        let cfg = DatabaseConfig::new(DatabaseSource::buffer(db.as_bytes()));
        Magic::with_pool(MagicOptions::new(flags).database(cfg), pool(1)).unwrap()
    };
    let input = &b"TABS\0\x01"[..];
    for extra in [MagicFlags::empty(), MagicFlags::RAW] {
        let single = open(extra).detect(input).wait().unwrap();
        let all = open(extra | MagicFlags::CONTINUE).detect(input).wait().unwrap();
        assert_eq!(all.first(), single.as_single(), "flags {:?}", extra);
    }
    let single = open(MagicFlags::empty()).detect(input).wait().unwrap();
    assert_eq!(single.to_string(), "Tab\\011sep data");
}

#[test]
fn tickets_can_be_polled_and_selected() {
    let (m, _probe) = mock_magic(Duration::from_millis(200), 1);
    let slow = m.detect(&b"slow"[..]);
    let slow = match slow.try_wait() {
        Err(ticket) => ticket,
        Ok(r) => panic!("finished too early: {:?}", r),
    };
    let quick = magic(MagicFlags::MIME_TYPE).detect(&b"%PDF-1.4\n"[..]);

    let mut done = Vec::new();
    for _ in 0..2 {
        crossbeam_channel::select! {
            recv(slow.receiver()) -> r => done.push(r.unwrap().unwrap().to_string()),
            recv(quick.receiver()) -> r => done.push(r.unwrap().unwrap().to_string()),
        }
    }
    assert_eq!(done, vec!["application/pdf".to_string(), "slow|v1|0x200".to_string()]);
}
