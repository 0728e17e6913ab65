//! 串行化队列与后台线程池
//!
//! 设计要点：
//! - 每个句柄一条 lane：FIFO 队列 + “是否已排入就绪队列”标记。
//! - 线程池维护一个先进先出的就绪队列；lane 有待执行请求时排入就绪队列，
//!   每个池任务取出一个 lane 执行一条请求，若该 lane 仍有请求则重新排到队尾。
//!   同一 lane 任意时刻至多在就绪队列中出现一次，因此 cookie 不会被并发访问；
//!   不同 lane 轮流占用线程，繁忙的句柄不会饿死其他句柄。
//! - 选项修改与重新加载也走同一队列，不会与检测交错。
//! - 结果经 crossbeam 单次通道（或回调）送回调用方，调用方从不阻塞在底层调用上。
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::error::MagicError;
use crate::flags::MagicFlags;
use crate::format::{format_result, Detection};
use crate::handle::{HandleState, Input, ResourceHandle};
use crate::options::{DatabaseConfig, DatabaseSource};

/// 锁中毒时继续使用内部数据（底层库与回调的 panic 均已在执行处捕获）
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// 后台线程池（可在多个句柄间共享）
#[derive(Clone)]
pub struct WorkerPool {
    pool: Arc<rayon::ThreadPool>,
    threads: usize,
    ready_tx: Sender<Arc<Lane>>,
    ready_rx: Receiver<Arc<Lane>>,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool").field("threads", &self.threads).finish()
    }
}

impl WorkerPool {
    /// 线程数：None 表示自动（等于 CPU 核数）
    pub fn new(threads: Option<usize>) -> Result<Self, MagicError> {
        let threads = threads.unwrap_or_else(num_cpus::get).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("typehound-worker-{}", i))
            .panic_handler(|_| error!("worker task panicked"))
            .build()
            .map_err(|e| MagicError::OpenFailed(format!("cannot build worker pool: {}", e)))?;
        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        Ok(Self { pool: Arc::new(pool), threads, ready_tx, ready_rx })
    }

    /// 进程内共享的默认线程池（首次使用时创建）
    pub fn shared() -> Result<Self, MagicError> {
        static SHARED: OnceLock<Result<WorkerPool, MagicError>> = OnceLock::new();
        SHARED.get_or_init(|| WorkerPool::new(None)).clone()
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// 把 lane 排到就绪队列末尾，并投递一个池任务
    /// 池任务只负责“取队首 lane 执行一条”，执行顺序由就绪队列决定
    fn schedule(&self, lane: Arc<Lane>) {
        // 接收端由线程池自身持有，发送不会失败
        let _ = self.ready_tx.send(lane);
        let ready = self.ready_rx.clone();
        self.pool.spawn(move || {
            if let Ok(lane) = ready.try_recv() {
                lane.step();
            }
        });
    }
}

/// 请求编号（同一句柄内单调递增）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 完成回调
pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T, MagicError>) + Send>;

enum Sink<T> {
    Channel(Sender<Result<T, MagicError>>),
    Callback(Callback<T>),
}

/// 单次完成槽：恰好交付一次；未交付即被丢弃时交付 HandleClosed
pub(crate) struct Completion<T> {
    sink: Option<Sink<T>>,
}

impl<T> Completion<T> {
    fn channel() -> (Self, Receiver<Result<T, MagicError>>) {
        let (tx, rx) = bounded(1);
        (Self { sink: Some(Sink::Channel(tx)) }, rx)
    }

    pub(crate) fn callback(f: Callback<T>) -> Self {
        Self { sink: Some(Sink::Callback(f)) }
    }

    fn fulfil(mut self, result: Result<T, MagicError>) {
        if let Some(sink) = self.sink.take() {
            deliver(sink, result);
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            deliver(sink, Err(MagicError::HandleClosed));
        }
    }
}

fn deliver<T>(sink: Sink<T>, result: Result<T, MagicError>) {
    match sink {
        // 调用方可能已丢弃 Pending，忽略发送失败
        Sink::Channel(tx) => { let _ = tx.send(result); }
        Sink::Callback(f) => f(result),
    }
}

/// 队列中的一项工作
pub(crate) enum Work {
    Detect { input: Input, done: Completion<Detection> },
    SetFlags { flags: MagicFlags, done: Completion<()> },
    Reload { config: DatabaseConfig, done: Completion<()> },
}

impl Work {
    fn kind(&self) -> &'static str {
        match self {
            Work::Detect { input: Input::Buffer(_), .. } => "detect",
            Work::Detect { input: Input::Path(_), .. } => "detect_file",
            Work::SetFlags { .. } => "set_flags",
            Work::Reload { .. } => "reload",
        }
    }

    fn reject(self, err: MagicError) {
        match self {
            Work::Detect { done, .. } => done.fulfil(Err(err)),
            Work::SetFlags { done, .. } | Work::Reload { done, .. } => done.fulfil(Err(err)),
        }
    }

    /// 在句柄上执行；结果在释放句柄锁之后再交付
    fn run(self, handle: &mut ResourceHandle) -> Delivery {
        match self {
            Work::Detect { input, done } => {
                let out = handle.detect(&input).map(|(raw, flags)| format_result(&raw, flags));
                Delivery::Detect(done, out)
            }
            Work::SetFlags { flags, done } => Delivery::Unit(done, handle.set_flags(flags)),
            Work::Reload { config, done } => Delivery::Unit(done, handle.reload(&config)),
        }
    }
}

enum Delivery {
    Detect(Completion<Detection>, Result<Detection, MagicError>),
    Unit(Completion<()>, Result<(), MagicError>),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Detect(done, r) => done.fulfil(r),
            Delivery::Unit(done, r) => done.fulfil(r),
        }
    }
}

struct Job {
    id: RequestId,
    work: Work,
}

#[derive(Default)]
struct LaneQueue {
    jobs: VecDeque<Job>,
    /// 已排入就绪队列或正在执行
    scheduled: bool,
    closed: bool,
    next_id: u64,
}

/// 句柄状态快照（读取时不需要等待正在执行的检测）
#[derive(Debug, Clone)]
pub(crate) struct Status {
    pub(crate) flags: MagicFlags,
    pub(crate) database: Option<DatabaseSource>,
    pub(crate) state: HandleState,
}

impl Status {
    fn of(handle: &ResourceHandle) -> Self {
        Self { flags: handle.flags(), database: handle.database().cloned(), state: handle.state() }
    }
}

/// 一个句柄的串行化通道
pub(crate) struct Lane {
    queue: Mutex<LaneQueue>,
    handle: Mutex<ResourceHandle>,
    status: Mutex<Status>,
    pool: WorkerPool,
}

impl Lane {
    pub(crate) fn new(handle: ResourceHandle, pool: WorkerPool) -> Arc<Self> {
        let status = Status::of(&handle);
        Arc::new(Self {
            queue: Mutex::new(LaneQueue::default()),
            handle: Mutex::new(handle),
            status: Mutex::new(status),
            pool,
        })
    }

    /// 入队；已关闭时立即以 HandleClosed 完成
    pub(crate) fn submit(self: &Arc<Self>, work: Work) -> RequestId {
        let mut q = lock(&self.queue);
        let id = RequestId(q.next_id);
        q.next_id += 1;
        if q.closed {
            drop(q);
            debug!(request = %id, kind = work.kind(), "rejected, handle closed");
            work.reject(MagicError::HandleClosed);
            return id;
        }
        q.jobs.push_back(Job { id, work });
        let schedule = !q.scheduled;
        q.scheduled = true;
        drop(q);

        if schedule {
            self.pool.schedule(Arc::clone(self));
        }
        id
    }

    /// 执行队首的一条请求；仍有请求则重新排到就绪队列末尾
    fn step(self: Arc<Self>) {
        let job = lock(&self.queue).jobs.pop_front();
        if let Some(job) = job {
            self.execute(job);
        }

        let next = {
            let mut q = lock(&self.queue);
            if q.jobs.is_empty() {
                q.scheduled = false;
                Some(q.closed)
            } else {
                None
            }
        };
        match next {
            None => self.pool.schedule(Arc::clone(&self)),
            Some(true) => self.release(),
            Some(false) => {}
        }
    }

    fn execute(&self, job: Job) {
        let Job { id, work } = job;
        debug!(request = %id, kind = work.kind(), "request started");
        let detecting = matches!(work, Work::Detect { .. });
        // 回调由调用方提供；它的 panic 只记录，不能让 lane 停在“已排入”状态
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let delivery = {
                let mut handle = lock(&self.handle);
                if detecting {
                    lock(&self.status).state = HandleState::Detecting;
                }
                let delivery = work.run(&mut handle);
                *lock(&self.status) = Status::of(&handle);
                delivery
            };
            delivery.deliver();
        }));
        match outcome {
            Ok(()) => debug!(request = %id, "request finished"),
            Err(_) => error!(request = %id, "request panicked while completing"),
        }
    }

    /// 撤回仍在排队的请求
    pub(crate) fn cancel(&self, id: RequestId) -> bool {
        let job = {
            let mut q = lock(&self.queue);
            let pos = q.jobs.iter().position(|j| j.id == id);
            pos.and_then(|p| q.jobs.remove(p))
        };
        match job {
            Some(job) => {
                debug!(request = %id, "request cancelled");
                job.work.reject(MagicError::Cancelled);
                true
            }
            None => false,
        }
    }

    /// 关闭：拒绝排队中的请求；正在执行的请求完成后再释放 cookie
    pub(crate) fn close(&self) {
        let (jobs, release_now) = {
            let mut q = lock(&self.queue);
            if q.closed { return; }
            q.closed = true;
            (std::mem::take(&mut q.jobs), !q.scheduled)
        };
        let rejected = jobs.len();
        for job in jobs {
            job.work.reject(MagicError::HandleClosed);
        }
        if release_now {
            self.release();
        }
        info!(rejected, "magic handle closed");
    }

    fn release(&self) {
        let mut handle = lock(&self.handle);
        handle.close();
        *lock(&self.status) = Status::of(&handle);
    }

    pub(crate) fn is_closed(&self) -> bool {
        lock(&self.queue).closed
    }

    pub(crate) fn queued(&self) -> usize {
        lock(&self.queue).jobs.len()
    }

    pub(crate) fn status(&self) -> Status {
        lock(&self.status).clone()
    }
}

/// 提交后返回的完成凭据
pub struct Pending<T> {
    id: RequestId,
    rx: Receiver<Result<T, MagicError>>,
    lane: Weak<Lane>,
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending").field("id", &self.id).finish()
    }
}

impl<T> Pending<T> {
    /// 通过通道提交一项工作
    pub(crate) fn submit(lane: &Arc<Lane>, make: impl FnOnce(Completion<T>) -> Work) -> Self {
        let (done, rx) = Completion::channel();
        let id = lane.submit(make(done));
        Self { id, rx, lane: Arc::downgrade(lane) }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// 等待结果
    pub fn wait(self) -> Result<T, MagicError> {
        self.rx.recv().unwrap_or(Err(MagicError::HandleClosed))
    }

    /// 限时等待；超时则交还凭据，请求仍在队列或执行中
    pub fn wait_timeout(self, timeout: Duration) -> Result<Result<T, MagicError>, Self> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => Ok(r),
            Err(RecvTimeoutError::Timeout) => Err(self),
            Err(RecvTimeoutError::Disconnected) => Ok(Err(MagicError::HandleClosed)),
        }
    }

    /// 非阻塞查询；尚未完成则交还凭据
    pub fn try_wait(self) -> Result<Result<T, MagicError>, Self> {
        match self.rx.try_recv() {
            Ok(r) => Ok(r),
            Err(TryRecvError::Empty) => Err(self),
            Err(TryRecvError::Disconnected) => Ok(Err(MagicError::HandleClosed)),
        }
    }

    /// 撤回尚未开始执行的请求；成功后 `wait` 返回 Cancelled
    pub fn cancel(&self) -> bool {
        self.lane.upgrade().map(|lane| lane.cancel(self.id)).unwrap_or(false)
    }

    /// 底层接收端，可配合 `crossbeam_channel::select!` 同时等待多个请求
    pub fn receiver(&self) -> &Receiver<Result<T, MagicError>> {
        &self.rx
    }
}
