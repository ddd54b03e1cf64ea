use super::{
    errors::{ControlError, Result},
    handle::{Completer, Promise},
    model::PoolMetrics,
};
use crossbeam::{
    deque::{Injector, Steal},
    utils::Backoff,
};
use parking_lot::{Condvar, Mutex};
use serde::Deserialize;
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub type Pool = Arc<WorkerPool>;

/// Имя пула, который используется, если цель не объявила свой.
pub const DEFAULT_POOL: &str = "default";

/// Что делать с задачей, когда очередь заполнена и воркеров уже `max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    #[default]
    Abort,
    CallerRuns,
    Discard,
    DiscardOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueKind {
    #[default]
    Unbounded,
    Bounded(usize),
}

/// Создаёт потоки воркеров: имя, размер стека и т.п.
pub trait ThreadFactory: Send + Sync {
    fn new_thread(&self, pool: &str, index: usize) -> thread::Builder;
}

#[derive(Debug, Clone, Default)]
pub struct NamedThreads {
    pub stack_size: Option<usize>,
}

impl ThreadFactory for NamedThreads {
    fn new_thread(&self, pool: &str, index: usize) -> thread::Builder {
        let builder = thread::Builder::new().name(format!("{pool}-worker-{index}"));
        match self.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}

/// Конфигурация пула потоков
#[derive(Clone)]
pub struct PoolSpec {
    pub name: String,
    pub core_size: usize,
    pub max_size: usize,
    pub keep_alive: Duration,
    pub queue: QueueKind,
    pub rejection: RejectionPolicy,
    pub thread_factory: Arc<dyn ThreadFactory>,
    /// Сколько ждать завершения воркеров при остановке реестра; при нуле не ждать.
    pub shutdown_grace: Duration,
}

impl fmt::Debug for PoolSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSpec")
            .field("name", &self.name)
            .field("core_size", &self.core_size)
            .field("max_size", &self.max_size)
            .field("keep_alive", &self.keep_alive)
            .field("queue", &self.queue)
            .field("rejection", &self.rejection)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

impl PoolSpec {
    /// Спецификация по умолчанию: core=3, max=10, неограниченная очередь, Abort.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            core_size: 3,
            max_size: 10,
            keep_alive: Duration::ZERO,
            queue: QueueKind::Unbounded,
            rejection: RejectionPolicy::Abort,
            thread_factory: Arc::new(NamedThreads::default()),
            shutdown_grace: Duration::ZERO,
        }
    }

    pub fn builder(name: impl Into<String>) -> PoolSpecBuilder {
        PoolSpecBuilder {
            spec: Self::named(name),
        }
    }

    pub fn cpu_bound(name: impl Into<String>) -> Self {
        let num_cpus = num_cpus::get();
        Self {
            core_size: num_cpus,
            max_size: num_cpus,
            ..Self::named(name)
        }
    }

    pub fn io_bound(name: impl Into<String>) -> Self {
        let num_cpus = num_cpus::get();
        Self {
            core_size: num_cpus,
            max_size: num_cpus * 2, // Для I/O-bound задач
            keep_alive: Duration::from_secs(30),
            queue: QueueKind::Bounded(num_cpus * 20),
            ..Self::named(name)
        }
    }
}

pub struct PoolSpecBuilder {
    spec: PoolSpec,
}

impl PoolSpecBuilder {
    pub fn with_core(mut self, core: usize) -> Self {
        self.spec.core_size = core;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.spec.max_size = max;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.spec.keep_alive = keep_alive;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.spec.shutdown_grace = grace;
        self
    }

    pub fn with_work_queue(mut self, queue: QueueKind) -> Self {
        self.spec.queue = queue;
        self
    }

    pub fn with_thread_factory(mut self, factory: impl ThreadFactory + 'static) -> Self {
        self.spec.thread_factory = Arc::new(factory);
        self
    }

    pub fn with_rejection(mut self, rejection: RejectionPolicy) -> Self {
        self.spec.rejection = rejection;
        self
    }

    pub fn build(self) -> Result<PoolSpec> {
        let spec = self.spec;
        if spec.name.is_empty() {
            return Err(ControlError::Config("pool name must not be empty".into()));
        }
        if spec.max_size == 0 || spec.max_size < spec.core_size {
            return Err(ControlError::Config(format!(
                "pool `{}`: max size {} must be positive and not below core size {}",
                spec.name, spec.max_size, spec.core_size
            )));
        }
        if spec.queue == QueueKind::Bounded(0) {
            return Err(ControlError::Config(format!(
                "pool `{}`: bounded queue needs a positive capacity",
                spec.name
            )));
        }
        Ok(spec)
    }
}

/// Завершает промис ошибкой, если задача так и не была выполнена
/// (отброшена политикой или очередь сброшена при остановке).
pub(crate) struct SettleOnDrop<T> {
    completer: Completer<T>,
    pool: String,
}

impl<T> SettleOnDrop<T> {
    pub(crate) fn new(completer: Completer<T>, pool: &str) -> Self {
        Self {
            completer,
            pool: pool.to_owned(),
        }
    }

    #[inline]
    pub(crate) fn completer(&self) -> &Completer<T> {
        &self.completer
    }
}

impl<T> Drop for SettleOnDrop<T> {
    fn drop(&mut self) {
        self.completer.fail(ControlError::Rejected {
            pool: self.pool.clone(),
            reason: "task was dropped before it ran".into(),
        });
    }
}

pub(crate) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in pooled task".to_owned()
    }
}

struct Workers {
    live: usize,
    largest: usize,
    next_index: usize,
}

impl Workers {
    fn admit(&mut self) -> usize {
        self.live += 1;
        self.largest = self.largest.max(self.live);
        self.next_index += 1;
        self.next_index
    }
}

/// Пул потоков с ядром, расширением до максимума и очередью задач.
///
/// Воркеры создаются лениво: до `core_size` на каждую новую задачу, дальше
/// задачи встают в очередь, а при заполненной ограниченной очереди пул
/// растёт до `max_size`. Лишние воркеры уходят после `keep_alive` простоя.
pub struct WorkerPool {
    spec: PoolSpec,
    inject: Injector<Job>,
    sleep: Mutex<()>,
    wakeup: Condvar,
    workers: Mutex<Workers>,
    terminated: Condvar,
    shutdown_token: CancellationToken,
    active_tasks: AtomicUsize,
    idle_workers: AtomicUsize,
    queued_tasks: AtomicUsize,
    total_submitted: AtomicUsize,
    completed_tasks: AtomicUsize,
    failed_tasks: AtomicUsize,
    rejected_tasks: AtomicUsize,
}

impl WorkerPool {
    pub fn new(spec: PoolSpec) -> Self {
        Self {
            spec,
            inject: Injector::new(),
            sleep: Mutex::new(()),
            wakeup: Condvar::new(),
            workers: Mutex::new(Workers {
                live: 0,
                largest: 0,
                next_index: 0,
            }),
            terminated: Condvar::new(),
            shutdown_token: CancellationToken::new(),
            active_tasks: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            queued_tasks: AtomicUsize::new(0),
            total_submitted: AtomicUsize::new(0),
            completed_tasks: AtomicUsize::new(0),
            failed_tasks: AtomicUsize::new(0),
            rejected_tasks: AtomicUsize::new(0),
        }
    }

    /// Создаёт отдельный пул вне реестра.
    ///
    /// Воркеры держат пул через `Arc`, поэтому удаление последней внешней
    /// ссылки не останавливает ядро: такой пул нужно завершать через
    /// [`WorkerPool::shutdown`] или [`WorkerPool::shutdown_now`]. Пулы реестра
    /// останавливает сам реестр при удалении.
    pub fn with_spec(spec: PoolSpec) -> Pool {
        Arc::new(Self::new(spec))
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[inline]
    pub fn spec(&self) -> &PoolSpec {
        &self.spec
    }

    #[inline]
    pub fn core_size(&self) -> usize {
        self.spec.core_size
    }

    #[inline]
    pub fn max_size(&self) -> usize {
        self.spec.max_size
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn execute(self: &Arc<Self>, job: Job) -> Result<()> {
        if self.is_shutdown() {
            return Err(self.rejected("pool is shut down"));
        }

        let job = match self.start_worker(Some(job), self.spec.core_size) {
            Ok(()) => {
                self.total_submitted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(job) => job,
        };
        // `start_worker` отдаёт задачу обратно, если воркер не запущен
        let Some(job) = job else {
            return Ok(());
        };

        let job = match self.enqueue(job) {
            Ok(()) => {
                self.total_submitted.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(job) => job,
        };

        match self.start_worker(Some(job), self.spec.max_size) {
            Ok(()) => {
                self.total_submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(job) => match job {
                Some(job) => self.reject(job),
                None => Ok(()),
            },
        }
    }

    /// Выполняет `f` в пуле и возвращает промис с результатом.
    pub fn submit<T, F>(self: &Arc<Self>, f: F) -> Result<Promise<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let promise = Promise::new();
        let guard = SettleOnDrop::new(promise.completer(), self.name());
        self.execute(Box::new(move || {
            let completer = guard.completer();
            if completer.is_cancelled() {
                return;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(f))
                .map_err(|payload| ControlError::Panicked(panic_message(payload)));
            completer.settle(result);
        }))?;
        Ok(promise)
    }

    fn enqueue(self: &Arc<Self>, job: Job) -> std::result::Result<(), Job> {
        match self.spec.queue {
            QueueKind::Unbounded => {
                self.queued_tasks.fetch_add(1, Ordering::Relaxed);
            }
            QueueKind::Bounded(capacity) => {
                let reserved = self.queued_tasks.fetch_update(
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    |queued| (queued < capacity).then_some(queued + 1),
                );
                if reserved.is_err() {
                    return Err(job);
                }
            }
        }
        self.inject.push(job);

        {
            let _sleep = self.sleep.lock();
            if self.idle_workers.load(Ordering::Relaxed) > 0 {
                self.wakeup.notify_one();
            }
        }
        self.ensure_worker();
        Ok(())
    }

    /// Непустой очереди нужен хотя бы один живой воркер.
    ///
    /// Воркер уходит только при пустой очереди и под замком `workers`
    /// (см. [`WorkerPool::try_exit`]), а здесь число живых читается под тем же
    /// замком уже после вставки. Поэтому либо уходящий воркер увидит задачу,
    /// либо здесь будет видно, что воркеров не осталось.
    fn ensure_worker(self: &Arc<Self>) {
        let index = {
            let mut workers = self.workers.lock();
            if workers.live > 0 || self.inject.is_empty() {
                return;
            }
            if self.is_shutdown() {
                None
            } else {
                Some(workers.admit())
            }
        };

        let stranded = match index {
            Some(index) => self.spawn_worker(index, None).is_err(),
            None => true,
        };
        if stranded {
            self.reject_queued("no worker left to run queued tasks");
        }
    }

    /// Сбрасывает очередь; промисы сброшенных задач получают `Rejected`.
    fn reject_queued(&self, reason: &str) -> usize {
        let mut dropped = 0;
        while let Some(job) = self.steal() {
            drop(job);
            dropped += 1;
        }
        if dropped > 0 {
            self.rejected_tasks.fetch_add(dropped, Ordering::Relaxed);
            warn!(pool = %self.spec.name, dropped, reason, "queued tasks rejected");
        }
        dropped
    }

    fn reject(self: &Arc<Self>, job: Job) -> Result<()> {
        match self.spec.rejection {
            RejectionPolicy::Abort => Err(self.rejected("queue is full and all workers are busy")),
            RejectionPolicy::CallerRuns => {
                self.total_submitted.fetch_add(1, Ordering::Relaxed);
                trace!(pool = %self.spec.name, "running rejected task on caller thread");
                self.run_job(job);
                Ok(())
            }
            RejectionPolicy::Discard => {
                self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                debug!(pool = %self.spec.name, "task discarded");
                Ok(())
            }
            RejectionPolicy::DiscardOldest => {
                if let Some(oldest) = self.steal() {
                    self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                    debug!(pool = %self.spec.name, "oldest queued task discarded");
                    drop(oldest);
                }
                match self.enqueue(job) {
                    Ok(()) => {
                        self.total_submitted.fetch_add(1, Ordering::Relaxed);
                        Ok(())
                    }
                    Err(job) => {
                        self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
                        drop(job);
                        Ok(())
                    }
                }
            }
        }
    }

    fn rejected(&self, reason: &str) -> ControlError {
        self.rejected_tasks.fetch_add(1, Ordering::Relaxed);
        warn!(pool = %self.spec.name, reason, "task rejected");
        ControlError::Rejected {
            pool: self.spec.name.clone(),
            reason: reason.to_owned(),
        }
    }

    /// Запускает воркер, если живых меньше `limit`. Иначе отдаёт задачу обратно.
    fn start_worker(
        self: &Arc<Self>,
        first: Option<Job>,
        limit: usize,
    ) -> std::result::Result<(), Option<Job>> {
        let index = {
            let mut workers = self.workers.lock();
            if workers.live >= limit || self.is_shutdown() {
                return Err(first);
            }
            workers.admit()
        };
        self.spawn_worker(index, first)
    }

    /// Запускает поток для уже учтённого в `live` воркера.
    fn spawn_worker(
        self: &Arc<Self>,
        index: usize,
        first: Option<Job>,
    ) -> std::result::Result<(), Option<Job>> {
        // Задача передаётся в поток через слот, чтобы вернуть её при ошибке spawn
        let slot = Arc::new(Mutex::new(first));
        let handoff = slot.clone();
        let pool = self.clone();
        let spawned = self
            .spec
            .thread_factory
            .new_thread(&self.spec.name, index)
            .spawn(move || {
                let first = handoff.lock().take();
                pool.worker_loop(first);
            });

        match spawned {
            Ok(_) => {
                debug!(pool = %self.spec.name, index, "worker started");
                Ok(())
            }
            Err(err) => {
                warn!(pool = %self.spec.name, error = %err, "failed to spawn worker thread");
                self.leave();
                let job = slot.lock().take();
                Err(job)
            }
        }
    }

    fn worker_loop(&self, first: Option<Job>) {
        let mut task = first;
        loop {
            let job = match task.take() {
                Some(job) => job,
                None => match self.next_job() {
                    Some(job) => job,
                    None => break,
                },
            };
            self.run_job(job);
        }
        trace!(pool = %self.spec.name, "worker exited");
    }

    fn run_job(&self, job: Job) {
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                self.completed_tasks.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.failed_tasks.fetch_add(1, Ordering::Relaxed);
                warn!(pool = %self.spec.name, panic = %panic_message(payload), "pooled task panicked");
            }
        }
        self.active_tasks.fetch_sub(1, Ordering::Relaxed);
    }

    fn steal(&self) -> Option<Job> {
        let backoff = Backoff::new();
        loop {
            match self.inject.steal() {
                Steal::Success(job) => {
                    self.queued_tasks.fetch_sub(1, Ordering::AcqRel);
                    return Some(job);
                }
                Steal::Empty => return None,
                Steal::Retry => backoff.spin(),
            }
        }
    }

    /// `None` означает, что воркер уже снят с учёта и должен завершиться.
    fn next_job(&self) -> Option<Job> {
        loop {
            if let Some(job) = self.steal() {
                return Some(job);
            }
            if self.is_shutdown() {
                if self.try_exit(false) {
                    return None;
                }
                continue;
            }

            let mut sleep = self.sleep.lock();
            if !self.inject.is_empty() || self.is_shutdown() {
                continue;
            }
            let timed = self.workers.lock().live > self.spec.core_size;

            self.idle_workers.fetch_add(1, Ordering::Relaxed);
            let timed_out = if timed {
                self.wakeup
                    .wait_for(&mut sleep, self.spec.keep_alive)
                    .timed_out()
            } else {
                self.wakeup.wait(&mut sleep);
                false
            };
            self.idle_workers.fetch_sub(1, Ordering::Relaxed);
            drop(sleep);

            if timed_out && self.try_exit(true) {
                return None;
            }
        }
    }

    /// Снимает воркер с учёта, если очередь пуста. При `retiring` воркер
    /// уходит, только если живых всё ещё больше ядра.
    fn try_exit(&self, retiring: bool) -> bool {
        let mut workers = self.workers.lock();
        if !self.inject.is_empty() {
            return false;
        }
        if retiring && workers.live <= self.spec.core_size {
            return false;
        }
        workers.live -= 1;
        trace!(pool = %self.spec.name, live = workers.live, retiring, "worker leaving");
        if workers.live == 0 {
            self.terminated.notify_all();
        }
        true
    }

    fn leave(&self) {
        let mut workers = self.workers.lock();
        workers.live = workers.live.saturating_sub(1);
        if workers.live == 0 {
            self.terminated.notify_all();
        }
    }

    #[inline]
    pub fn metrics(&self) -> PoolMetrics {
        let workers = self.workers.lock();
        PoolMetrics {
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
            idle_workers: self.idle_workers.load(Ordering::Relaxed),
            live_workers: workers.live,
            largest_workers: workers.largest,
            queued_tasks: self.queued_tasks.load(Ordering::Relaxed),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            completed_tasks: self.completed_tasks.load(Ordering::Relaxed),
            failed_tasks: self.failed_tasks.load(Ordering::Relaxed),
            rejected_tasks: self.rejected_tasks.load(Ordering::Relaxed),
        }
    }

    /// Перестаёт принимать задачи; уже поставленные в очередь будут выполнены.
    pub fn shutdown(&self) {
        if self.shutdown_token.is_cancelled() {
            return;
        }
        self.shutdown_token.cancel();
        let _sleep = self.sleep.lock();
        self.wakeup.notify_all();
        debug!(pool = %self.spec.name, "shutdown requested");
    }

    /// Как [`WorkerPool::shutdown`], но ещё и сбрасывает очередь.
    /// Возвращает число отброшенных задач.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        self.reject_queued("pool is shut down")
    }

    /// Ждёт выхода всех воркеров не дольше `timeout`.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut workers = self.workers.lock();
        while workers.live > 0 {
            if self.terminated.wait_until(&mut workers, deadline).timed_out() {
                return workers.live == 0;
            }
        }
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.is_shutdown() && self.workers.lock().live == 0
    }
}
