use super::errors::{ControlError, Result};
use futures::task::AtomicWaker;
use parking_lot::{Condvar, Mutex};
use std::{
    future::Future,
    mem,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

pub type CancelFn = Box<dyn FnOnce() + Send + 'static>;

/// Отложенный результат, который может вернуть тело цели при dispatch.
///
/// Воркер пула регистрирует [`Deferred::canceller`] как хук отмены и затем
/// блокируется в [`Deferred::wait`].
pub trait Deferred: Send + 'static {
    type Output: Send + 'static;

    fn canceller(&self) -> CancelFn;

    fn wait(self) -> Result<Self::Output>;
}

enum State<T> {
    Pending,
    Ready(Result<T>),
    Cancelled,
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
    waker: AtomicWaker,
    cancel_token: CancellationToken,
}

impl<T> Shared<T> {
    fn settle(&self, next: State<T>) -> bool {
        {
            let mut state = self.state.lock();
            if !matches!(*state, State::Pending) {
                return false;
            }
            *state = next;
        }
        self.ready.notify_all();
        self.waker.wake();
        true
    }

    fn cancel(&self) -> bool {
        let settled = self.settle(State::Cancelled);
        if settled {
            self.cancel_token.cancel();
        }
        settled
    }

    fn take(state: &mut State<T>) -> Result<T> {
        match mem::replace(state, State::Taken) {
            State::Ready(result) => result,
            State::Cancelled => Err(ControlError::Cancelled),
            State::Taken => Err(ControlError::Consumed),
            State::Pending => unreachable!("take() on a pending promise"),
        }
    }
}

/// Завершаемый из любого потока хэндл результата.
///
/// Блокирующее ожидание через [`Promise::wait`], асинхронное через `.await`.
/// После отмены промис больше никогда не завершится значением.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

/// Сторона производителя: завершает связанный [`Promise`].
pub struct Completer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Completer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Self::with_state(State::Pending)
    }

    pub fn completed(value: T) -> Self {
        Self::with_state(State::Ready(Ok(value)))
    }

    pub fn failed(err: ControlError) -> Self {
        Self::with_state(State::Ready(Err(err)))
    }

    fn with_state(state: State<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                ready: Condvar::new(),
                waker: AtomicWaker::new(),
                cancel_token: CancellationToken::new(),
            }),
        }
    }

    pub fn completer(&self) -> Completer<T> {
        Completer {
            shared: self.shared.clone(),
        }
    }

    #[inline]
    pub fn cancel(&self) -> bool {
        self.shared.cancel()
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(*self.shared.state.lock(), State::Cancelled)
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }

    /// Токен, который срабатывает при отмене; вычисление может его опрашивать.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel_token.clone()
    }

    /// Ждёт завершения не дольше `timeout`. Значение не забирается.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            if self.shared.ready.wait_until(&mut state, deadline).timed_out() {
                return !matches!(*state, State::Pending);
            }
        }
        true
    }

    pub fn wait(self) -> Result<T> {
        let mut state = self.shared.state.lock();
        while matches!(*state, State::Pending) {
            self.shared.ready.wait(&mut state);
        }
        Shared::take(&mut state)
    }
}

impl<T> Completer<T> {
    #[inline]
    pub fn complete(&self, value: T) -> bool {
        self.shared.settle(State::Ready(Ok(value)))
    }

    #[inline]
    pub fn fail(&self, err: ControlError) -> bool {
        self.shared.settle(State::Ready(Err(err)))
    }

    pub fn settle(&self, result: Result<T>) -> bool {
        self.shared.settle(State::Ready(result))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel_token.is_cancelled()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel_token.clone()
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.shared.waker.register(cx.waker());
        let mut state = this.shared.state.lock();
        match *state {
            State::Pending => Poll::Pending,
            _ => Poll::Ready(Shared::take(&mut state)),
        }
    }
}

impl<T: Send + 'static> Deferred for Promise<T> {
    type Output = T;

    fn canceller(&self) -> CancelFn {
        let shared = self.shared.clone();
        Box::new(move || {
            shared.cancel();
        })
    }

    fn wait(self) -> Result<T> {
        Promise::wait(self)
    }
}

enum HookState {
    Empty,
    Armed(CancelFn),
    Fired,
}

/// Хук отмены внутреннего вычисления; срабатывает ровно один раз.
pub(crate) struct CancelHook {
    state: Mutex<HookState>,
}

impl CancelHook {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(HookState::Empty),
        }
    }

    /// Если отмена уже запрошена, хук вызывается сразу.
    pub(crate) fn arm(&self, hook: CancelFn) {
        let mut state = self.state.lock();
        match *state {
            HookState::Fired => {
                drop(state);
                hook();
            }
            _ => *state = HookState::Armed(hook),
        }
    }

    pub(crate) fn fire(&self) {
        let previous = mem::replace(&mut *self.state.lock(), HookState::Fired);
        if let HookState::Armed(hook) = previous {
            hook();
        }
    }
}

/// Внешний хэндл, который возвращает dispatch.
///
/// Отмена помечает хэндл отменённым и передаёт запрос отмены внутреннему
/// хэндлу, который вернуло тело цели.
pub struct DispatchHandle<T> {
    promise: Promise<T>,
    hook: Arc<CancelHook>,
}

impl<T> DispatchHandle<T> {
    pub(crate) fn new(promise: Promise<T>, hook: Arc<CancelHook>) -> Self {
        Self { promise, hook }
    }

    pub fn cancel(&self) -> bool {
        let cancelled = self.promise.cancel();
        if cancelled {
            self.hook.fire();
        }
        cancelled
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.promise.is_cancelled()
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.promise.is_done()
    }

    #[inline]
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.promise.wait_for(timeout)
    }

    #[inline]
    pub fn wait(self) -> Result<T> {
        self.promise.wait()
    }
}

impl<T> Future for DispatchHandle<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.promise).poll(cx)
    }
}

impl<T: Send + 'static> Deferred for DispatchHandle<T> {
    type Output = T;

    fn canceller(&self) -> CancelFn {
        let shared = self.promise.shared.clone();
        let hook = self.hook.clone();
        Box::new(move || {
            if shared.cancel() {
                hook.fire();
            }
        })
    }

    fn wait(self) -> Result<T> {
        self.promise.wait()
    }
}
