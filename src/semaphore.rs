use super::{
    errors::{ControlError, Result},
    wait_queue::WaitQueue,
};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Взвешенный счётный семафор, которым управляет координатор троттлинга.
pub trait Permits: Send + Sync {
    /// Ждёт, пока не освободятся все `weight` разрешений сразу.
    fn acquire(&self, weight: u32) -> Result<()>;

    /// `Ok(false)`, если `weight` разрешений не набралось за `timeout`.
    fn try_acquire_for(&self, weight: u32, timeout: Duration) -> Result<bool>;

    fn release(&self, weight: u32);

    fn available(&self) -> u32;

    fn waiting(&self) -> usize {
        0
    }

    fn close(&self) {}
}

#[derive(Default)]
struct PermitState {
    available: u32,
    queue: WaitQueue<u32>,
    closed: bool,
}

impl PermitState {
    #[inline]
    fn admits(&self, fair: bool, weight: u32, ticket: Option<u64>) -> bool {
        self.available >= weight && (!fair || self.queue.is_first(ticket))
    }
}

/// Семафор с весами; в честном режиме разрешения выдаются строго по очереди,
/// и тяжёлый запрос в голове очереди задерживает лёгкие за ним.
///
/// Вес больше общего числа разрешений никогда не будет удовлетворён:
/// такой запрос ждёт бесконечно или до таймаута.
pub struct WeightedSemaphore {
    fair: bool,
    state: Mutex<PermitState>,
    changed: Condvar,
}

impl WeightedSemaphore {
    pub fn new(permits: u32, fair: bool) -> Self {
        Self {
            fair,
            state: Mutex::new(PermitState {
                available: permits,
                ..Default::default()
            }),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    fn acquire_until(&self, weight: u32, deadline: Option<Instant>) -> Result<bool> {
        let mut state = self.state.lock();
        let mut ticket = None;
        loop {
            if state.closed {
                if let Some(t) = ticket {
                    state.queue.remove(t);
                    self.changed.notify_all();
                }
                return Err(ControlError::Interrupted { operation: "acquire()" });
            }
            if state.admits(self.fair, weight, ticket) {
                state.available -= weight;
                if let Some(t) = ticket {
                    state.queue.remove(t);
                }
                if ticket.is_some() || state.available > 0 {
                    self.changed.notify_all();
                }
                return Ok(true);
            }
            let t = match ticket {
                Some(t) => t,
                None => {
                    let t = state.queue.push(weight);
                    ticket = Some(t);
                    t
                }
            };
            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !state.closed
                        && !state.admits(self.fair, weight, ticket)
                    {
                        state.queue.remove(t);
                        self.changed.notify_all();
                        return Ok(false);
                    }
                }
            }
        }
    }
}

impl Permits for WeightedSemaphore {
    fn acquire(&self, weight: u32) -> Result<()> {
        self.acquire_until(weight, None).map(|_| ())
    }

    fn try_acquire_for(&self, weight: u32, timeout: Duration) -> Result<bool> {
        self.acquire_until(weight, Some(Instant::now() + timeout))
    }

    fn release(&self, weight: u32) {
        {
            let mut state = self.state.lock();
            state.available = state.available.saturating_add(weight);
        }
        self.changed.notify_all();
    }

    fn available(&self) -> u32 {
        self.state.lock().available
    }

    fn waiting(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }
}
