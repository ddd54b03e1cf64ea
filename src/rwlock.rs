//! Реентерабельная read/write блокировка для областей [`crate::lock`].
//!
//! Владелец записи может повторно взять и запись, и чтение; читатель может
//! повторно взять чтение. Повышение чтения до записи не поддерживается:
//! такой запрос ждёт, пока не уйдут все читатели, включая его самого.

use super::{
    config::Operation,
    errors::{ControlError, Result},
    wait_queue::WaitQueue,
};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use tracing::warn;

/// Read/write блокировка, которой управляет координатор блокировок.
///
/// Собственная фабрика ([`crate::lock::LockFactory`]) может вернуть любую
/// реализацию; координатор сам решает, какую сторону брать и сколько ждать.
pub trait ReadWriteLock: Send + Sync {
    /// Бессрочное ожидание. `Err(Interrupted)`, если блокировку закрыли.
    fn lock(&self, side: Operation) -> Result<()>;

    /// Ожидание не дольше `timeout`; `Ok(false)`, если время вышло.
    fn try_lock_for(&self, side: Operation, timeout: Duration) -> Result<bool>;

    /// Снимает одно удержание текущего потока.
    fn unlock(&self, side: Operation);

    /// Прерывает ожидающих и отклоняет новые захваты.
    fn close(&self) {}
}

#[derive(Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    readers: HashMap<ThreadId, usize>,
    queue: WaitQueue<Operation>,
    closed: bool,
}

impl LockState {
    fn admits(&self, fair: bool, me: ThreadId, side: Operation, ticket: Option<u64>) -> bool {
        if self.writer == Some(me) {
            return true;
        }
        if self.writer.is_some() {
            return false;
        }
        match side {
            Operation::Write => self.readers.is_empty() && (!fair || self.queue.is_first(ticket)),
            Operation::Read => {
                if self.readers.contains_key(&me) {
                    return true;
                }
                if fair {
                    self.queue.is_first(ticket)
                } else {
                    // Нечестный режим: читатели не обгоняют писателя в голове очереди
                    !matches!(self.queue.head(), Some((head, &Operation::Write)) if Some(head) != ticket)
                }
            }
        }
    }

    fn grant(&mut self, me: ThreadId, side: Operation) {
        match side {
            Operation::Write => {
                self.writer = Some(me);
                self.write_holds += 1;
            }
            Operation::Read => *self.readers.entry(me).or_insert(0) += 1,
        }
    }
}

pub struct ScopeLock {
    fair: bool,
    state: Mutex<LockState>,
    changed: Condvar,
}

impl ScopeLock {
    pub fn new(fair: bool) -> Self {
        Self {
            fair,
            state: Mutex::new(LockState::default()),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn is_fair(&self) -> bool {
        self.fair
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn read_holds(&self) -> usize {
        self.state.lock().readers.values().sum()
    }

    pub fn queue_length(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn acquire(&self, side: Operation, deadline: Option<Instant>) -> Result<bool> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        let mut ticket = None;
        loop {
            if state.closed {
                if let Some(t) = ticket {
                    state.queue.remove(t);
                    self.changed.notify_all();
                }
                return Err(ControlError::Interrupted { operation: "lock" });
            }
            if state.admits(self.fair, me, side, ticket) {
                state.grant(me, side);
                if let Some(t) = ticket {
                    state.queue.remove(t);
                    self.changed.notify_all();
                }
                return Ok(true);
            }
            let t = match ticket {
                Some(t) => t,
                None => {
                    let t = state.queue.push(side);
                    ticket = Some(t);
                    t
                }
            };
            match deadline {
                None => self.changed.wait(&mut state),
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !state.closed
                        && !state.admits(self.fair, me, side, ticket)
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

impl ReadWriteLock for ScopeLock {
    fn lock(&self, side: Operation) -> Result<()> {
        self.acquire(side, None).map(|_| ())
    }

    fn try_lock_for(&self, side: Operation, timeout: Duration) -> Result<bool> {
        self.acquire(side, Some(Instant::now() + timeout))
    }

    fn unlock(&self, side: Operation) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match side {
            Operation::Write => {
                if state.writer != Some(me) {
                    warn!("write unlock from a thread that does not hold the write lock");
                    return;
                }
                state.write_holds -= 1;
                if state.write_holds == 0 {
                    state.writer = None;
                }
            }
            Operation::Read => match state.readers.get_mut(&me) {
                Some(holds) if *holds > 1 => *holds -= 1,
                Some(_) => {
                    state.readers.remove(&me);
                }
                None => {
                    warn!("read unlock from a thread that does not hold the read lock");
                    return;
                }
            },
        }
        drop(state);
        self.changed.notify_all();
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }
}
