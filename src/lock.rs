//! Координатор блокировок.
//!
//! Для каждой цели один раз строится [`LockPolicy`]: какая блокировка, какая
//! сторона (чтение или запись) и сколько ждать. По умолчанию все методы
//! одного типа делят одну блокировку, ключом служит имя типа.

use super::{
    cache::OnceMap,
    config::{ConfigResolver, Operation},
    errors::{BoxError, ControlError, Result},
    locator::ServiceLocator,
    rwlock::{ReadWriteLock, ScopeLock},
    target::TargetId,
};
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, trace};

/// Поставщик блокировок для целей.
pub trait LockFactory: Send + Sync {
    fn new_lock(&self, target: &TargetId, fair: bool) -> Arc<dyn ReadWriteLock>;
}

/// Фабрика по умолчанию: одна блокировка на объявляющий тип.
///
/// Честность задаётся первой целью, создавшей область.
#[derive(Default)]
pub struct TypeScopedLocks {
    scopes: OnceMap<String, ScopeLock>,
}

impl TypeScopedLocks {
    pub fn scope(&self, key: &str) -> Option<Arc<ScopeLock>> {
        self.scopes.get(key)
    }

    fn close_all(&self) {
        for (_, scope) in self.scopes.values() {
            scope.close();
        }
    }
}

impl LockFactory for TypeScopedLocks {
    fn new_lock(&self, target: &TargetId, fair: bool) -> Arc<dyn ReadWriteLock> {
        self.scopes
            .get_or_insert_with(&target.declaring_type().to_owned(), || {
                debug!(scope = %target.declaring_type(), fair, "lock scope created");
                ScopeLock::new(fair)
            })
    }
}

/// Разрешённая политика блокировки одной цели.
pub struct LockPolicy {
    target: TargetId,
    lock: Arc<dyn ReadWriteLock>,
    operation: Operation,
    timeout: Duration,
}

impl LockPolicy {
    #[inline]
    pub fn lock(&self) -> &Arc<dyn ReadWriteLock> {
        &self.lock
    }

    #[inline]
    pub fn operation(&self) -> Operation {
        self.operation
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn acquire(&self) -> Result<LockGuard> {
        if self.timeout.is_zero() {
            self.lock.lock(self.operation)?;
        } else if !self.lock.try_lock_for(self.operation, self.timeout)? {
            return Err(ControlError::LockTimeout {
                target: self.target.to_string(),
                timeout: self.timeout,
            });
        }
        trace!(target_id = %self.target, operation = ?self.operation, "lock acquired");
        Ok(LockGuard {
            lock: self.lock.clone(),
            operation: self.operation,
            _not_send: PhantomData,
        })
    }
}

/// Удержание блокировки; снимается при drop на любом пути выхода.
///
/// Блокировка привязана к потоку, поэтому guard не `Send`.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard {
    lock: Arc<dyn ReadWriteLock>,
    operation: Operation,
    _not_send: PhantomData<*const ()>,
}

impl LockGuard {
    #[inline]
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.lock.unlock(self.operation);
        trace!(operation = ?self.operation, "lock released");
    }
}

pub struct LockCoordinator {
    resolver: Arc<dyn ConfigResolver>,
    locator: Arc<dyn ServiceLocator>,
    defaults: TypeScopedLocks,
    policies: OnceMap<TargetId, LockPolicy>,
    closed: AtomicBool,
}

impl LockCoordinator {
    pub fn new(resolver: Arc<dyn ConfigResolver>, locator: Arc<dyn ServiceLocator>) -> Self {
        Self {
            resolver,
            locator,
            defaults: TypeScopedLocks::default(),
            policies: OnceMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Политика цели; строится при первом обращении и дальше переиспользуется.
    pub fn policy(&self, target: &TargetId) -> Result<Arc<LockPolicy>> {
        self.policies.get_or_try_insert_with(target, || {
            let decl = self.resolver.resolve(target).locked();
            let lock = match decl.factory.as_deref() {
                Some(id) => self
                    .locator
                    .lock_factory(id)
                    .ok_or_else(|| ControlError::FactoryNotFound {
                        kind: "lock",
                        id: id.to_owned(),
                    })?
                    .new_lock(target, decl.fair),
                None => self.defaults.new_lock(target, decl.fair),
            };
            debug!(
                target_id = %target,
                operation = ?decl.operation,
                timeout = ?decl.timeout,
                factory = decl.factory.as_deref().unwrap_or("default"),
                "lock policy resolved"
            );
            Ok(LockPolicy {
                target: target.clone(),
                lock,
                operation: decl.operation,
                timeout: decl.timeout,
            })
        })
    }

    pub fn acquire(&self, target: &TargetId) -> Result<LockGuard> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControlError::Interrupted { operation: "lock" });
        }
        self.policy(target)?.acquire()
    }

    /// Выполняет `body` под блокировкой цели.
    pub fn run<R>(&self, target: &TargetId, body: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.acquire(target)?;
        Ok(body())
    }

    /// Как [`LockCoordinator::run`], но ошибка тела пробрасывается как ошибка цели.
    pub fn try_run<R, E>(&self, target: &TargetId, body: impl FnOnce() -> std::result::Result<R, E>) -> Result<R>
    where
        E: Into<BoxError>,
    {
        let _guard = self.acquire(target)?;
        body().map_err(ControlError::target)
    }

    /// Область блокировки фабрики по умолчанию.
    pub fn scope(&self, key: &str) -> Option<Arc<ScopeLock>> {
        self.defaults.scope(key)
    }

    /// Прерывает ожидающих и отклоняет новые захваты.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.defaults.close_all();
        for (_, policy) in self.policies.values() {
            policy.lock.close();
        }
        debug!("lock coordinator closed");
    }
}
