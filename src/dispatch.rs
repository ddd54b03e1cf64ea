use super::{
    cache::OnceMap,
    config::ConfigResolver,
    errors::{BoxError, ControlError, Result},
    handle::{CancelHook, Deferred, DispatchHandle, Promise},
    pool::{panic_message, Pool, SettleOnDrop},
    registry::PoolRegistry,
    target::{ReturnKind, TargetId},
};
use std::{
    convert::Infallible,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};
use tracing::debug;

/// Разрешённая политика асинхронного вызова: пул, в котором он выполняется.
pub struct AsyncPolicy {
    pool_name: String,
    pool: Pool,
}

impl AsyncPolicy {
    #[inline]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    #[inline]
    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

/// Переносит выполнение цели в именованный пул.
///
/// Вызывающий никогда не блокируется: он сразу получает [`DispatchHandle`].
/// Воркер пула выполняет тело, регистрирует хук отмены на возвращённом
/// отложенном результате и ждёт его.
pub struct AsyncDispatcher {
    resolver: Arc<dyn ConfigResolver>,
    pools: Arc<PoolRegistry>,
    policies: OnceMap<TargetId, AsyncPolicy>,
}

impl AsyncDispatcher {
    pub fn new(resolver: Arc<dyn ConfigResolver>, pools: Arc<PoolRegistry>) -> Self {
        Self {
            resolver,
            pools,
            policies: OnceMap::new(),
        }
    }

    pub fn policy(&self, target: &TargetId) -> Result<Arc<AsyncPolicy>> {
        self.policies.get_or_try_insert_with(target, || {
            let pool_name = self.resolver.resolve(target).asynchronous().pool;
            let pool = self.pools.get_or_create(&pool_name)?;
            debug!(target_id = %target, pool = %pool_name, "async policy resolved");
            Ok(AsyncPolicy { pool_name, pool })
        })
    }

    pub fn dispatch<D, F>(&self, target: &TargetId, body: F) -> Result<DispatchHandle<D::Output>>
    where
        D: Deferred,
        F: FnOnce() -> D + Send + 'static,
    {
        self.try_dispatch(target, move || Ok::<D, Infallible>(body()))
    }

    /// Ошибка `InvalidUsage` возвращается сразу; все остальные ошибки
    /// (пул недоступен, отказ пула, ошибка тела) приходят через хэндл.
    pub fn try_dispatch<D, E, F>(&self, target: &TargetId, body: F) -> Result<DispatchHandle<D::Output>>
    where
        D: Deferred,
        E: Into<BoxError>,
        F: FnOnce() -> std::result::Result<D, E> + Send + 'static,
    {
        if target.returns() != ReturnKind::Deferred {
            return Err(ControlError::InvalidUsage {
                target: target.to_string(),
                reason: "return type should be a deferred handle".into(),
            });
        }

        let promise = Promise::new();
        let completer = promise.completer();
        let hook = Arc::new(CancelHook::new());
        let handle = DispatchHandle::new(promise, hook.clone());

        let policy = match self.policy(target) {
            Ok(policy) => policy,
            Err(err) => {
                completer.fail(err);
                return Ok(handle);
            }
        };

        if !self.pools.is_running() {
            completer.fail(ControlError::PoolUnavailable {
                name: policy.pool_name().to_owned(),
            });
            return Ok(handle);
        }

        let guard = SettleOnDrop::new(completer.clone(), policy.pool_name());
        let job = Box::new(move || {
            let completer = guard.completer();
            if completer.is_cancelled() {
                return;
            }
            let result = match panic::catch_unwind(AssertUnwindSafe(body)) {
                Err(payload) => Err(ControlError::Panicked(panic_message(payload))),
                Ok(Err(err)) => Err(ControlError::target(err)),
                Ok(Ok(inner)) => {
                    hook.arm(inner.canceller());
                    inner.wait()
                }
            };
            completer.settle(result);
        });

        if let Err(err) = policy.pool().execute(job) {
            completer.fail(err);
        }
        Ok(handle)
    }
}
