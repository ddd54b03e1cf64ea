//! Реестр именованных пулов.
//!
//! Пул создаётся при первом обращении по имени: из зарегистрированной
//! спецификации или из спецификации по умолчанию. Регистрация действует
//! только до первого обращения к пулу.

use super::{
    cache::OnceMap,
    errors::{ControlError, Result},
    pool::{Pool, PoolSpec, WorkerPool},
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

pub struct PoolRegistry {
    running: AtomicBool,
    specs: Mutex<HashMap<String, PoolSpec>>,
    pools: OnceMap<String, WorkerPool>,
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            specs: Mutex::new(HashMap::new()),
            pools: OnceMap::new(),
        }
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Регистрирует спецификацию пула. Возвращает `false`, если пул с этим
    /// именем уже создан или реестр остановлен: тогда спецификация игнорируется.
    pub fn register(&self, spec: PoolSpec) -> bool {
        if !self.is_running() {
            warn!(pool = %spec.name, "registry is shut down, pool spec ignored");
            return false;
        }
        if self.pools.contains(spec.name.as_str()) {
            warn!(pool = %spec.name, "pool already materialized, spec ignored");
            return false;
        }
        debug!(pool = %spec.name, core = spec.core_size, max = spec.max_size, "pool spec registered");
        self.specs.lock().insert(spec.name.clone(), spec);
        true
    }

    pub fn get_or_create(&self, name: &str) -> Result<Pool> {
        if !self.is_running() {
            return Err(ControlError::PoolUnavailable { name: name.to_owned() });
        }

        let pool = self.pools.get_or_insert_with(&name.to_owned(), || {
            let spec = self
                .specs
                .lock()
                .get(name)
                .cloned()
                .unwrap_or_else(|| PoolSpec::named(name));
            debug!(pool = %name, core = spec.core_size, max = spec.max_size, "pool materialized");
            WorkerPool::new(spec)
        });

        // Остановка могла начаться, пока пул создавался
        if !self.is_running() {
            pool.shutdown();
            return Err(ControlError::PoolUnavailable { name: name.to_owned() });
        }
        Ok(pool)
    }

    pub fn get(&self, name: &str) -> Option<Pool> {
        self.pools.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.values().into_iter().map(|(name, _)| name).collect();
        names.sort();
        names
    }

    /// Останавливает все пулы, каждому даётся его `shutdown_grace`.
    /// Возвращает имена пулов, воркеры которых не успели завершиться.
    pub fn shutdown_all(&self) -> Vec<String> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }

        let mut stuck = Vec::new();
        for (name, pool) in self.pools.values() {
            pool.shutdown();
            let grace = pool.spec().shutdown_grace;
            if grace.is_zero() {
                continue;
            }
            if !pool.await_termination(grace) {
                warn!(pool = %name, ?grace, "pool did not terminate within its shutdown grace");
                stuck.push(name);
            }
        }
        debug!(stuck = stuck.len(), "pool registry shut down");
        stuck
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
