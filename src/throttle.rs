//! Координатор троттлинга: взвешенный допуск по именованным группам.
//!
//! Параметры вызова (вес, таймаут) и параметры группы (имя, разрешения,
//! честность, фабрика) разрешаются независимо. Цели с одинаковым именем
//! группы делят один семафор.

use super::{
    cache::OnceMap,
    config::ConfigResolver,
    errors::{BoxError, ControlError, Result},
    locator::ServiceLocator,
    model::GroupMetrics,
    semaphore::{Permits, WeightedSemaphore},
    target::TargetId,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, trace};

/// Поставщик семафоров для групп.
pub trait SemaphoreFactory: Send + Sync {
    fn new_semaphore(&self, target: &TargetId, name: &str, fair: bool, permits: u32) -> Arc<dyn Permits>;
}

/// Фабрика по умолчанию: один семафор на имя группы, создаётся один раз.
#[derive(Default)]
pub struct NamedGroups {
    groups: OnceMap<String, WeightedSemaphore>,
}

impl NamedGroups {
    pub fn group(&self, name: &str) -> Option<Arc<WeightedSemaphore>> {
        self.groups.get(name)
    }

    fn close_all(&self) {
        for (_, group) in self.groups.values() {
            group.close();
        }
    }
}

impl SemaphoreFactory for NamedGroups {
    fn new_semaphore(&self, _target: &TargetId, name: &str, fair: bool, permits: u32) -> Arc<dyn Permits> {
        self.groups.get_or_insert_with(&name.to_owned(), || {
            debug!(group = %name, permits, fair, "throttle group created");
            WeightedSemaphore::new(permits, fair)
        })
    }
}

pub struct ThrottlePolicy {
    target: TargetId,
    group: String,
    permits: u32,
    semaphore: Arc<dyn Permits>,
    weight: u32,
    timeout: Duration,
}

impl ThrottlePolicy {
    #[inline]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[inline]
    pub fn semaphore(&self) -> &Arc<dyn Permits> {
        &self.semaphore
    }

    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn metrics(&self) -> GroupMetrics {
        GroupMetrics {
            name: self.group.clone(),
            permits: self.permits,
            available: self.semaphore.available(),
            waiting: self.semaphore.waiting(),
        }
    }

    fn admit(&self) -> Result<Permit> {
        if self.timeout.is_zero() {
            self.semaphore.acquire(self.weight)?;
        } else if !self.semaphore.try_acquire_for(self.weight, self.timeout)? {
            return Err(ControlError::AcquireTimeout {
                target: self.target.to_string(),
                weight: self.weight,
                timeout: self.timeout,
            });
        }
        trace!(target_id = %self.target, group = %self.group, weight = self.weight, "permits acquired");
        Ok(Permit {
            semaphore: self.semaphore.clone(),
            weight: self.weight,
        })
    }
}

/// Удержание `weight` разрешений; возвращаются ровно они, при drop.
#[must_use = "permits are released as soon as the guard is dropped"]
pub struct Permit {
    semaphore: Arc<dyn Permits>,
    weight: u32,
}

impl Permit {
    #[inline]
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.semaphore.release(self.weight);
        trace!(weight = self.weight, "permits released");
    }
}

pub struct ThrottleCoordinator {
    resolver: Arc<dyn ConfigResolver>,
    locator: Arc<dyn ServiceLocator>,
    defaults: NamedGroups,
    policies: OnceMap<TargetId, ThrottlePolicy>,
    closed: AtomicBool,
}

impl ThrottleCoordinator {
    pub fn new(resolver: Arc<dyn ConfigResolver>, locator: Arc<dyn ServiceLocator>) -> Self {
        Self {
            resolver,
            locator,
            defaults: NamedGroups::default(),
            policies: OnceMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn policy(&self, target: &TargetId) -> Result<Arc<ThrottlePolicy>> {
        self.policies.get_or_try_insert_with(target, || {
            let config = self.resolver.resolve(target);
            let call = config.throttled();
            let group = config.throttling();
            group.validate(&target.to_string())?;
            let name = group
                .name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| target.declaring_type().to_owned());

            let semaphore = match group.factory.as_deref() {
                Some(id) => self
                    .locator
                    .semaphore_factory(id)
                    .ok_or_else(|| ControlError::FactoryNotFound {
                        kind: "semaphore",
                        id: id.to_owned(),
                    })?
                    .new_semaphore(target, &name, group.fair, group.permits),
                None => self
                    .defaults
                    .new_semaphore(target, &name, group.fair, group.permits),
            };
            debug!(
                target_id = %target,
                group = %name,
                weight = call.weight,
                timeout = ?call.timeout,
                "throttle policy resolved"
            );
            Ok(ThrottlePolicy {
                target: target.clone(),
                group: name,
                permits: group.permits,
                semaphore,
                weight: call.weight,
                timeout: call.timeout,
            })
        })
    }

    pub fn admit(&self, target: &TargetId) -> Result<Permit> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControlError::Interrupted { operation: "acquire()" });
        }
        self.policy(target)?.admit()
    }

    pub fn run<R>(&self, target: &TargetId, body: impl FnOnce() -> R) -> Result<R> {
        let _permit = self.admit(target)?;
        Ok(body())
    }

    pub fn try_run<R, E>(&self, target: &TargetId, body: impl FnOnce() -> std::result::Result<R, E>) -> Result<R>
    where
        E: Into<BoxError>,
    {
        let _permit = self.admit(target)?;
        body().map_err(ControlError::target)
    }

    /// Семафор группы фабрики по умолчанию.
    pub fn group(&self, name: &str) -> Option<Arc<WeightedSemaphore>> {
        self.defaults.group(name)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.defaults.close_all();
        for (_, policy) in self.policies.values() {
            policy.semaphore.close();
        }
        debug!("throttle coordinator closed");
    }
}
