use super::{lock::LockFactory, throttle::SemaphoreFactory};
use std::{collections::HashMap, sync::Arc};

/// Поиск собственных фабрик по идентификатору из объявления.
pub trait ServiceLocator: Send + Sync {
    fn lock_factory(&self, id: &str) -> Option<Arc<dyn LockFactory>>;

    fn semaphore_factory(&self, id: &str) -> Option<Arc<dyn SemaphoreFactory>>;
}

/// Локатор на явной таблице регистраций.
#[derive(Default, Clone)]
pub struct Services {
    locks: HashMap<String, Arc<dyn LockFactory>>,
    semaphores: HashMap<String, Arc<dyn SemaphoreFactory>>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_lock_factory(mut self, id: impl Into<String>, factory: impl LockFactory + 'static) -> Self {
        self.locks.insert(id.into(), Arc::new(factory));
        self
    }

    pub fn with_semaphore_factory(
        mut self,
        id: impl Into<String>,
        factory: impl SemaphoreFactory + 'static,
    ) -> Self {
        self.semaphores.insert(id.into(), Arc::new(factory));
        self
    }
}

impl ServiceLocator for Services {
    fn lock_factory(&self, id: &str) -> Option<Arc<dyn LockFactory>> {
        self.locks.get(id).cloned()
    }

    fn semaphore_factory(&self, id: &str) -> Option<Arc<dyn SemaphoreFactory>> {
        self.semaphores.get(id).cloned()
    }
}
