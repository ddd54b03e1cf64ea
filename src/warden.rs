use super::{
    config::{Catalog, ConfigResolver},
    dispatch::AsyncDispatcher,
    locator::{ServiceLocator, Services},
    lock::LockCoordinator,
    pool::PoolSpec,
    registry::PoolRegistry,
    throttle::ThrottleCoordinator,
};
use std::sync::Arc;
use tracing::info;

/// Собранный слой управления: реестр пулов и три координатора,
/// разделяющие один источник объявлений и один локатор фабрик.
///
/// Создаётся явно и передаётся по ссылке; [`Warden::shutdown`] завершает
/// жизненный цикл.
pub struct Warden {
    pools: Arc<PoolRegistry>,
    locks: LockCoordinator,
    throttles: ThrottleCoordinator,
    dispatcher: AsyncDispatcher,
}

#[derive(Default)]
pub struct WardenBuilder {
    resolver: Option<Arc<dyn ConfigResolver>>,
    locator: Option<Arc<dyn ServiceLocator>>,
    pools: Vec<PoolSpec>,
}

impl WardenBuilder {
    pub fn resolver(mut self, resolver: impl ConfigResolver + 'static) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Каталог служит источником объявлений, его пулы регистрируются в реестре.
    pub fn catalog(mut self, mut catalog: Catalog) -> Self {
        self.pools.extend(catalog.take_pool_specs());
        self.resolver = Some(Arc::new(catalog));
        self
    }

    pub fn locator(mut self, locator: impl ServiceLocator + 'static) -> Self {
        self.locator = Some(Arc::new(locator));
        self
    }

    pub fn pool(mut self, spec: PoolSpec) -> Self {
        self.pools.push(spec);
        self
    }

    pub fn build(self) -> Warden {
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(Catalog::new()) as Arc<dyn ConfigResolver>);
        let locator = self
            .locator
            .unwrap_or_else(|| Arc::new(Services::new()) as Arc<dyn ServiceLocator>);

        let pools = Arc::new(PoolRegistry::new());
        for spec in self.pools {
            pools.register(spec);
        }

        Warden {
            locks: LockCoordinator::new(resolver.clone(), locator.clone()),
            throttles: ThrottleCoordinator::new(resolver.clone(), locator),
            dispatcher: AsyncDispatcher::new(resolver, pools.clone()),
            pools,
        }
    }
}

impl Warden {
    pub fn builder() -> WardenBuilder {
        WardenBuilder::default()
    }

    #[inline]
    pub fn pools(&self) -> &Arc<PoolRegistry> {
        &self.pools
    }

    #[inline]
    pub fn locks(&self) -> &LockCoordinator {
        &self.locks
    }

    #[inline]
    pub fn throttles(&self) -> &ThrottleCoordinator {
        &self.throttles
    }

    #[inline]
    pub fn dispatcher(&self) -> &AsyncDispatcher {
        &self.dispatcher
    }

    /// Прерывает бессрочные ожидания блокировок и разрешений,
    /// затем останавливает пулы. Возвращает пулы, не уложившиеся в grace.
    pub fn shutdown(&self) -> Vec<String> {
        self.locks.close();
        self.throttles.close();
        let stuck = self.pools.shutdown_all();
        info!(stuck = ?stuck, "warden shut down");
        stuck
    }
}
