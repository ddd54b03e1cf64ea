//! Слой управления конкурентностью для произвольных вызовов
//!
//! # Features
//! - Выполнение в именованных пулах потоков с отменяемым хэндлом
//! - Read/write блокировки по областям с ограниченным ожиданием
//! - Взвешенный троттлинг по именованным группам
//! - Объявления на уровне метода перекрывают объявления на уровне типа
//! - Политики строятся один раз на цель и кэшируются
//! - Собственные фабрики блокировок и семафоров через локатор
//! - Корректная остановка пулов с grace-периодом

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod handle;
pub mod locator;
pub mod lock;
pub mod model;
pub mod pool;
pub mod registry;
pub mod rwlock;
pub mod semaphore;
pub mod target;
pub mod throttle;
pub mod warden;
mod wait_queue;

pub use config::{
    AsyncDecl, Catalog, Config, ConfigResolver, Declarations, GroupDecl, LockDecl, Operation,
    ThrottleDecl,
};
pub use dispatch::AsyncDispatcher;
pub use errors::{BoxError, ControlError, Result};
pub use handle::{Completer, Deferred, DispatchHandle, Promise};
pub use locator::{ServiceLocator, Services};
pub use lock::{LockCoordinator, LockFactory, LockGuard};
pub use pool::{Pool, PoolSpec, QueueKind, RejectionPolicy, WorkerPool, DEFAULT_POOL};
pub use registry::PoolRegistry;
pub use target::{ReturnKind, TargetId};
pub use throttle::{Permit, SemaphoreFactory, ThrottleCoordinator};
pub use warden::Warden;
