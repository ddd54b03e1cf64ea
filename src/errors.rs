//! Ошибки слоя управления конкурентностью.
//!
//! Все операции крейта возвращают [`ControlError`]. Ошибки самой цели
//! (тела вызова) заворачиваются ровно один раз в [`ControlError::Target`].

use std::time::Duration;
use thiserror::Error;

/// Ошибка, которую может вернуть тело цели.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, ControlError>;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ControlError {
    /// Цель не может быть обслужена этой политикой (например, dispatch
    /// для метода, который не возвращает отложенный результат).
    #[error("invalid usage of {target}: {reason}")]
    InvalidUsage { target: String, reason: String },

    /// Реестр пулов уже начал остановку.
    #[error("pool `{name}` not available: registry is shut down")]
    PoolUnavailable { name: String },

    /// Пул отказался принять задачу (политика Abort или пул остановлен).
    #[error("pool `{pool}` rejected the task: {reason}")]
    Rejected { pool: String, reason: String },

    #[error("can't lock for {target} in {timeout:?}")]
    LockTimeout { target: String, timeout: Duration },

    #[error("can't acquire {weight} permits for {target} in {timeout:?}")]
    AcquireTimeout {
        target: String,
        weight: u32,
        timeout: Duration,
    },

    /// Бессрочное ожидание было прервано; состояние не восстанавливается.
    #[error("{operation} interrupted")]
    Interrupted { operation: &'static str },

    #[error("no {kind} factory registered as `{id}`")]
    FactoryNotFound { kind: &'static str, id: String },

    #[error("cancelled")]
    Cancelled,

    /// Результат обещания уже забран (например, повторный poll после `Ready`).
    #[error("result already taken")]
    Consumed,

    #[error("panic in controlled task: {0}")]
    Panicked(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Ошибка тела цели, без дополнительных обёрток.
    #[error(transparent)]
    Target(BoxError),
}

impl ControlError {
    /// Поднимает ошибку тела цели на уровень [`ControlError`].
    ///
    /// Если тело уже вернуло `ControlError` (например, вложенный dispatch),
    /// она пробрасывается как есть, без второй обёртки.
    pub fn from_target(err: BoxError) -> Self {
        match err.downcast::<ControlError>() {
            Ok(own) => *own,
            Err(foreign) => ControlError::Target(foreign),
        }
    }

    pub fn target(err: impl Into<BoxError>) -> Self {
        Self::from_target(err.into())
    }

    /// Короткая стабильная метка для логов.
    pub fn as_label(&self) -> &'static str {
        match self {
            ControlError::InvalidUsage { .. } => "invalid_usage",
            ControlError::PoolUnavailable { .. } => "pool_unavailable",
            ControlError::Rejected { .. } => "rejected",
            ControlError::LockTimeout { .. } => "lock_timeout",
            ControlError::AcquireTimeout { .. } => "acquire_timeout",
            ControlError::Interrupted { .. } => "interrupted",
            ControlError::FactoryNotFound { .. } => "factory_not_found",
            ControlError::Cancelled => "cancelled",
            ControlError::Consumed => "consumed",
            ControlError::Panicked(_) => "panicked",
            ControlError::Config(_) => "config",
            ControlError::Target(_) => "target_failed",
        }
    }

    /// Таймауты ожидания безопасно повторять: ресурс не захвачен, тело не вызывалось.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::LockTimeout { .. } | ControlError::AcquireTimeout { .. }
        )
    }
}
