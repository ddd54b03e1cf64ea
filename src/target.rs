use std::{fmt, sync::Arc};

/// Что возвращает цель: обычное значение или отложенный результат.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnKind {
    #[default]
    Value,
    /// Promise-подобный хэндл (см. [`crate::handle::Deferred`]).
    Deferred,
}

/// Стабильная идентичность управляемого вызова: тип, метод, вид результата.
///
/// Используется как ключ кэша политик, поэтому должна совпадать между вызовами.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetId {
    declaring_type: Arc<str>,
    method: Arc<str>,
    returns: ReturnKind,
}

impl TargetId {
    pub fn new(declaring_type: impl Into<Arc<str>>, method: impl Into<Arc<str>>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            method: method.into(),
            returns: ReturnKind::Value,
        }
    }

    /// Цель, объявленная как возвращающая отложенный результат.
    pub fn deferred(declaring_type: impl Into<Arc<str>>, method: impl Into<Arc<str>>) -> Self {
        Self::new(declaring_type, method).returning(ReturnKind::Deferred)
    }

    pub fn returning(mut self, returns: ReturnKind) -> Self {
        self.returns = returns;
        self
    }

    #[inline]
    pub fn declaring_type(&self) -> &str {
        &self.declaring_type
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn returns(&self) -> ReturnKind {
        self.returns
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type, self.method)
    }
}
