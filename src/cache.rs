//! Реестр "ключ → лениво построенное значение", только на добавление.
//!
//! Используется для кэша политик, областей блокировок, групп троттлинга
//! и пулов: конкурентные первые обращения к одному ключу видят ровно одно
//! построение, все получают один и тот же `Arc<V>`.

use parking_lot::{Mutex, RwLock};
use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::Hash,
    sync::Arc,
};

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

pub struct OnceMap<K, V> {
    slots: RwLock<HashMap<K, Slot<V>>>,
}

impl<K, V> Default for OnceMap<K, V> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> OnceMap<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let slot = self.slots.read().get(key).cloned()?;
        let value = slot.lock().clone();
        value
    }

    #[inline]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.get(key).is_some()
    }

    /// Возвращает значение для `key`, строя его не более одного раза.
    ///
    /// Пока один поток строит значение, остальные ждут на слоте ключа;
    /// другие ключи не блокируются. Неудачное построение не кэшируется,
    /// следующий вызов попробует снова.
    pub fn get_or_try_insert_with<E, F>(&self, key: &K, build: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock();
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let value = Arc::new(build()?);
        *guard = Some(value.clone());
        Ok(value)
    }

    pub fn get_or_insert_with<F>(&self, key: &K, build: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        match self.get_or_try_insert_with::<std::convert::Infallible, _>(key, || Ok(build())) {
            Ok(value) => value,
            Err(never) => match never {},
        }
    }

    /// Снимок всех построенных значений.
    pub fn values(&self) -> Vec<(K, Arc<V>)> {
        let slots: Vec<(K, Slot<V>)> = self
            .slots
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(k, s)| s.lock().clone().map(|v| (k, v)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, key: &K) -> Slot<V> {
        if let Some(slot) = self.slots.read().get(key) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }
}
