//! Объявления политик и их разрешение для конкретной цели.
//!
//! Объявление на методе полностью перекрывает объявление на типе (поля не
//! сливаются). Если нет ни того, ни другого, используются значения по умолчанию.
//! Группа троттлинга (`throttling`) разрешается независимо от параметров
//! вызова (`throttled`).

use super::{
    errors::{ControlError, Result},
    pool::{PoolSpec, QueueKind, RejectionPolicy, DEFAULT_POOL},
    target::TargetId,
};
use serde::{Deserialize, Deserializer};
use std::{collections::HashMap, time::Duration};

fn millis<'de, D: Deserializer<'de>>(de: D) -> std::result::Result<Duration, D::Error> {
    u64::deserialize(de).map(Duration::from_millis)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    #[default]
    Read,
    Write,
}

/// Выполнение в именованном пуле.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AsyncDecl {
    pub pool: String,
}

impl Default for AsyncDecl {
    fn default() -> Self {
        Self {
            pool: DEFAULT_POOL.to_owned(),
        }
    }
}

impl AsyncDecl {
    pub fn pool(name: impl Into<String>) -> Self {
        Self { pool: name.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct LockDecl {
    pub operation: Operation,
    pub fair: bool,
    /// Ноль означает ожидание без ограничения.
    #[serde(rename = "timeout_ms", deserialize_with = "millis")]
    pub timeout: Duration,
    /// Идентификатор собственной [`crate::lock::LockFactory`] в локаторе.
    pub factory: Option<String>,
}

impl LockDecl {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            operation: Operation::Write,
            ..Self::default()
        }
    }

    pub fn fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn factory(mut self, id: impl Into<String>) -> Self {
        self.factory = Some(id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ThrottleDecl {
    #[serde(rename = "timeout_ms", deserialize_with = "millis")]
    pub timeout: Duration,
    pub weight: u32,
}

impl Default for ThrottleDecl {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            weight: 1,
        }
    }
}

impl ThrottleDecl {
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Общий семафор: имя группы, число разрешений, честность, фабрика.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GroupDecl {
    pub factory: Option<String>,
    pub fair: bool,
    pub permits: u32,
    /// Без значения берётся имя объявляющего типа.
    pub name: Option<String>,
}

impl Default for GroupDecl {
    fn default() -> Self {
        Self {
            factory: None,
            fair: false,
            permits: 1,
            name: None,
        }
    }
}

impl GroupDecl {
    pub fn permits(permits: u32) -> Self {
        Self {
            permits,
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    pub fn factory(mut self, id: impl Into<String>) -> Self {
        self.factory = Some(id.into());
        self
    }

    /// Группа должна иметь хотя бы одно разрешение.
    pub fn validate(&self, owner: &str) -> Result<()> {
        if self.permits == 0 {
            return Err(ControlError::Config(format!(
                "throttling group of `{owner}` must have at least one permit"
            )));
        }
        Ok(())
    }
}

/// Объявления одного уровня (метод или тип).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Declarations {
    #[serde(rename = "async")]
    pub asynchronous: Option<AsyncDecl>,
    pub locked: Option<LockDecl>,
    pub throttled: Option<ThrottleDecl>,
    pub throttling: Option<GroupDecl>,
}

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_async(mut self, decl: AsyncDecl) -> Self {
        self.asynchronous = Some(decl);
        self
    }

    pub fn with_lock(mut self, decl: LockDecl) -> Self {
        self.locked = Some(decl);
        self
    }

    pub fn with_throttle(mut self, decl: ThrottleDecl) -> Self {
        self.throttled = Some(decl);
        self
    }

    pub fn with_group(mut self, decl: GroupDecl) -> Self {
        self.throttling = Some(decl);
        self
    }
}

/// Все объявления, видимые для одной цели.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub method: Declarations,
    pub declaring_type: Declarations,
}

#[inline]
fn pick<'a, T>(method: &'a Option<T>, declaring_type: &'a Option<T>) -> Option<&'a T> {
    method.as_ref().or(declaring_type.as_ref())
}

impl Config {
    pub fn asynchronous(&self) -> AsyncDecl {
        pick(&self.method.asynchronous, &self.declaring_type.asynchronous)
            .cloned()
            .unwrap_or_default()
    }

    pub fn locked(&self) -> LockDecl {
        pick(&self.method.locked, &self.declaring_type.locked)
            .cloned()
            .unwrap_or_default()
    }

    pub fn throttled(&self) -> ThrottleDecl {
        pick(&self.method.throttled, &self.declaring_type.throttled)
            .cloned()
            .unwrap_or_default()
    }

    pub fn throttling(&self) -> GroupDecl {
        pick(&self.method.throttling, &self.declaring_type.throttling)
            .cloned()
            .unwrap_or_default()
    }
}

/// Источник объявлений для целей.
pub trait ConfigResolver: Send + Sync {
    fn resolve(&self, target: &TargetId) -> Config;
}

impl<F> ConfigResolver for F
where
    F: Fn(&TargetId) -> Config + Send + Sync,
{
    fn resolve(&self, target: &TargetId) -> Config {
        self(target)
    }
}

/// Таблица явных объявлений: по типу и по методу.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    types: HashMap<String, Declarations>,
    methods: HashMap<(String, String), Declarations>,
    pools: Vec<PoolSpec>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, declaring_type: impl Into<String>, decls: Declarations) -> Self {
        self.declare_type(declaring_type, decls);
        self
    }

    pub fn with_method(
        mut self,
        declaring_type: impl Into<String>,
        method: impl Into<String>,
        decls: Declarations,
    ) -> Self {
        self.declare_method(declaring_type, method, decls);
        self
    }

    pub fn with_pool(mut self, spec: PoolSpec) -> Self {
        self.pools.push(spec);
        self
    }

    pub fn declare_type(&mut self, declaring_type: impl Into<String>, decls: Declarations) {
        self.types.insert(declaring_type.into(), decls);
    }

    pub fn declare_method(
        &mut self,
        declaring_type: impl Into<String>,
        method: impl Into<String>,
        decls: Declarations,
    ) {
        self.methods
            .insert((declaring_type.into(), method.into()), decls);
    }

    /// Спецификации пулов, объявленные в каталоге.
    pub fn pool_specs(&self) -> &[PoolSpec] {
        &self.pools
    }

    pub(crate) fn take_pool_specs(&mut self) -> Vec<PoolSpec> {
        std::mem::take(&mut self.pools)
    }

    /// Загружает каталог из TOML.
    ///
    /// ```toml
    /// [[pool]]
    /// name = "io"
    /// core = 2
    /// max = 4
    /// queue = 64
    /// rejection = "caller_runs"
    ///
    /// [[type]]
    /// name = "app::Store"
    /// throttling = { permits = 2 }
    ///
    /// [[method]]
    /// type = "app::Store"
    /// name = "write"
    /// locked = { operation = "write", timeout_ms = 1000 }
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: CatalogFile =
            toml::from_str(source).map_err(|err| ControlError::Config(err.to_string()))?;

        let mut catalog = Catalog::new();
        for entry in file.types {
            if let Some(group) = &entry.decls.throttling {
                group.validate(&entry.name)?;
            }
            catalog.declare_type(entry.name, entry.decls);
        }
        for entry in file.methods {
            if let Some(group) = &entry.decls.throttling {
                group.validate(&format!("{}::{}", entry.declaring_type, entry.name))?;
            }
            catalog.declare_method(entry.declaring_type, entry.name, entry.decls);
        }
        for entry in file.pools {
            catalog.pools.push(entry.into_spec()?);
        }
        Ok(catalog)
    }
}

impl ConfigResolver for Catalog {
    fn resolve(&self, target: &TargetId) -> Config {
        let key = (
            target.declaring_type().to_owned(),
            target.method().to_owned(),
        );
        Config {
            method: self.methods.get(&key).cloned().unwrap_or_default(),
            declaring_type: self
                .types
                .get(target.declaring_type())
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "pool")]
    pools: Vec<PoolEntry>,
    #[serde(default, rename = "type")]
    types: Vec<TypeEntry>,
    #[serde(default, rename = "method")]
    methods: Vec<MethodEntry>,
}

#[derive(Deserialize)]
struct TypeEntry {
    name: String,
    #[serde(flatten)]
    decls: Declarations,
}

#[derive(Deserialize)]
struct MethodEntry {
    #[serde(rename = "type")]
    declaring_type: String,
    name: String,
    #[serde(flatten)]
    decls: Declarations,
}

#[derive(Deserialize)]
struct PoolEntry {
    name: String,
    core: Option<usize>,
    max: Option<usize>,
    #[serde(default, deserialize_with = "millis")]
    keep_alive_ms: Duration,
    /// Ёмкость очереди; без значения очередь неограниченная.
    queue: Option<usize>,
    #[serde(default)]
    rejection: RejectionPolicy,
    #[serde(default, deserialize_with = "millis")]
    shutdown_grace_ms: Duration,
}

impl PoolEntry {
    fn into_spec(self) -> Result<PoolSpec> {
        let mut builder = PoolSpec::builder(self.name)
            .with_keep_alive(self.keep_alive_ms)
            .with_rejection(self.rejection)
            .with_shutdown_grace(self.shutdown_grace_ms);
        if let Some(core) = self.core {
            builder = builder.with_core(core);
        }
        if let Some(max) = self.max {
            builder = builder.with_max(max);
        }
        if let Some(capacity) = self.queue {
            builder = builder.with_work_queue(QueueKind::Bounded(capacity));
        }
        builder.build()
    }
}
