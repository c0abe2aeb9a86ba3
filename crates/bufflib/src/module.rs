//! 打开后的缓冲库实例。
//!
//! # 模块定位（Why）
//! - 宿主打开缓冲库时需要两张表：Buffer 的元表（元方法、方法、`__index` 回退）与导出的模块表；
//!   两者连同分派缓存、存储统计一起由 [`BuffLib`] 持有，生命周期与打开的模块一致；
//! - 宿主的两种调用语法都经由这里：库调用 `bufflib.name(buff, ...)` 走 [`BuffLib::call`]，
//!   方法调用 `buff:name(...)` 走 [`BuffLib::invoke`]。
//!
//! # 契约说明（What）
//! - 元表包含 `__concat`、`__eq`、`__len`、`__tostring`、`__gc`、`__index` 以及 `add`、`addsep`、`reset`；
//! - 模块表包含 `add`、`addsep`、`equal`、`concat`、`length`、`new`、`reset`、`tostring`、
//!   `isbuffer`、`buffersize`，以及已安装的 `s_*` 适配器；
//! - `append`/`append_separated` 是 `add`/`addsep` 的别名，`default_capacity` 是 `buffersize` 的别名；
//! - `buffersize` 仅供查看，改写它不影响新缓冲的初始容量；
//! - 没有 string 库时打开同样成功，只是不会出现任何 `s_*` 成员。

use alloc::{
    sync::{Arc, Weak},
    vec,
    vec::Vec,
};

use tracing::debug;

use crate::{
    buffer::{Buffer, BufferRef},
    config::{BuffConfig, ConfigError},
    dispatch::{DispatchCache, DispatchTable},
    error::{BuffError, Result},
    ops,
    store::{INITIAL_CAPACITY, StoreContext, StoreLedger, StoreStats},
    strlib::StringLibrary,
    value::{NativeFunction, Value},
};

/// 元表中的内置成员。
const METATABLE_ENTRIES: &[(&str, fn(&[Value]) -> Result<Vec<Value>>)] = &[
    ("__concat", ops::concat),
    ("__eq", ops::equal),
    ("__len", ops::length),
    ("__tostring", ops::tostring),
    ("__gc", ops::collect),
    ("add", ops::add),
    ("append", ops::add),
    ("addsep", ops::addsep),
    ("append_separated", ops::addsep),
    ("reset", ops::reset),
];

/// 模块表中的内置函数（`new` 需要捕获分配环境，单独安装）。
const MODULE_ENTRIES: &[(&str, fn(&[Value]) -> Result<Vec<Value>>)] = &[
    ("add", ops::add),
    ("append", ops::add),
    ("addsep", ops::addsep),
    ("append_separated", ops::addsep),
    ("equal", ops::equal),
    ("concat", ops::concat),
    ("length", ops::length),
    ("reset", ops::reset),
    ("tostring", ops::tostring),
    ("isbuffer", ops::isbuffer),
];

/// 打开后的缓冲库。
///
/// # 教案式说明
/// - **意图 (Why)**：把“进程级全局表”改为显式状态，宿主可以同时打开多个互不干扰的实例；
/// - **契约 (What)**：
///   - 同一实例创建的缓冲共享一个 [`StoreLedger`]，[`BuffLib::stats`] 反映它们的堆存储使用情况；
///   - 实例可以在线程间共享（`Send + Sync`），分派表的写入是并发安全的；
/// - **风险 (Trade-offs)**：元表的 `__index` 只持有分派缓存的弱引用，实例销毁后残留的
///   `__index` 句柄返回 `nil`。
#[derive(Debug)]
pub struct BuffLib {
    cache: Arc<DispatchCache>,
    context: StoreContext,
    ledger: Arc<StoreLedger>,
    config: BuffConfig,
}

impl BuffLib {
    /// 以默认配置打开。
    pub fn open(library: Option<Arc<dyn StringLibrary>>) -> Self {
        let ledger = Arc::new(StoreLedger::new());
        let context = StoreContext::default().with_recycler(ledger.clone());
        Self::build(BuffConfig::default(), context, ledger, library)
    }

    /// 以指定配置打开：先校验配置，再构建元表与模块表，按配置执行预装委派。
    ///
    /// # 错误
    /// - `max_capacity` 不在 `[INITIAL_CAPACITY, ALLOCATION_CEILING]` 内时返回
    ///   [`ConfigError::MaxCapacityOutOfRange`]，不会静默截断。
    pub fn open_with(
        config: BuffConfig,
        library: Option<Arc<dyn StringLibrary>>,
    ) -> Result<Self, ConfigError> {
        let config = config.validate()?;
        let ledger = Arc::new(StoreLedger::new());
        let context = StoreContext::from_config(&config, ledger.clone())?;
        Ok(Self::build(config, context, ledger, library))
    }

    fn build(
        config: BuffConfig,
        context: StoreContext,
        ledger: Arc<StoreLedger>,
        library: Option<Arc<dyn StringLibrary>>,
    ) -> Self {
        let has_library = library.is_some();

        let cache = Arc::new_cyclic(|weak: &Weak<DispatchCache>| {
            DispatchCache::new(
                build_metatable(weak.clone()),
                build_module(context.clone()),
                library,
            )
        });

        let delegated = if config.eager_delegation {
            cache.install_all()
        } else {
            0
        };
        debug!(
            has_library,
            eager = config.eager_delegation,
            delegated,
            limit = context.limit(),
            "bufflib opened"
        );

        Self {
            cache,
            context,
            ledger,
            config,
        }
    }

    /// 创建新缓冲并依次追加 `values`。
    pub fn new_buffer(&self, values: &[Value]) -> Result<BufferRef> {
        let buffer = BufferRef::new(Buffer::with_context(self.context.clone()));
        buffer.append(values)?;
        Ok(buffer)
    }

    /// 库调用语法：`bufflib.name(args...)`。
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        match self.cache.module().get(name) {
            Some(Value::Function(function)) => function.call(args),
            _ => Err(not_callable(name)),
        }
    }

    /// 元表 `__index` 路径：内置方法、已安装或可惰性安装的 `s_*` 适配器。
    pub fn index(&self, name: &str) -> Option<Value> {
        self.cache.resolve(name)
    }

    /// 方法调用语法：`buffer:name(args...)`。
    pub fn invoke(&self, buffer: &BufferRef, name: &str, args: &[Value]) -> Result<Vec<Value>> {
        let Some(Value::Function(method)) = self.index(name) else {
            return Err(not_callable(name));
        };
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(Value::Buffer(buffer.clone()));
        full.extend_from_slice(args);
        method.call(&full)
    }

    /// 读取模块表字段。
    pub fn get_field(&self, name: &str) -> Option<Value> {
        self.cache.module().get(name)
    }

    /// 写入模块表字段，返回旧值。
    pub fn set_field(&self, name: &str, value: Value) -> Option<Value> {
        self.cache.module().set(name, value)
    }

    pub fn metatable(&self) -> &DispatchTable {
        self.cache.metatable()
    }

    pub fn module_table(&self) -> &DispatchTable {
        self.cache.module()
    }

    pub fn dispatch(&self) -> &DispatchCache {
        &self.cache
    }

    /// 本实例创建的缓冲的堆存储统计。
    pub fn stats(&self) -> StoreStats {
        self.ledger.snapshot()
    }

    pub fn config(&self) -> &BuffConfig {
        &self.config
    }
}

fn not_callable(name: &str) -> BuffError {
    BuffError::NotCallable {
        name: name.into(),
    }
}

fn build_metatable(cache: Weak<DispatchCache>) -> DispatchTable {
    let metatable = DispatchTable::new();
    for (name, function) in METATABLE_ENTRIES {
        metatable.set(name, Value::Function(NativeFunction::new(*name, *function)));
    }

    // `__index(buffer, key)`：非字符串键或解析失败都返回 nil。
    let index = NativeFunction::new("__index", move |args: &[Value]| {
        let resolved = args
            .get(1)
            .and_then(Value::as_bytes)
            .and_then(|key| core::str::from_utf8(key).ok())
            .zip(cache.upgrade())
            .and_then(|(key, cache)| cache.resolve(key));
        Ok(vec![resolved.unwrap_or_default()])
    });
    metatable.set("__index", Value::Function(index));
    metatable
}

fn build_module(context: StoreContext) -> DispatchTable {
    let module = DispatchTable::new();
    for (name, function) in MODULE_ENTRIES {
        module.set(name, Value::Function(NativeFunction::new(*name, *function)));
    }

    let constructor = NativeFunction::new("new", move |args: &[Value]| {
        let buffer = BufferRef::new(Buffer::with_context(context.clone()));
        buffer.append(args)?;
        Ok(vec![Value::Buffer(buffer)])
    });
    module.set("new", Value::Function(constructor));
    module.set("buffersize", Value::from(INITIAL_CAPACITY));
    module.set("default_capacity", Value::from(INITIAL_CAPACITY));
    module
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strlib::StringTable;

    #[test]
    fn opens_without_string_library() {
        let lib = BuffLib::open(None);
        assert!(lib.metatable().contains("__index"));
        assert!(lib.module_table().names().iter().all(|name| !name.starts_with("s_")));
        assert!(lib.index("s_upper").is_none());
    }

    #[test]
    fn eager_delegation_populates_module_table() {
        let lib = BuffLib::open(Some(StringTable::standard().shared()));
        for name in ["s_len", "s_upper", "s_find"] {
            assert!(lib.get_field(name).is_some(), "{name} 应已预装");
            assert!(lib.metatable().contains(name));
        }
    }

    #[test]
    fn lazy_delegation_waits_for_first_lookup() {
        let config = BuffConfig::default().with_eager_delegation(false);
        let lib = BuffLib::open_with(config, Some(StringTable::standard().shared()))
            .expect("配置有效");
        assert!(lib.get_field("s_upper").is_none());

        let buffer = lib.new_buffer(&[Value::from("abc")]).expect("创建缓冲");
        let out = lib.invoke(&buffer, "s_upper", &[]).expect("方法调用");
        assert_eq!(out, vec![Value::from("ABC")]);
        assert!(lib.get_field("s_upper").is_some());
    }

    #[test]
    fn index_metamethod_resolves_through_cache() {
        let lib = BuffLib::open(Some(StringTable::standard().shared()));
        let index = lib.metatable().get("__index").expect("__index");
        let buffer = Value::Buffer(lib.new_buffer(&[]).expect("创建缓冲"));
        let out = index
            .as_function()
            .expect("函数")
            .call(&[buffer.clone(), Value::from("s_len")])
            .expect("__index 调用");
        assert!(out[0].as_function().is_some());

        let miss = index
            .as_function()
            .expect("函数")
            .call(&[buffer, Value::from("nothing")])
            .expect("__index 调用");
        assert_eq!(miss, vec![Value::Nil]);
    }

    #[test]
    fn unknown_members_are_not_callable() {
        let lib = BuffLib::open(None);
        let err = lib.call("nothing", &[]).expect_err("不存在的函数");
        assert_eq!(err.code(), crate::error::codes::NOT_CALLABLE);
        let err = lib.call("buffersize", &[]).expect_err("常量不可调用");
        assert_eq!(
            err.to_string(),
            "attempt to call member 'buffersize' (not a function)"
        );
    }

    #[test]
    fn buffersize_is_informational() {
        let lib = BuffLib::open(None);
        assert_eq!(lib.get_field("buffersize"), Some(Value::Integer(1024)));
        assert_eq!(lib.get_field("default_capacity"), Some(Value::Integer(1024)));
        lib.set_field("buffersize", Value::Integer(16));
        lib.set_field("default_capacity", Value::Integer(16));
        let buffer = lib.new_buffer(&[]).expect("创建缓冲");
        assert_eq!(buffer.capacity(), INITIAL_CAPACITY);
    }

    #[test]
    fn open_with_rejects_out_of_range_limit() {
        let err = BuffLib::open_with(BuffConfig::default().with_max_capacity(16), None)
            .expect_err("上限低于内联容量");
        assert!(matches!(
            err,
            ConfigError::MaxCapacityOutOfRange { max_capacity: 16, .. }
        ));

        let lib = BuffLib::open(None);
        assert_eq!(lib.config().max_capacity, crate::config::ALLOCATION_CEILING);
    }
}
