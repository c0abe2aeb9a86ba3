//! 动态分派缓存。
//!
//! # 模块定位（Why）
//! - Buffer 要在大多数场景下“看起来像字符串”：`buff:s_upper()` 这类调用应转发到外部 string 库，
//!   而缓冲库在打开时并不知道宿主之后会往 string 库里加什么函数；
//! - 因此对以 [`DELEGATION_PREFIX`] 开头的未知成员做惰性解析：首次查找时包装出适配器，
//!   同时写入元表与模块表，之后的查找直接命中缓存。
//!
//! # 执行逻辑（How）
//! 1. 名字在元表中原样存在 → 直接返回（内置方法与已安装的适配器）；
//! 2. 名字以 `s_` 开头，且 string 库中去掉前缀后的条目是函数 → 生成适配器并安装；
//! 3. 其余情况返回 `None`，不写入任何条目，下一次查找会重新尝试。
//!
//! # 契约说明（What）
//! - 同名适配器至多安装一次：安装走 `DashMap` 的 entry API，并发查找只会有一个线程创建适配器；
//! - 元表与模块表中的适配器是同一个函数对象（[`crate::NativeFunction::ptr_eq`] 为真）；
//! - 适配器只读取缓冲的物化快照，从不修改缓冲；外部函数的全部返回值原样透传。

use alloc::{format, string::String, sync::Arc, vec::Vec};
use core::fmt;

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, trace};

use crate::{
    error::Result,
    ops::check_buffer,
    strlib::StringLibrary,
    value::{NativeFunction, Value},
};

/// 委派标记前缀。
pub const DELEGATION_PREFIX: &str = "s_";

/// 以名字为键的并发分派表，元表与模块表共用这一结构。
#[derive(Debug, Default)]
pub struct DispatchTable {
    entries: DashMap<Arc<str>, Value>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// 覆盖写入，返回旧值。
    pub fn set(&self, name: &str, value: Value) -> Option<Value> {
        self.entries.insert(Arc::from(name), value)
    }

    /// 仅在名字缺失时写入 `make()` 的结果。
    ///
    /// 返回表中最终的值，以及本次调用是否执行了写入。`make` 在持有分片写锁期间执行，
    /// 不得回访同一张表。
    pub fn install_once(&self, name: &str, make: impl FnOnce() -> Value) -> (Value, bool) {
        match self.entries.entry(Arc::from(name)) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let value = make();
                vacant.insert(value.clone());
                (value, true)
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 全部键名，按字典序排列。
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .map(|entry| String::from(entry.key().as_ref()))
            .collect();
        names.sort_unstable();
        names
    }
}

/// 元表、模块表与外部 string 库的组合，负责 `s_` 成员的解析与缓存。
pub struct DispatchCache {
    metatable: DispatchTable,
    module: DispatchTable,
    library: Option<Arc<dyn StringLibrary>>,
}

impl DispatchCache {
    /// 组装缓存。`library` 为 `None` 时所有委派查找都返回 `None`。
    pub fn new(
        metatable: DispatchTable,
        module: DispatchTable,
        library: Option<Arc<dyn StringLibrary>>,
    ) -> Self {
        Self {
            metatable,
            module,
            library,
        }
    }

    pub fn metatable(&self) -> &DispatchTable {
        &self.metatable
    }

    pub fn module(&self) -> &DispatchTable {
        &self.module
    }

    pub fn library(&self) -> Option<&Arc<dyn StringLibrary>> {
        self.library.as_ref()
    }

    /// 解析成员名。
    ///
    /// 命中元表时直接返回；`s_` 名字在 string 库中有对应函数时安装并返回适配器；
    /// 其余情况返回 `None`。
    pub fn resolve(&self, name: &str) -> Option<Value> {
        if let Some(found) = self.metatable.get(name) {
            return Some(found);
        }

        let external = name
            .strip_prefix(DELEGATION_PREFIX)
            .and_then(|target| self.library.as_ref()?.get(target));
        match external {
            Some(Value::Function(function)) => Some(self.install(name, function).0),
            _ => {
                trace!(name, "bufflib member not resolved");
                None
            }
        }
    }

    /// 为 string 库中的每个函数安装 `s_` 适配器，返回新安装的数量。
    pub fn install_all(&self) -> usize {
        let Some(library) = self.library.as_ref() else {
            return 0;
        };
        let mut installed = 0;
        for (target, value) in library.entries() {
            let Value::Function(function) = value else {
                continue;
            };
            let name = format!("{DELEGATION_PREFIX}{target}");
            if !self.metatable.contains(&name) && self.install(&name, function).1 {
                installed += 1;
            }
        }
        debug!(installed, "bufflib eager delegation finished");
        installed
    }

    /// 安装 `name` 的适配器，返回表中的适配器以及本次调用是否创建了它。
    fn install(&self, name: &str, external: NativeFunction) -> (Value, bool) {
        let (adapter, created) = self
            .metatable
            .install_once(name, || Value::Function(delegate(name, external)));
        if created {
            self.module.install_once(name, || adapter.clone());
            debug!(name, "bufflib delegation installed");
        }
        (adapter, created)
    }
}

impl fmt::Debug for DispatchCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCache")
            .field("metatable", &self.metatable.len())
            .field("module", &self.module.len())
            .field("library", &self.library.is_some())
            .finish()
    }
}

/// 包装外部函数：第一个参数必须是 Buffer，替换为其物化快照后连同其余参数一起转发。
fn delegate(name: &str, external: NativeFunction) -> NativeFunction {
    let adapter_name = String::from(name);
    NativeFunction::new(adapter_name.clone(), move |args: &[Value]| -> Result<Vec<Value>> {
        let buffer = check_buffer(&adapter_name, args, 1)?;
        let mut forwarded = Vec::with_capacity(args.len());
        forwarded.push(Value::Str(buffer.materialize()));
        forwarded.extend_from_slice(&args[1..]);
        external.call(&forwarded)
    })
}
