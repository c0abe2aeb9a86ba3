//! 缓冲对象。
//!
//! # 模块定位（Why）
//! - [`Buffer`] 把 [`BackingStore`] 与已用长度组合成可追加的字节序列，
//!   反复追加的总成本为线性，而不是不可变字符串拼接的平方级；
//! - [`BufferRef`] 是宿主值里持有的共享句柄（`Arc<spin::Mutex<Buffer>>`），
//!   负责值级别的追加：先做宿主 `tostring` 转换，再短暂加锁拷贝字节。
//!
//! # 契约说明（What）
//! - `len` 只在追加时增长，`reset` 将其归零并释放堆存储；
//! - 长度按字节计数，内嵌 `\0` 逐个计入；
//! - 每次字节拷贝要么整体成功，要么失败且缓冲不变；值序列追加在第 `i` 项失败时，
//!   前 `i` 项已经写入；
//! - 句柄不会在持锁期间执行 `tostring` 转换或外部调用，因此缓冲可以追加自身。
//!
//! # 风险提示（Trade-offs）
//! - [`concat`] 在两个操作数都是 Buffer 时返回新缓冲；只有一侧是 Buffer 时原地修改该缓冲
//!   并返回它。这与不可变字符串的 `..` 语义不同：`b .. "x"` 之后 `b` 本身已经包含 `"x"`。

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use bytes::Bytes;
use spin::Mutex;
use tracing::debug;

use crate::{
    error::{BuffError, Result},
    store::{BackingStore, StoreContext},
    value::Value,
};

/// 可增长字节缓冲。
pub struct Buffer {
    store: BackingStore,
    len: usize,
}

impl Buffer {
    /// 使用默认分配环境创建空缓冲。
    pub fn new() -> Self {
        Self::with_context(StoreContext::default())
    }

    /// 在给定分配环境下创建空缓冲，容量为内联初始容量。
    pub fn with_context(context: StoreContext) -> Self {
        Self {
            store: BackingStore::new(context),
            len: 0,
        }
    }

    /// 已写入字节数。
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 当前后备存储的声明容量。
    pub fn capacity(&self) -> usize {
        self.store.capacity()
    }

    /// 当前是否仍使用内联存储。
    pub fn is_inline(&self) -> bool {
        self.store.is_inline()
    }

    /// 已写入内容的只读视图。
    pub fn as_bytes(&self) -> &[u8] {
        self.store.filled(self.len)
    }

    /// 物化当前内容：返回与缓冲不共享存储的不可变拷贝。
    pub fn materialize(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    /// 确保还能追加 `additional` 字节而无需再次扩容。
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        self.store.ensure_capacity(self.len, additional).map(|_| ())
    }

    /// 追加一段字节。
    pub fn push_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.push_parts(&[src])
    }

    /// 以一次容量检查追加多段字节，总长度用 checked 加法计算。
    ///
    /// 失败时不写入任何一段。
    pub fn push_parts(&mut self, parts: &[&[u8]]) -> Result<()> {
        let total = parts
            .iter()
            .try_fold(0usize, |acc, part| acc.checked_add(part.len()))
            .ok_or(BuffError::AllocationTooLarge {
                used: self.len,
                additional: usize::MAX,
                limit: self.store.context().limit(),
            })?;
        let window = self.store.ensure_capacity(self.len, total)?;
        let mut offset = 0;
        for part in parts {
            window[offset..offset + part.len()].copy_from_slice(part);
            offset += part.len();
        }
        self.len += total;
        Ok(())
    }

    /// 清空内容并释放堆存储，回到内联初始状态。可重复调用。
    pub fn reset(&mut self) {
        if !self.store.is_inline() {
            debug!(
                capacity = self.store.capacity(),
                used = self.len,
                "bufflib buffer reset"
            );
        }
        self.store.release();
        self.len = 0;
    }

    /// 以同一分配环境创建空缓冲。
    pub fn sibling(&self) -> Buffer {
        Buffer::with_context(self.store.context().clone())
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Buffer {}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl fmt::Write for Buffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// 宿主值中持有的缓冲句柄。
///
/// # 教案式说明
/// - **契约 (What)**：克隆共享同一缓冲；[`BufferRef::ptr_eq`] 判断身份，
///   [`BufferRef::equal`] 比较内容；
/// - **执行 (How)**：值级别操作逐项转换、逐项加锁写入，锁只覆盖字节拷贝本身。
#[derive(Clone)]
pub struct BufferRef {
    inner: Arc<Mutex<Buffer>>,
}

impl BufferRef {
    pub fn new(buffer: Buffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    /// 使用默认分配环境创建空缓冲句柄。
    pub fn empty() -> Self {
        Self::new(Buffer::new())
    }

    /// 依次追加每个值的 `tostring` 形式。
    ///
    /// 第 `i` 项的转换紧挨着它的拷贝执行，带副作用的转换按调用顺序发生。
    pub fn append(&self, values: &[Value]) -> Result<()> {
        for value in values {
            let display = value.to_display();
            self.inner.lock().push_bytes(&display)?;
        }
        Ok(())
    }

    /// 追加 `v0 sep v1 sep … v(n-1)`，末尾不追加分隔符。
    ///
    /// - 分隔符只转换一次；
    /// - 只有一个值时不写分隔符；
    /// - 没有值时返回 `Arity`。
    pub fn append_separated(&self, separator: &Value, values: &[Value]) -> Result<()> {
        let Some((last, leading)) = values.split_last() else {
            return Err(BuffError::arity("addsep", 1, 0));
        };
        let separator = separator.to_display();
        for value in leading {
            let display = value.to_display();
            self.inner.lock().push_parts(&[&display, &separator])?;
        }
        let display = last.to_display();
        self.inner.lock().push_bytes(&display)
    }

    /// 追加原始字节。
    pub fn push_bytes(&self, src: &[u8]) -> Result<()> {
        self.inner.lock().push_bytes(src)
    }

    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity()
    }

    /// 当前内容的不可变快照。
    pub fn materialize(&self) -> Bytes {
        self.inner.lock().materialize()
    }

    /// 按字节比较两个缓冲的当前内容。
    pub fn equal(&self, other: &BufferRef) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let snapshot = self.materialize();
        other.inner.lock().as_bytes() == snapshot.as_ref()
    }

    pub fn ptr_eq(&self, other: &BufferRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// 在持锁状态下只读访问缓冲。闭包内不得再访问同一句柄。
    pub fn with<R>(&self, f: impl FnOnce(&Buffer) -> R) -> R {
        f(&self.inner.lock())
    }

    /// 在持锁状态下可变访问缓冲。闭包内不得再访问同一句柄。
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Buffer) -> R) -> R {
        f(&mut self.inner.lock())
    }

    fn sibling(&self) -> Buffer {
        self.inner.lock().sibling()
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_lock() {
            Some(buffer) => fmt::Debug::fmt(&*buffer, f),
            None => f.write_str("Buffer { <locked> }"),
        }
    }
}

impl fmt::Display for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.materialize();
        f.write_str(&alloc::string::String::from_utf8_lossy(&snapshot))
    }
}

impl PartialEq for BufferRef {
    fn eq(&self, other: &Self) -> bool {
        self.equal(other)
    }
}

/// 宿主 `..` 运算。
///
/// - 两侧都是 Buffer：创建容量恰为 `len(lhs) + len(rhs)` 的新缓冲，依次拷贝两侧内容，
///   输入保持不变；两侧可以是同一个缓冲；
/// - 只有一侧是 Buffer：把另一侧的 `tostring` 形式追加到该缓冲并返回它；
/// - 两侧都不是 Buffer：返回 `TypeMismatch`。
pub fn concat(lhs: &Value, rhs: &Value) -> Result<Value> {
    match (lhs, rhs) {
        (Value::Buffer(left), Value::Buffer(right)) => {
            let head = left.materialize();
            let tail = right.materialize();
            let mut joined = left.sibling();
            joined.push_parts(&[&head, &tail])?;
            Ok(Value::Buffer(BufferRef::new(joined)))
        }
        (Value::Buffer(target), other) | (other, Value::Buffer(target)) => {
            let display = other.to_display();
            target.push_bytes(&display)?;
            Ok(Value::Buffer(target.clone()))
        }
        (_, other) => Err(BuffError::type_mismatch(
            "concat",
            2,
            crate::value::BUFFER_TYPE_NAME,
            other.type_name(),
        )),
    }
}

/// 收集句柄内容为 `Vec<u8>`，便于在宿主外部消费。
impl From<&BufferRef> for Vec<u8> {
    fn from(buffer: &BufferRef) -> Self {
        buffer.with(|inner| inner.as_bytes().to_vec())
    }
}
