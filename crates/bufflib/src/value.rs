//! 宿主值模型。
//!
//! # 模块定位（Why）
//! - 缓冲库嵌入在脚本宿主中，操作的参数与返回值都是宿主的动态值；
//!   本模块只覆盖缓冲库需要触达的那部分宿主语义：值的种类、`tostring` 转换与原生函数。
//!
//! # 契约说明（What）
//! - [`Value::to_display`] 复刻宿主 `tostring` 规则：`nil`、`true`/`false`、十进制整数、
//!   `%.14g` 风格的浮点数（整数值浮点数追加 `.0`），字符串原样返回，Buffer 返回其内容，
//!   函数与 userdata 退化为 `"<类型>: 0x<地址>"`；
//! - 字符串是字节序列（[`Bytes`]），允许内嵌 `\0`，不做 UTF-8 校验；
//! - 所有值均为 `Send + Sync`，可存入并发分派表。

use alloc::{borrow::Cow, format, string::String, sync::Arc, vec::Vec};
use core::{any::Any, fmt};

use bytes::Bytes;

use crate::{buffer::BufferRef, error::Result};

/// Buffer 在宿主中的类型名，同时用作类型错误里的期望类型。
pub const BUFFER_TYPE_NAME: &str = "bufflib_buffer";

/// 原生函数的调用签名：接收全部实参，返回全部结果。
pub type Callable = dyn Fn(&[Value]) -> Result<Vec<Value>> + Send + Sync;

/// 宿主动态值。
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Str(Bytes),
    Buffer(BufferRef),
    Function(NativeFunction),
    Userdata(Userdata),
}

impl Value {
    /// 宿主可见的类型名。
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Boolean(_) => "boolean",
            Value::Integer(_) | Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Buffer(_) => BUFFER_TYPE_NAME,
            Value::Function(_) => "function",
            Value::Userdata(_) => "userdata",
        }
    }

    /// 宿主 `tostring` 转换。
    ///
    /// - Buffer 会被物化为一次性快照，调用期间短暂持有其锁；
    /// - 返回值与源值不共享可变状态，调用方可以随意持有。
    pub fn to_display(&self) -> Bytes {
        match self {
            Value::Nil => Bytes::from_static(b"nil"),
            Value::Boolean(true) => Bytes::from_static(b"true"),
            Value::Boolean(false) => Bytes::from_static(b"false"),
            Value::Integer(value) => Bytes::from(value.to_string()),
            Value::Number(value) => Bytes::from(format_number(*value)),
            Value::Str(bytes) => bytes.clone(),
            Value::Buffer(buffer) => buffer.materialize(),
            Value::Function(function) => {
                Bytes::from(format!("function: {:p}", function.address()))
            }
            Value::Userdata(data) => Bytes::from(format!("userdata: {:p}", data.address())),
        }
    }

    /// 宿主 string 库的参数强制转换：字符串原样返回，数字转为十进制文本，其余类型返回 `None`。
    pub fn coerce_bytes(&self) -> Option<Bytes> {
        match self {
            Value::Str(bytes) => Some(bytes.clone()),
            Value::Integer(_) | Value::Number(_) => Some(self.to_display()),
            _ => None,
        }
    }

    /// 取整数值；整数值浮点数同样接受。
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(value) => Some(*value),
            Value::Number(value) if value.fract() == 0.0 && value.is_finite() => {
                let truncated = *value as i64;
                (truncated as f64 == *value).then_some(truncated)
            }
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Str(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_buffer(&self) -> Option<&BufferRef> {
        match self {
            Value::Buffer(buffer) => Some(buffer),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&NativeFunction> {
        match self {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn is_buffer(&self) -> bool {
        matches!(self, Value::Buffer(_))
    }
}

/// 宿主 `==` 语义：数字跨子类型按数值比较，Buffer 走 `__eq` 比较内容，函数与 userdata 比较身份。
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Integer(a), Value::Number(b)) | (Value::Number(b), Value::Integer(a)) => {
                *a as f64 == *b && Value::Number(*b).as_integer() == Some(*a)
            }
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Buffer(a), Value::Buffer(b)) => a.equal(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Userdata(a), Value::Userdata(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => f.write_str("Nil"),
            Value::Boolean(value) => write!(f, "Boolean({value})"),
            Value::Integer(value) => write!(f, "Integer({value})"),
            Value::Number(value) => write!(f, "Number({value})"),
            Value::Str(bytes) => write!(f, "Str({bytes:?})"),
            Value::Buffer(buffer) => write!(f, "Buffer({buffer:?})"),
            Value::Function(function) => write!(f, "Function({function:?})"),
            Value::Userdata(data) => write!(f, "Userdata({data:?})"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(Bytes::from(value))
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Str(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Str(Bytes::from(value))
    }
}

impl From<Bytes> for Value {
    fn from(value: Bytes) -> Self {
        Value::Str(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Integer(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<BufferRef> for Value {
    fn from(value: BufferRef) -> Self {
        Value::Buffer(value)
    }
}

impl From<NativeFunction> for Value {
    fn from(value: NativeFunction) -> Self {
        Value::Function(value)
    }
}

/// 具名原生函数。
///
/// 克隆只增加引用计数；两个句柄指向同一闭包时 [`NativeFunction::ptr_eq`] 为真，
/// 分派缓存依赖这一点保证元表与模块表中安装的是同一个适配器。
#[derive(Clone)]
pub struct NativeFunction {
    name: Cow<'static, str>,
    inner: Arc<Callable>,
}

impl NativeFunction {
    pub fn new<N, F>(name: N, function: F) -> Self
    where
        N: Into<Cow<'static, str>>,
        F: Fn(&[Value]) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            inner: Arc::new(function),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 以给定实参调用，返回全部结果。
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>> {
        (self.inner)(args)
    }

    pub fn ptr_eq(&self, other: &NativeFunction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.inner).cast::<()>()
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:p}", self.name, self.address())
    }
}

/// 不透明宿主对象。
#[derive(Clone)]
pub struct Userdata(Arc<dyn Any + Send + Sync>);

impl Userdata {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Userdata) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    fn address(&self) -> *const () {
        Arc::as_ptr(&self.0).cast::<()>()
    }
}

impl fmt::Debug for Userdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "userdata: {:p}", self.address())
    }
}

/// 按 `%.14g` 规则格式化浮点数，并对整数值结果追加 `.0`。
pub(crate) fn format_number(value: f64) -> String {
    if value.is_nan() {
        return if value.is_sign_negative() { "-nan" } else { "nan" }.into();
    }
    if value.is_infinite() {
        return if value > 0.0 { "inf" } else { "-inf" }.into();
    }

    // 14 位有效数字：先按科学计数法舍入，再根据舍入后的指数选择表示形式。
    let scientific = format!("{value:.13e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return scientific;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);

    let mut out = if !(-4..14).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!(
            "{}e{sign}{:02}",
            trim_fraction(mantissa),
            exponent.unsigned_abs()
        )
    } else {
        let decimals = usize::try_from(13 - exponent).unwrap_or(0);
        String::from(trim_fraction(&format!("{value:.decimals$}")))
    };

    if out.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
        out.push_str(".0");
    }
    out
}

fn trim_fraction(text: &str) -> &str {
    if text.contains('.') {
        text.trim_end_matches('0').trim_end_matches('.')
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn display(value: Value) -> String {
        String::from_utf8(value.to_display().to_vec()).expect("tostring 结果应为 ASCII")
    }

    #[test]
    fn scalars_follow_host_tostring_rules() {
        assert_eq!(display(Value::Nil), "nil");
        assert_eq!(display(Value::Boolean(true)), "true");
        assert_eq!(display(Value::Boolean(false)), "false");
        assert_eq!(display(Value::Integer(-42)), "-42");
        assert_eq!(display(Value::from("plain")), "plain");
    }

    #[test]
    fn floats_use_fourteen_significant_digits() {
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(3.0), "3.0");
        assert_eq!(format_number(-0.0), "-0.0");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(1e100), "1e+100");
        assert_eq!(format_number(1e-5), "1e-05");
        assert_eq!(format_number(123456.789), "123456.789");
        assert_eq!(format_number(1e15), "1e+15");
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn opaque_values_render_type_and_address() {
        let function = NativeFunction::new("noop", |_| Ok(Vec::new()));
        let rendered = display(Value::Function(function));
        assert!(rendered.starts_with("function: 0x"), "{rendered}");

        let data = display(Value::Userdata(Userdata::new(7_u32)));
        assert!(data.starts_with("userdata: 0x"), "{data}");
    }

    #[test]
    fn numbers_compare_across_subtypes() {
        assert_eq!(Value::Integer(2), Value::Number(2.0));
        assert_ne!(Value::Integer(2), Value::Number(2.5));
        assert_ne!(Value::from("2"), Value::Integer(2));
    }

    #[test]
    fn embedded_zero_bytes_survive_conversion() {
        let value = Value::from(&b"a\0b"[..]);
        assert_eq!(value.to_display().as_ref(), b"a\0b");
    }
}
