//! 宿主可调用的内置操作。
//!
//! 每个操作都是 `fn(&[Value]) -> Result<Vec<Value>>`，与 [`crate::NativeFunction`] 的签名一致，
//! 同时安装在元表（方法调用、元方法）与模块表（库调用）中。
//!
//! - 参数校验先于任何缓冲修改；
//! - 修改缓冲的操作（`add`、`addsep`、`reset`）返回缓冲本身，便于链式调用。

use alloc::{vec, vec::Vec};

use crate::{
    buffer::{self, BufferRef},
    error::{BuffError, Result},
    value::{BUFFER_TYPE_NAME, Value},
};

/// 取第 `position` 个参数（1 起始）并要求它是 Buffer。
pub(crate) fn check_buffer<'a>(
    function: &str,
    args: &'a [Value],
    position: usize,
) -> Result<&'a BufferRef> {
    match args.get(position - 1) {
        Some(Value::Buffer(buffer)) => Ok(buffer),
        Some(other) => Err(BuffError::type_mismatch(
            function,
            position,
            BUFFER_TYPE_NAME,
            other.type_name(),
        )),
        None => Err(BuffError::type_mismatch(
            function,
            position,
            BUFFER_TYPE_NAME,
            "no value",
        )),
    }
}

/// `add(buffer, ...)`
pub(crate) fn add(args: &[Value]) -> Result<Vec<Value>> {
    let buffer = check_buffer("add", args, 1)?;
    buffer.append(&args[1..])?;
    Ok(vec![Value::Buffer(buffer.clone())])
}

/// `addsep(buffer, separator, v1, ...)`，至少需要一个待追加的值。
pub(crate) fn addsep(args: &[Value]) -> Result<Vec<Value>> {
    let buffer = check_buffer("addsep", args, 1)?;
    if args.len() < 3 {
        return Err(BuffError::arity("addsep", 3, args.len()));
    }
    buffer.append_separated(&args[1], &args[2..])?;
    Ok(vec![Value::Buffer(buffer.clone())])
}

pub(crate) fn reset(args: &[Value]) -> Result<Vec<Value>> {
    let buffer = check_buffer("reset", args, 1)?;
    buffer.reset();
    Ok(vec![Value::Buffer(buffer.clone())])
}

pub(crate) fn tostring(args: &[Value]) -> Result<Vec<Value>> {
    let buffer = check_buffer("tostring", args, 1)?;
    Ok(vec![Value::Str(buffer.materialize())])
}

pub(crate) fn length(args: &[Value]) -> Result<Vec<Value>> {
    let buffer = check_buffer("length", args, 1)?;
    Ok(vec![Value::from(buffer.len())])
}

pub(crate) fn concat(args: &[Value]) -> Result<Vec<Value>> {
    let [lhs, rhs, ..] = args else {
        return Err(BuffError::arity("concat", 2, args.len()));
    };
    Ok(vec![buffer::concat(lhs, rhs)?])
}

pub(crate) fn equal(args: &[Value]) -> Result<Vec<Value>> {
    let lhs = check_buffer("equal", args, 1)?;
    let rhs = check_buffer("equal", args, 2)?;
    Ok(vec![Value::Boolean(lhs.equal(rhs))])
}

pub(crate) fn isbuffer(args: &[Value]) -> Result<Vec<Value>> {
    Ok(vec![Value::Boolean(args.first().is_some_and(Value::is_buffer))])
}

/// `__gc`：释放堆存储。缓冲句柄之后仍可使用，表现为空缓冲。
pub(crate) fn collect(args: &[Value]) -> Result<Vec<Value>> {
    let buffer = check_buffer("__gc", args, 1)?;
    buffer.reset();
    Ok(Vec::new())
}
