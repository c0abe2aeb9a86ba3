//! 外部 string 库接口与默认实现。
//!
//! # 模块定位（Why）
//! - 分派缓存只依赖 [`StringLibrary`] 这一窄接口：按名字查询、枚举条目；
//! - [`StringTable`] 是宿主侧的默认实现，允许在运行期注册新函数，
//!   用来覆盖“模块打开之后才加入 string 库的函数”这一惰性解析路径。
//!
//! # 契约说明（What）
//! - 条目值可以是任意宿主值；只有函数值会被包装成 `s_` 适配器；
//! - 默认函数按字节处理，大小写转换只作用于 ASCII；位置参数遵循宿主的 1 起始、
//!   负数自尾部计数规则；
//! - `find` 只做朴素子串查找，不解释模式字符。

use alloc::{borrow::ToOwned, string::String, sync::Arc, vec, vec::Vec};

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;

use crate::{
    error::{BuffError, Result},
    value::{NativeFunction, Value},
};

/// 外部 string 库。
pub trait StringLibrary: Send + Sync + 'static {
    /// 按名字查询条目。
    fn get(&self, name: &str) -> Option<Value>;

    /// 枚举全部条目，顺序不作保证。
    fn entries(&self) -> Vec<(String, Value)>;
}

/// 可在运行期增删条目的 string 表。
#[derive(Debug, Default)]
pub struct StringTable {
    entries: DashMap<String, Value>,
}

impl StringTable {
    /// 空表。
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置默认函数的表。
    pub fn standard() -> Self {
        let table = Self::new();
        table.register("len", str_len);
        table.register("upper", str_upper);
        table.register("lower", str_lower);
        table.register("rep", str_rep);
        table.register("reverse", str_reverse);
        table.register("sub", str_sub);
        table.register("byte", str_byte);
        table.register("char", str_char);
        table.register("find", str_find);
        table
    }

    /// 便于直接交给 [`crate::BuffLib::open`] 的共享句柄。
    pub fn shared(self) -> Arc<dyn StringLibrary> {
        Arc::new(self)
    }

    /// 设置条目，返回旧值。
    pub fn set(&self, name: impl Into<String>, value: Value) -> Option<Value> {
        self.entries.insert(name.into(), value)
    }

    /// 注册原生函数。
    pub fn register<F>(&self, name: &str, function: F) -> Option<Value>
    where
        F: Fn(&[Value]) -> Result<Vec<Value>> + Send + Sync + 'static,
    {
        let function = NativeFunction::new(name.to_owned(), function);
        self.set(name, Value::Function(function))
    }

    pub fn remove(&self, name: &str) -> Option<Value> {
        self.entries.remove(name).map(|(_, value)| value)
    }
}

impl StringLibrary for StringTable {
    fn get(&self, name: &str) -> Option<Value> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    fn entries(&self) -> Vec<(String, Value)> {
        self.entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

fn found_type(args: &[Value], position: usize) -> &'static str {
    args.get(position - 1).map_or("no value", Value::type_name)
}

/// 取第 `position` 个参数的字节串形式（数字会被转换）。
fn check_bytes(function: &str, args: &[Value], position: usize) -> Result<Bytes> {
    args.get(position - 1)
        .and_then(Value::coerce_bytes)
        .ok_or_else(|| {
            BuffError::type_mismatch(function, position, "string", found_type(args, position))
        })
}

fn check_integer(function: &str, args: &[Value], position: usize) -> Result<i64> {
    args.get(position - 1)
        .and_then(Value::as_integer)
        .ok_or_else(|| {
            BuffError::type_mismatch(function, position, "number", found_type(args, position))
        })
}

fn opt_integer(function: &str, args: &[Value], position: usize, default: i64) -> Result<i64> {
    match args.get(position - 1) {
        None | Some(Value::Nil) => Ok(default),
        Some(_) => check_integer(function, args, position),
    }
}

/// 把可能为负的位置换算为 0 起始之前的 1 起始位置；越过开头时返回 0。
fn relative_position(position: i64, len: usize) -> i64 {
    let len = i64::try_from(len).unwrap_or(i64::MAX);
    if position >= 0 {
        position
    } else if position.unsigned_abs() > len.unsigned_abs() {
        0
    } else {
        len + position + 1
    }
}

/// 把 1 起始闭区间 `[start, end]` 截到 `[1, len]`，返回 0 起始半开区间。
fn clamp_range(start: i64, end: i64, len: usize) -> Option<(usize, usize)> {
    let start = start.max(1);
    let end = end.min(i64::try_from(len).unwrap_or(i64::MAX));
    if start > end {
        return None;
    }
    let start = usize::try_from(start - 1).ok()?;
    let end = usize::try_from(end).ok()?;
    Some((start, end))
}

fn str_len(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("len", args, 1)?;
    Ok(vec![Value::from(text.len())])
}

fn str_upper(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("upper", args, 1)?;
    Ok(vec![Value::from(text.to_ascii_uppercase())])
}

fn str_lower(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("lower", args, 1)?;
    Ok(vec![Value::from(text.to_ascii_lowercase())])
}

fn str_rep(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("rep", args, 1)?;
    let count = check_integer("rep", args, 2)?;
    let separator = match args.get(2) {
        None | Some(Value::Nil) => Bytes::new(),
        Some(_) => check_bytes("rep", args, 3)?,
    };
    let Ok(count) = usize::try_from(count) else {
        return Ok(vec![Value::from("")]);
    };
    if count == 0 || text.len() + separator.len() == 0 {
        return Ok(vec![Value::from("")]);
    }

    let total = text
        .len()
        .checked_mul(count)
        .and_then(|body| separator.len().checked_mul(count - 1)?.checked_add(body))
        .filter(|total| *total <= isize::MAX as usize)
        .ok_or_else(|| BuffError::external("rep", "resulting string too large"))?;

    let mut out = BytesMut::with_capacity(total);
    for index in 0..count {
        if index > 0 {
            out.put_slice(&separator);
        }
        out.put_slice(&text);
    }
    Ok(vec![Value::Str(out.freeze())])
}

fn str_reverse(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("reverse", args, 1)?;
    let reversed: Vec<u8> = text.iter().rev().copied().collect();
    Ok(vec![Value::from(reversed)])
}

fn str_sub(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("sub", args, 1)?;
    let start = relative_position(check_integer("sub", args, 2)?, text.len());
    let end = relative_position(opt_integer("sub", args, 3, -1)?, text.len());
    let slice = match clamp_range(start, end, text.len()) {
        Some((from, to)) => text.slice(from..to),
        None => Bytes::new(),
    };
    Ok(vec![Value::Str(slice)])
}

fn str_byte(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("byte", args, 1)?;
    let start = opt_integer("byte", args, 2, 1)?;
    let end = opt_integer("byte", args, 3, start)?;
    let start = relative_position(start, text.len());
    let end = relative_position(end, text.len());
    Ok(match clamp_range(start, end, text.len()) {
        Some((from, to)) => text[from..to]
            .iter()
            .map(|byte| Value::Integer(i64::from(*byte)))
            .collect(),
        None => Vec::new(),
    })
}

fn str_char(args: &[Value]) -> Result<Vec<Value>> {
    let mut out = Vec::with_capacity(args.len());
    for position in 1..=args.len() {
        let code = check_integer("char", args, position)?;
        let byte = u8::try_from(code).map_err(|_| BuffError::external("char", "value out of range"))?;
        out.push(byte);
    }
    Ok(vec![Value::from(out)])
}

fn str_find(args: &[Value]) -> Result<Vec<Value>> {
    let text = check_bytes("find", args, 1)?;
    let needle = check_bytes("find", args, 2)?;
    let init = relative_position(opt_integer("find", args, 3, 1)?, text.len()).max(1);
    let Some(from) = usize::try_from(init - 1).ok().filter(|from| *from <= text.len()) else {
        return Ok(vec![Value::Nil]);
    };

    let hit = if needle.is_empty() {
        Some(from)
    } else {
        text[from..]
            .windows(needle.len())
            .position(|window| window == &needle[..])
            .map(|offset| from + offset)
    };

    Ok(match hit {
        Some(start) => vec![
            Value::from(start + 1),
            Value::from(start + needle.len()),
        ],
        None => vec![Value::Nil],
    })
}
