#![deny(unsafe_code)]

//! `bufflib` 为嵌入式脚本宿主提供可变、可增长的字节缓冲。
//!
//! # 模块定位（Why）
//! - 反复拼接不可变字符串的总成本是平方级；Buffer 以摊还线性成本累积内容，
//!   同时借助元方法与方法委派，在大多数消费代码里表现得与普通字符串无异；
//! - 宿主只在接口边界上建模：动态值 [`Value`]、`tostring` 转换、外部 string 库
//!   [`StringLibrary`] 以及打开后的模块 [`BuffLib`]。
//!
//! # 设计概要（How）
//! - `store`：内联初始存储与堆存储之间的切换，checked 算术的扩容规划，被替换存储的回收钩子；
//! - `buffer`：[`Buffer`] 与共享句柄 [`BufferRef`]，追加、带分隔符追加、重置、比较与 `..` 运算；
//! - `dispatch`：`s_` 前缀成员的惰性解析与缓存，适配器同时安装到元表与模块表；
//! - `module`：元表与模块表的组装、两种调用语法、存储统计。
//!
//! # 快速上手
//! ```rust
//! use bufflib::{BuffLib, StringTable, Value};
//!
//! let lib = BuffLib::open(Some(StringTable::standard().shared()));
//! let buffer = lib.new_buffer(&[Value::from("ab")]).expect("创建缓冲");
//! lib.invoke(&buffer, "add", &[Value::from("c"), Value::Integer(4)])
//!     .expect("追加");
//! assert_eq!(buffer.materialize().as_ref(), b"abc4");
//!
//! let upper = lib.invoke(&buffer, "s_upper", &[]).expect("委派到 string.upper");
//! assert_eq!(upper, vec![Value::from("ABC4")]);
//! ```

extern crate alloc;

mod buffer;
mod config;
mod dispatch;
mod error;
mod module;
mod ops;
mod store;
mod strlib;
#[cfg(feature = "telemetry")]
pub mod telemetry;
mod value;

pub use buffer::{Buffer, BufferRef, concat};
pub use config::{ALLOCATION_CEILING, BuffConfig, ConfigError};
pub use dispatch::{DELEGATION_PREFIX, DispatchCache, DispatchTable};
pub use error::{BuffError, Result, codes};
pub use module::BuffLib;
pub use store::{
    BackingStore, DetachedRecycler, INITIAL_CAPACITY, ReclaimedStore, StoreContext, StoreLedger,
    StoreRecycler, StoreStats, plan_growth,
};
pub use strlib::{StringLibrary, StringTable};
pub use value::{BUFFER_TYPE_NAME, Callable, NativeFunction, Userdata, Value};
