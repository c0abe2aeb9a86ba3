//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义缓冲引擎、分派缓存与宿主调用面共享的错误语义；
//! - 所有失败都以同步方式返回给直接调用方，不做重试，也不在内部吞掉。
//!
//! ## 设计要求（What）
//! - [`BuffError`] 派生 `thiserror::Error`，消息格式与宿主脚本的参数报错保持一致
//!   （`bad argument #n to 'f' (x expected, got y)`）；
//! - 每个变体映射到 [`codes`] 中的稳定错误码，供日志与宿主桥接层机读；
//! - “委派成员不存在”不是错误，而是 [`crate::DispatchCache::resolve`] 返回的 `None`。

use thiserror::Error;

/// 稳定错误码表。
///
/// 码值遵循 `<域>.<语义>` 约定，新增码值只追加、不复用。
pub mod codes {
    /// 扩容请求无法在不溢出的前提下表示，或超过配置的容量上限。
    pub const ALLOCATION_TOO_LARGE: &str = "bufflib.alloc.too_large";
    /// 参数个数少于操作的最低要求。
    pub const ARITY: &str = "bufflib.call.arity";
    /// 参数类型与期望不符，典型场景是需要 Buffer 却收到了其它值。
    pub const TYPE_MISMATCH: &str = "bufflib.call.type_mismatch";
    /// 调用了不存在或不可调用的成员。
    pub const NOT_CALLABLE: &str = "bufflib.call.not_callable";
    /// 外部 string 库函数拒绝了参数。
    pub const EXTERNAL: &str = "bufflib.strlib.failure";
}

/// 缓冲库的统一错误域。
///
/// # 教案式说明
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可以安全地跨线程传递；
///   - `AllocationTooLarge` 发生时缓冲状态保证与调用前完全一致；
///   - `Arity`/`TypeMismatch` 在参数校验阶段产生，此时尚未触碰任何缓冲。
/// - **执行逻辑 (How)**：变体携带函数名、参数位置等上下文，`Display` 直接生成宿主风格的报错文本，
///   [`BuffError::code`] 给出稳定错误码。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum BuffError {
    /// 扩容计算溢出或超过容量上限。
    ///
    /// - `used`：当前已写入字节数；
    /// - `additional`：本次请求追加的字节数；
    /// - `limit`：生效的容量上限。
    #[error("buffer too large: cannot add {additional} bytes to {used} used bytes (limit {limit})")]
    AllocationTooLarge {
        used: usize,
        additional: usize,
        limit: usize,
    },

    /// 参数个数不足。
    #[error("wrong number of arguments to '{function}' (at least {expected} expected, got {received})")]
    Arity {
        function: String,
        expected: usize,
        received: usize,
    },

    /// 参数类型不符。`position` 从 1 开始计数，与宿主的参数编号一致。
    #[error("bad argument #{position} to '{function}' ({expected} expected, got {found})")]
    TypeMismatch {
        function: String,
        position: usize,
        expected: &'static str,
        found: &'static str,
    },

    /// 成员不存在或不是函数。
    #[error("attempt to call member '{name}' (not a function)")]
    NotCallable { name: String },

    /// 外部 string 库函数执行失败。
    #[error("bad argument to '{function}' ({message})")]
    External { function: String, message: String },
}

impl BuffError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            BuffError::AllocationTooLarge { .. } => codes::ALLOCATION_TOO_LARGE,
            BuffError::Arity { .. } => codes::ARITY,
            BuffError::TypeMismatch { .. } => codes::TYPE_MISMATCH,
            BuffError::NotCallable { .. } => codes::NOT_CALLABLE,
            BuffError::External { .. } => codes::EXTERNAL,
        }
    }

    /// 构造参数类型错误。
    pub fn type_mismatch(
        function: &str,
        position: usize,
        expected: &'static str,
        found: &'static str,
    ) -> Self {
        BuffError::TypeMismatch {
            function: function.to_owned(),
            position,
            expected,
            found,
        }
    }

    /// 构造参数个数错误。
    pub fn arity(function: &str, expected: usize, received: usize) -> Self {
        BuffError::Arity {
            function: function.to_owned(),
            expected,
            received,
        }
    }

    /// 构造外部函数失败。
    pub fn external(function: &str, message: impl Into<String>) -> Self {
        BuffError::External {
            function: function.to_owned(),
            message: message.into(),
        }
    }
}

/// crate 内统一使用的结果别名。
pub type Result<T, E = BuffError> = core::result::Result<T, E>;
