//! 内置逐元素运算的内核源码生成。
//!
//! 生成函数是纯函数，相同的运算和元素类型总是生成相同的源码。
//! [`KernelCache`] 按 [`BuiltinOp`] 记忆生成结果，避免每次调用都重新生成。

mod elementwise;

pub use elementwise::{binary, cast, placeholder, unary};

use crate::{ElemKind, Error};
use log::trace;
use lru::LruCache;
use std::{fmt, sync::Arc};

/// 程序源码及其定义的入口名。
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KernelSource {
    pub text: Arc<str>,
    pub entry_point: String,
}

impl KernelSource {
    #[inline]
    pub fn new(text: impl Into<Arc<str>>, entry_point: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            entry_point: entry_point.into(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
}

impl BinaryOp {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
        }
    }

    pub(crate) const fn symbol(self) -> char {
        match self {
            Self::Add => '+',
            Self::Subtract => '-',
            Self::Multiply => '*',
        }
    }
}

/// 只对浮点类型有定义的一元函数。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum UnaryOp {
    Sqrt,
    Cos,
    Sin,
    Tan,
}

impl UnaryOp {
    pub(crate) const fn name(self) -> &'static str {
        match self {
            Self::Sqrt => "sqrt",
            Self::Cos => "cos",
            Self::Sin => "sin",
            Self::Tan => "tan",
        }
    }
}

/// 内置运算，也是生成源码的缓存键。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BuiltinOp {
    Binary(BinaryOp, ElemKind),
    Cast { from: ElemKind, to: ElemKind },
    Unary(UnaryOp, ElemKind),
}

impl BuiltinOp {
    pub fn generate(self) -> Result<KernelSource, Error> {
        match self {
            Self::Binary(op, kind) => binary(op, kind.descriptor()),
            Self::Cast { from, to } => Ok(cast(from.descriptor(), to.descriptor())),
            Self::Unary(op, kind) => unary(op, kind.descriptor()),
        }
    }
}

impl fmt::Display for BuiltinOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Binary(op, kind) => write!(f, "{}<{kind}>", op.name()),
            Self::Cast { from, to } => write!(f, "cast<{from}, {to}>"),
            Self::Unary(op, kind) => write!(f, "{}<{kind}>", op.name()),
        }
    }
}

/// 生成源码的最近最少使用缓存。容量为 0 时不缓存。
pub struct KernelCache(Option<LruCache<BuiltinOp, KernelSource>>);

impl KernelCache {
    #[inline]
    pub fn new(cache: Option<LruCache<BuiltinOp, KernelSource>>) -> Self {
        Self(cache)
    }

    pub fn get(&mut self, op: BuiltinOp) -> Result<KernelSource, Error> {
        let Some(cache) = &mut self.0 else {
            return op.generate();
        };
        if let Some(kernel) = cache.get(&op) {
            trace!("kernel cache hit: {op}");
            return Ok(kernel.clone());
        }
        let kernel = op.generate()?;
        trace!("kernel generated: {op}");
        cache.put(op, kernel.clone());
        Ok(kernel)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.as_ref().map_or(0, LruCache::len)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::{BinaryOp, BuiltinOp, KernelCache, UnaryOp};
    use crate::{Config, ElemKind, ErrorKind};

    #[test]
    fn test_cache() {
        let mut cache = KernelCache::new(Config { kernel_cache: 2 }.new_cache());
        let add = BuiltinOp::Binary(BinaryOp::Add, ElemKind::Int);
        let a = cache.get(add).unwrap();
        let b = cache.get(add).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);

        cache.get(BuiltinOp::Unary(UnaryOp::Cos, ElemKind::Float)).unwrap();
        cache
            .get(BuiltinOp::Cast {
                from: ElemKind::Int,
                to: ElemKind::Half,
            })
            .unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_uncached() {
        let mut cache = KernelCache::new(Config { kernel_cache: 0 }.new_cache());
        let op = BuiltinOp::Binary(BinaryOp::Multiply, ElemKind::Float);
        assert_eq!(cache.get(op).unwrap(), op.generate().unwrap());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_errors_not_cached() {
        let mut cache = KernelCache::new(Config::default().new_cache());
        let op = BuiltinOp::Unary(UnaryOp::Sqrt, ElemKind::Int);
        assert_eq!(cache.get(op).unwrap_err().kind, ErrorKind::UnsupportedType);
        assert!(cache.is_empty());
    }
}
