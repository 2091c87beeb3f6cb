use crate::ElemKind;
use std::collections::HashMap;

/// 编译后的程序：名字已解析到参数序号和局部变量槽位。
#[derive(Debug)]
pub(super) struct Module {
    pub kernels: HashMap<String, Kernel>,
}

#[derive(Debug)]
pub(super) struct StructDef {
    pub fields: Vec<Field>,
    pub size: usize,
}

#[derive(Debug)]
pub(super) struct Field {
    pub name: String,
    pub kind: ElemKind,
    pub offset: usize,
}

#[derive(Debug)]
pub(super) struct Kernel {
    pub params: Vec<Param>,
    /// 局部变量槽位的类型。
    pub locals: Vec<ElemKind>,
    pub body: Vec<Stmt>,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum Builtin {
    ThreadPosition,
    GridSize,
}

#[derive(Debug)]
pub(super) enum Param {
    /// `device T *name [[buffer(slot)]]`
    Buffer {
        name: String,
        kind: ElemKind,
        slot: usize,
        writable: bool,
    },
    /// `constant T &name [[buffer(slot)]]`，`size` 为绑定至少需要的字节数。
    Constant {
        name: String,
        slot: usize,
        size: usize,
    },
    /// `uintN name [[thread_position_in_grid]]`，`kind` 为分量类型。
    Builtin {
        name: String,
        which: Builtin,
        dims: usize,
        kind: ElemKind,
    },
}

impl Param {
    pub fn name(&self) -> &str {
        match self {
            Self::Buffer { name, .. } | Self::Constant { name, .. } | Self::Builtin { name, .. } => {
                name
            }
        }
    }

    pub fn slot(&self) -> Option<usize> {
        match self {
            Self::Buffer { slot, .. } | Self::Constant { slot, .. } => Some(*slot),
            Self::Builtin { .. } => None,
        }
    }
}

/// 求值结果。
///
/// 整数带有类型，数值已截断到类型的宽度；`ulong` 以 `i64` 保存位模式。
#[derive(Clone, Copy, PartialEq, Debug)]
pub(super) enum Value {
    Bool(bool),
    Int(i64, ElemKind),
    Float(f64),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum UnaryOp {
    Neg,
    Not,
    BitNot,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(super) enum Func {
    Sqrt,
    Rsqrt,
    Cos,
    Sin,
    Tan,
    Exp,
    Log,
    Abs,
    Floor,
    Ceil,
    Min,
    Max,
    Pow,
}

impl Func {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sqrt" => Self::Sqrt,
            "rsqrt" => Self::Rsqrt,
            "cos" => Self::Cos,
            "sin" => Self::Sin,
            "tan" => Self::Tan,
            "exp" => Self::Exp,
            "log" => Self::Log,
            "abs" | "fabs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "min" | "fmin" => Self::Min,
            "max" | "fmax" => Self::Max,
            "pow" | "powr" => Self::Pow,
            _ => return None,
        })
    }

    pub const fn arity(self) -> usize {
        match self {
            Self::Min | Self::Max | Self::Pow => 2,
            _ => 1,
        }
    }
}

#[derive(Debug)]
pub(super) enum Expr {
    Lit(Value),
    Local(usize),
    /// 标量常量参数或一维线程位置。
    Param(usize),
    /// 线程位置的分量。
    Component(usize, usize),
    /// 常量结构体参数的字段。
    Field {
        param: usize,
        offset: usize,
        kind: ElemKind,
    },
    /// 缓冲区元素。
    Load(usize, Box<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Select(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
    Cast(ElemKind, Box<Expr>),
}

#[derive(Debug)]
pub(super) enum Place {
    Local(usize),
    Element(usize, Expr),
}

#[derive(Debug)]
pub(super) enum Stmt {
    Assign {
        place: Place,
        op: Option<BinaryOp>,
        value: Expr,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then: Box<Stmt>,
        otherwise: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Return,
    Break,
    Continue,
}
