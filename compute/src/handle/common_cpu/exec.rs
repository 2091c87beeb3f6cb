use super::ast::*;
use crate::{dispatch_error, DeviceMemory, ElemKind, Error, Grid};
use half::f16;
use rayon::iter::{IntoParallelIterator, ParallelIterator};
use std::{
    cmp::Ordering,
    ptr::{null_mut, read_unaligned, write_unaligned},
};

type Result<T> = std::result::Result<T, Error>;

/// 绑定到内核参数的存储区域。
#[derive(Clone, Copy)]
pub(super) struct RawMem {
    ptr: *mut u8,
    len: usize,
}

// 线程网格中的线程共享绑定的存储，对同一元素的并发写入由内核自行避免。
unsafe impl Send for RawMem {}
unsafe impl Sync for RawMem {}

impl RawMem {
    const UNBOUND: Self = Self {
        ptr: null_mut(),
        len: 0,
    };

    pub fn new(mem: &impl DeviceMemory) -> Self {
        Self {
            ptr: mem.as_mut_ptr(),
            len: mem.len(),
        }
    }
}

/// 以 `grid` 中的每个线程执行一次 `kernel`。
///
/// `args` 按缓冲区槽位排列。
pub(super) fn run(kernel: &Kernel, grid: Grid, args: &[Option<RawMem>]) -> Result<()> {
    let bindings = kernel
        .params
        .iter()
        .map(|param| {
            let Some(slot) = param.slot() else {
                return Ok(RawMem::UNBOUND);
            };
            let name = param.name();
            let Some(mem) = args.get(slot).copied().flatten() else {
                return Err(dispatch_error(format!(
                    "no buffer bound to slot {slot} for parameter `{name}`"
                )));
            };
            match param {
                Param::Constant { size, .. } if mem.len < *size => Err(dispatch_error(format!(
                    "`{name}` needs {size} bytes, buffer at slot {slot} holds {}",
                    mem.len,
                ))),
                _ => Ok(mem),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let Grid {
        width,
        height,
        depth,
    } = grid;
    let total = width * height * depth;
    (0..total).into_par_iter().try_for_each_init(
        || vec![Value::Int(0, ElemKind::Int); kernel.locals.len()],
        |locals, i| {
            let mut thread = Thread {
                kernel,
                bindings: &bindings,
                position: [i % width, i / width % height, i / (width * height)],
                grid: [width, height, depth],
                locals,
            };
            thread.block(&kernel.body).map(drop)
        },
    )
}

enum Flow {
    Next,
    Break,
    Continue,
    Return,
}

enum Location {
    Local(usize),
    Element(ElemKind, *mut u8),
}

struct Thread<'a> {
    kernel: &'a Kernel,
    bindings: &'a [RawMem],
    position: [usize; 3],
    grid: [usize; 3],
    locals: &'a mut [Value],
}

impl Thread<'_> {
    fn block(&mut self, stmts: &[Stmt]) -> Result<Flow> {
        for stmt in stmts {
            match self.stmt(stmt)? {
                Flow::Next => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Next)
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<Flow> {
        match stmt {
            Stmt::Assign { place, op, value } => {
                let location = self.locate(place)?;
                let mut value = self.eval(value)?;
                if let Some(op) = op {
                    value = binary(*op, self.read(&location), value)?
                }
                self.write(&location, value)
            }
            Stmt::Expr(expr) => {
                self.eval(expr)?;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                if truthy(self.eval(cond)?) {
                    return self.stmt(then);
                } else if let Some(otherwise) = otherwise {
                    return self.stmt(otherwise);
                }
            }
            Stmt::While { cond, body } => {
                while truthy(self.eval(cond)?) {
                    match self.stmt(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Next | Flow::Continue => {}
                    }
                }
            }
            Stmt::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.stmt(init)?;
                }
                loop {
                    if let Some(cond) = cond {
                        if !truthy(self.eval(cond)?) {
                            break;
                        }
                    }
                    match self.stmt(body)? {
                        Flow::Break => break,
                        Flow::Return => return Ok(Flow::Return),
                        Flow::Next | Flow::Continue => {}
                    }
                    if let Some(step) = step {
                        self.stmt(step)?;
                    }
                }
            }
            Stmt::Block(stmts) => return self.block(stmts),
            Stmt::Return => return Ok(Flow::Return),
            Stmt::Break => return Ok(Flow::Break),
            Stmt::Continue => return Ok(Flow::Continue),
        }
        Ok(Flow::Next)
    }

    fn locate(&self, place: &Place) -> Result<Location> {
        match place {
            Place::Local(slot) => Ok(Location::Local(*slot)),
            Place::Element(param, index) => {
                let index = self.eval(index)?;
                self.element(*param, index)
            }
        }
    }

    fn element(&self, param: usize, index: Value) -> Result<Location> {
        let Param::Buffer { name, kind, .. } = &self.kernel.params[param] else {
            return Err(dispatch_error("indexing a parameter that is not a buffer"));
        };
        let mem = self.bindings[param];
        let size = kind.size();
        let count = mem.len / size;
        let index = integer(index);
        match usize::try_from(index) {
            Ok(i) if i < count => Ok(Location::Element(*kind, unsafe { mem.ptr.add(i * size) })),
            _ => Err(dispatch_error(format!(
                "index {index} out of bounds of `{name}` with {count} elements"
            ))),
        }
    }

    fn read(&self, location: &Location) -> Value {
        match *location {
            Location::Local(slot) => self.locals[slot],
            Location::Element(kind, ptr) => unsafe { load(kind, ptr) },
        }
    }

    fn write(&mut self, location: &Location, value: Value) {
        match *location {
            Location::Local(slot) => self.locals[slot] = coerce(self.kernel.locals[slot], value),
            Location::Element(kind, ptr) => unsafe { store(kind, ptr, value) },
        }
    }

    fn builtin(&self, param: usize, axis: usize) -> Value {
        let (source, kind) = match self.kernel.params[param] {
            Param::Builtin {
                which: Builtin::GridSize,
                kind,
                ..
            } => (&self.grid, kind),
            Param::Builtin { kind, .. } => (&self.position, kind),
            _ => (&self.position, ElemKind::UInt),
        };
        Value::Int(wrap(source[axis] as _, kind), kind)
    }

    fn eval(&self, expr: &Expr) -> Result<Value> {
        Ok(match expr {
            Expr::Lit(value) => *value,
            Expr::Local(slot) => self.locals[*slot],
            Expr::Param(param) => self.builtin(*param, 0),
            Expr::Component(param, axis) => self.builtin(*param, *axis),
            &Expr::Field {
                param,
                offset,
                kind,
            } => {
                // 绑定时已检查常量缓冲区的大小
                let mem = self.bindings[param];
                if offset + kind.size() > mem.len {
                    return Err(dispatch_error("constant field out of bounds"));
                }
                unsafe { load(kind, mem.ptr.add(offset)) }
            }
            Expr::Load(param, index) => {
                let index = self.eval(index)?;
                let location = self.element(*param, index)?;
                self.read(&location)
            }
            Expr::Unary(op, a) => unary(*op, self.eval(a)?),
            Expr::Binary(BinaryOp::And, a, b) => {
                Value::Bool(truthy(self.eval(a)?) && truthy(self.eval(b)?))
            }
            Expr::Binary(BinaryOp::Or, a, b) => {
                Value::Bool(truthy(self.eval(a)?) || truthy(self.eval(b)?))
            }
            Expr::Binary(op, a, b) => binary(*op, self.eval(a)?, self.eval(b)?)?,
            Expr::Select(cond, a, b) => {
                if truthy(self.eval(cond)?) {
                    self.eval(a)?
                } else {
                    self.eval(b)?
                }
            }
            Expr::Call(func, args) => {
                let args = args
                    .iter()
                    .map(|arg| self.eval(arg))
                    .collect::<Result<Vec<_>>>()?;
                call(*func, &args)
            }
            Expr::Cast(kind, a) => coerce(*kind, self.eval(a)?),
        })
    }
}

fn truthy(value: Value) -> bool {
    match value {
        Value::Bool(b) => b,
        Value::Int(n, _) => n != 0,
        Value::Float(x) => x != 0.,
    }
}

fn integer(value: Value) -> i64 {
    match value {
        Value::Bool(b) => b as _,
        Value::Int(n, _) => n,
        Value::Float(x) => x as _,
    }
}

/// 值作为整数操作数时的类型。
fn integer_kind(value: Value) -> ElemKind {
    match value {
        Value::Bool(_) => ElemKind::Bool,
        Value::Int(_, kind) => kind,
        Value::Float(_) => ElemKind::Long,
    }
}

fn float(value: Value) -> f64 {
    match value {
        Value::Bool(b) => b as u8 as _,
        Value::Int(n, ElemKind::ULong) => n as u64 as _,
        Value::Int(n, _) => n as _,
        Value::Float(x) => x,
    }
}

/// 整数提升：窄于 int 的类型按 int 运算。
fn promote(kind: ElemKind) -> ElemKind {
    use ElemKind as K;
    match kind {
        K::Bool | K::Char | K::UChar | K::Short | K::UShort => K::Int,
        kind => kind,
    }
}

/// 两个整数操作数提升后的公共类型。
fn common(a: ElemKind, b: ElemKind) -> ElemKind {
    let signed = |kind: ElemKind| matches!(kind, ElemKind::Int | ElemKind::Long);
    let (a, b) = (promote(a), promote(b));
    match (signed(a), signed(b)) {
        (true, true) | (false, false) => {
            if a.size() >= b.size() {
                a
            } else {
                b
            }
        }
        // 无符号类型不比有符号类型窄时取无符号类型
        (false, true) if a.size() >= b.size() => a,
        (true, false) if b.size() >= a.size() => b,
        (true, false) => a,
        (false, true) => b,
    }
}

/// 把整数截断到 `kind` 的宽度。
fn wrap(n: i64, kind: ElemKind) -> i64 {
    use ElemKind as K;
    match kind {
        K::Bool => (n != 0) as _,
        K::Char => n as i8 as _,
        K::UChar => n as u8 as _,
        K::Short => n as i16 as _,
        K::UShort => n as u16 as _,
        K::Int => n as i32 as _,
        K::UInt => n as u32 as _,
        _ => n,
    }
}

fn compare(kind: ElemKind, a: i64, b: i64) -> Ordering {
    if kind == ElemKind::ULong {
        (a as u64).cmp(&(b as u64))
    } else {
        a.cmp(&b)
    }
}

/// 把值转换为 `kind` 能表示的值，整数截断，浮点舍入。
fn coerce(kind: ElemKind, value: Value) -> Value {
    use ElemKind as K;
    match kind {
        K::Bool => Value::Bool(truthy(value)),
        K::Half => Value::Float(f16::from_f64(float(value)).to_f64()),
        K::Float => Value::Float(float(value) as f32 as _),
        _ => {
            let n = match value {
                Value::Float(x) if kind == K::ULong => x as u64 as _,
                value => integer(value),
            };
            Value::Int(wrap(n, kind), kind)
        }
    }
}

unsafe fn load(kind: ElemKind, ptr: *const u8) -> Value {
    use ElemKind as K;
    let n = match kind {
        K::Bool => return Value::Bool(read_unaligned(ptr) != 0),
        K::Half => return Value::Float(read_unaligned(ptr.cast::<f16>()).to_f64()),
        K::Float => return Value::Float(read_unaligned(ptr.cast::<f32>()) as _),
        K::Char => read_unaligned(ptr.cast::<i8>()) as _,
        K::UChar => read_unaligned(ptr) as _,
        K::Short => read_unaligned(ptr.cast::<i16>()) as _,
        K::UShort => read_unaligned(ptr.cast::<u16>()) as _,
        K::Int => read_unaligned(ptr.cast::<i32>()) as _,
        K::UInt => read_unaligned(ptr.cast::<u32>()) as _,
        K::Long => read_unaligned(ptr.cast::<i64>()),
        K::ULong => read_unaligned(ptr.cast::<u64>()) as _,
    };
    Value::Int(n, kind)
}

unsafe fn store(kind: ElemKind, ptr: *mut u8, value: Value) {
    match coerce(kind, value) {
        Value::Bool(b) => write_unaligned(ptr, b as u8),
        Value::Float(x) if kind == ElemKind::Half => {
            write_unaligned(ptr.cast::<f16>(), f16::from_f64(x))
        }
        Value::Float(x) => write_unaligned(ptr.cast::<f32>(), x as _),
        // 截断后的位模式按宽度写入
        Value::Int(n, _) => match kind.size() {
            1 => write_unaligned(ptr, n as u8),
            2 => write_unaligned(ptr.cast::<u16>(), n as _),
            4 => write_unaligned(ptr.cast::<u32>(), n as _),
            _ => write_unaligned(ptr.cast::<u64>(), n as _),
        },
    }
}

fn unary(op: UnaryOp, a: Value) -> Value {
    let kind = promote(integer_kind(a));
    match (op, a) {
        (UnaryOp::Neg, Value::Float(x)) => Value::Float(-x),
        (UnaryOp::Neg, a) => Value::Int(wrap(integer(a).wrapping_neg(), kind), kind),
        (UnaryOp::Not, a) => Value::Bool(!truthy(a)),
        (UnaryOp::BitNot, a) => Value::Int(wrap(!integer(a), kind), kind),
    }
}

fn binary(op: BinaryOp, a: Value, b: Value) -> Result<Value> {
    use BinaryOp as B;

    let floating = matches!(a, Value::Float(_)) || matches!(b, Value::Float(_));
    let kind = common(integer_kind(a), integer_kind(b));
    let (x, y) = (wrap(integer(a), kind), wrap(integer(b), kind));

    if let B::Lt | B::Le | B::Gt | B::Ge | B::Eq | B::Ne = op {
        let ord = if floating {
            float(a).partial_cmp(&float(b))
        } else {
            Some(compare(kind, x, y))
        };
        return Ok(Value::Bool(ord.is_some_and(|ord| match op {
            B::Lt => ord.is_lt(),
            B::Le => ord.is_le(),
            B::Gt => ord.is_gt(),
            B::Ge => ord.is_ge(),
            B::Eq => ord.is_eq(),
            _ => ord.is_ne(),
        }) || (op == B::Ne && ord.is_none())));
    }

    let n = match op {
        B::And => return Ok(Value::Bool(truthy(a) && truthy(b))),
        B::Or => return Ok(Value::Bool(truthy(a) || truthy(b))),
        B::Shl | B::Shr => {
            // 移位结果取左操作数提升后的类型，移位量按位宽取模
            let kind = promote(integer_kind(a));
            let n = wrap(integer(a), kind);
            let shift = integer(b) as u32 % (kind.size() as u32 * 8);
            let n = match op {
                B::Shl => n.wrapping_shl(shift),
                _ if kind == ElemKind::ULong => ((n as u64) >> shift) as _,
                _ => n >> shift,
            };
            return Ok(Value::Int(wrap(n, kind), kind));
        }
        B::BitAnd => x & y,
        B::BitOr => x | y,
        B::BitXor => x ^ y,
        _ if floating => {
            let (a, b) = (float(a), float(b));
            return Ok(Value::Float(match op {
                B::Add => a + b,
                B::Sub => a - b,
                B::Mul => a * b,
                B::Div => a / b,
                _ => a % b,
            }));
        }
        B::Add => x.wrapping_add(y),
        B::Sub => x.wrapping_sub(y),
        B::Mul => x.wrapping_mul(y),
        _ if y == 0 => return Err(dispatch_error("integer division by zero")),
        B::Div if kind == ElemKind::ULong => ((x as u64) / (y as u64)) as _,
        B::Div => x.wrapping_div(y),
        _ if kind == ElemKind::ULong => ((x as u64) % (y as u64)) as _,
        _ => x.wrapping_rem(y),
    };
    Ok(Value::Int(wrap(n, kind), kind))
}

fn call(func: Func, args: &[Value]) -> Value {
    let integral = args.iter().all(|arg| !matches!(arg, Value::Float(_)));
    if integral {
        match (func, args) {
            (Func::Abs, &[a]) => {
                let kind = promote(integer_kind(a));
                let n = wrap(integer(a), kind);
                let n = match kind {
                    ElemKind::Int | ElemKind::Long => wrap(n.wrapping_abs(), kind),
                    _ => n,
                };
                return Value::Int(n, kind);
            }
            (Func::Min | Func::Max, &[a, b]) => {
                let kind = common(integer_kind(a), integer_kind(b));
                let (x, y) = (wrap(integer(a), kind), wrap(integer(b), kind));
                let less = compare(kind, x, y).is_lt();
                let n = if less == (func == Func::Min) { x } else { y };
                return Value::Int(n, kind);
            }
            _ => {}
        }
    }
    let x = float(args[0]);
    Value::Float(match func {
        Func::Sqrt => x.sqrt(),
        Func::Rsqrt => x.sqrt().recip(),
        Func::Cos => x.cos(),
        Func::Sin => x.sin(),
        Func::Tan => x.tan(),
        Func::Exp => x.exp(),
        Func::Log => x.ln(),
        Func::Abs => x.abs(),
        Func::Floor => x.floor(),
        Func::Ceil => x.ceil(),
        Func::Min => x.min(float(args[1])),
        Func::Max => x.max(float(args[1])),
        Func::Pow => x.powf(float(args[1])),
    })
}
