use super::{
    ast::*,
    lexer::{line_of, tokenize, Token},
};
use crate::{compile_error, ElemKind, Error};
use std::{collections::HashMap, ops::Range};

type Result<T> = std::result::Result<T, Error>;

pub(super) fn parse(src: &str) -> Result<Module> {
    Parser {
        src,
        tokens: tokenize(src)?,
        pos: 0,
        structs: HashMap::new(),
        kernels: HashMap::new(),
        scopes: Vec::new(),
        params: Vec::new(),
        param_types: Vec::new(),
        locals: Vec::new(),
        loops: 0,
    }
    .module()
}

#[derive(Clone, Copy)]
enum Name {
    Local(usize),
    Param(usize),
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<(Token, Range<usize>)>,
    pos: usize,

    structs: HashMap<String, StructDef>,
    kernels: HashMap<String, Kernel>,

    // 正在解析的内核
    scopes: Vec<Vec<(String, Name)>>,
    params: Vec<Param>,
    param_types: Vec<String>,
    locals: Vec<ElemKind>,
    loops: usize,
}

const TOP_LEVEL: usize = 9;

/// 二元运算符的优先级，0 最低。
fn binary_op(token: &Token) -> Option<(usize, BinaryOp)> {
    Some(match token {
        Token::OrOr => (0, BinaryOp::Or),
        Token::AndAnd => (1, BinaryOp::And),
        Token::Pipe => (2, BinaryOp::BitOr),
        Token::Caret => (3, BinaryOp::BitXor),
        Token::Amp => (4, BinaryOp::BitAnd),
        Token::EqEq => (5, BinaryOp::Eq),
        Token::Ne => (5, BinaryOp::Ne),
        Token::Lt => (6, BinaryOp::Lt),
        Token::Le => (6, BinaryOp::Le),
        Token::Gt => (6, BinaryOp::Gt),
        Token::Ge => (6, BinaryOp::Ge),
        Token::Shl => (7, BinaryOp::Shl),
        Token::Shr => (7, BinaryOp::Shr),
        Token::Plus => (8, BinaryOp::Add),
        Token::Minus => (8, BinaryOp::Sub),
        Token::Star => (TOP_LEVEL, BinaryOp::Mul),
        Token::Slash => (TOP_LEVEL, BinaryOp::Div),
        Token::Percent => (TOP_LEVEL, BinaryOp::Rem),
        _ => return None,
    })
}

fn scalar(name: &str) -> Option<ElemKind> {
    name.parse().ok()
}

/// 可以承载线程位置的类型，返回维数和分量类型。
fn vector(name: &str) -> Option<(usize, ElemKind)> {
    let (kind, dims) = if let Some(dims) = name.strip_prefix("uint") {
        (ElemKind::UInt, dims)
    } else {
        (ElemKind::UShort, name.strip_prefix("ushort")?)
    };
    match dims {
        "" => Some((1, kind)),
        "2" => Some((2, kind)),
        "3" => Some((3, kind)),
        _ => None,
    }
}

fn step(place: Place, op: BinaryOp) -> Stmt {
    Stmt::Assign {
        place,
        op: Some(op),
        value: Expr::Lit(Value::Int(1, ElemKind::Int)),
    }
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|(t, _)| t)
    }

    fn peek_ident(&self, n: usize) -> Option<&str> {
        match self.peek_at(n) {
            Some(Token::Ident(name)) => Some(name),
            _ => None,
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        let hit = self.peek() == Some(token);
        if hit {
            self.pos += 1
        }
        hit
    }

    fn eat_ident(&mut self, word: &str) -> bool {
        let hit = self.peek_ident(0) == Some(word);
        if hit {
            self.pos += 1
        }
        hit
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {token:?}")))
        }
    }

    fn ident(&mut self) -> Result<String> {
        match self.peek_ident(0) {
            Some(name) => {
                let name = name.to_string();
                self.pos += 1;
                Ok(name)
            }
            None => Err(self.error("expected identifier")),
        }
    }

    fn error(&self, msg: impl AsRef<str>) -> Error {
        let msg = msg.as_ref();
        match self.tokens.get(self.pos) {
            Some((token, span)) => compile_error(format!(
                "line {}: {msg}, found {token:?}",
                line_of(self.src, span.start),
            )),
            None => compile_error(format!(
                "line {}: {msg}, found end of source",
                line_of(self.src, self.src.len()),
            )),
        }
    }

    // # 顶层

    fn module(mut self) -> Result<Module> {
        while let Some(token) = self.peek() {
            match token {
                Token::Semi => self.pos += 1,
                Token::Ident(word) if word == "using" => {
                    while !self.eat(&Token::Semi) {
                        if self.peek().is_none() {
                            return Err(self.error("expected `;`"));
                        }
                        self.pos += 1
                    }
                }
                Token::Ident(word) if word == "struct" => self.structure()?,
                Token::Ident(word) if word == "kernel" => self.kernel()?,
                _ => return Err(self.error("expected `kernel`, `struct` or `using`")),
            }
        }
        Ok(Module {
            kernels: self.kernels,
        })
    }

    fn structure(&mut self) -> Result<()> {
        self.pos += 1;
        let name = self.ident()?;
        if self.structs.contains_key(&name) {
            return Err(self.error(format!("redefinition of struct `{name}`")));
        }
        self.expect(Token::LBrace)?;

        let mut fields = Vec::<Field>::new();
        let mut offset = 0usize;
        let mut align = 1usize;
        while !self.eat(&Token::RBrace) {
            let ty = self.ident()?;
            let Some(kind) = scalar(&ty) else {
                return Err(self.error(format!("unsupported field type `{ty}`")));
            };
            loop {
                let field = self.ident()?;
                if fields.iter().any(|f| f.name == field) {
                    return Err(self.error(format!("duplicate field `{field}`")));
                }
                let size = kind.size();
                offset = offset.next_multiple_of(size);
                fields.push(Field {
                    name: field,
                    kind,
                    offset,
                });
                offset += size;
                align = align.max(size);
                if !self.eat(&Token::Comma) {
                    break;
                }
            }
            self.expect(Token::Semi)?;
        }
        self.expect(Token::Semi)?;

        let size = offset.next_multiple_of(align);
        self.structs.insert(name, StructDef { fields, size });
        Ok(())
    }

    fn kernel(&mut self) -> Result<()> {
        self.pos += 1;
        if !self.eat_ident("void") {
            return Err(self.error("kernels must return `void`"));
        }
        let name = self.ident()?;
        if self.kernels.contains_key(&name) {
            return Err(self.error(format!("redefinition of kernel `{name}`")));
        }

        self.params.clear();
        self.param_types.clear();
        self.locals.clear();
        self.expect(Token::LParen)?;
        if !self.eat(&Token::RParen) {
            loop {
                let (param, ty) = self.param()?;
                if self.params.iter().any(|p| p.name() == param.name()) {
                    return Err(self.error(format!("duplicate parameter `{}`", param.name())));
                }
                if let Some(slot) = param.slot() {
                    if self.params.iter().any(|p| p.slot() == Some(slot)) {
                        return Err(self.error(format!("buffer({slot}) is bound twice")));
                    }
                }
                self.params.push(param);
                self.param_types.push(ty);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }

        self.scopes = vec![self
            .params
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name().to_string(), Name::Param(i)))
            .collect()];
        let body = self.block()?;
        self.scopes.clear();

        let kernel = Kernel {
            params: std::mem::take(&mut self.params),
            locals: std::mem::take(&mut self.locals),
            body,
        };
        self.kernels.insert(name, kernel);
        Ok(())
    }

    /// 返回参数和参数的类型名。
    fn param(&mut self) -> Result<(Param, String)> {
        #[derive(PartialEq)]
        enum Space {
            Device,
            Constant,
        }

        let mut space = None;
        let mut read_only = false;
        let mut qualifiers = |p: &mut Self| -> Result<()> {
            loop {
                match p.peek_ident(0) {
                    Some("const") => read_only = true,
                    Some("device") => space = Some(Space::Device),
                    Some("constant") => space = Some(Space::Constant),
                    Some(word @ ("thread" | "threadgroup")) => {
                        return Err(p.error(format!("`{word}` address space is not supported")))
                    }
                    _ => return Ok(()),
                }
                p.pos += 1
            }
        };

        qualifiers(self)?;
        let ty = self.ident()?;
        qualifiers(self)?;
        let pointer = self.eat(&Token::Star);
        let reference = !pointer && self.eat(&Token::Amp);
        qualifiers(self)?;
        let name = self.ident()?;
        let attribute = self.attribute()?;

        let param = if pointer || reference {
            let Some(space) = space else {
                return Err(self.error(format!("`{name}` needs an address space")));
            };
            let slot = match attribute {
                Some((attr, Some(slot))) if attr == "buffer" => slot,
                _ => return Err(self.error(format!("`{name}` needs a [[buffer(n)]] attribute"))),
            };
            if pointer {
                let Some(kind) = scalar(&ty) else {
                    return Err(self.error(format!("pointer to `{ty}` is not supported")));
                };
                Param::Buffer {
                    name,
                    kind,
                    slot,
                    writable: space == Space::Device && !read_only,
                }
            } else {
                let size = match (scalar(&ty), self.structs.get(&ty)) {
                    (Some(kind), _) => kind.size(),
                    (None, Some(def)) => def.size,
                    (None, None) => return Err(self.error(format!("unknown type `{ty}`"))),
                };
                Param::Constant { name, slot, size }
            }
        } else {
            let which = match attribute.as_ref().map(|(attr, _)| attr.as_str()) {
                Some("thread_position_in_grid") => Builtin::ThreadPosition,
                Some("threads_per_grid") => Builtin::GridSize,
                Some(attr) => return Err(self.error(format!("unsupported attribute `{attr}`"))),
                None => return Err(self.error(format!("`{name}` needs an attribute"))),
            };
            let Some((dims, kind)) = vector(&ty) else {
                return Err(self.error(format!("`{ty}` cannot hold a thread position")));
            };
            Param::Builtin {
                name,
                which,
                dims,
                kind,
            }
        };
        Ok((param, ty))
    }

    /// `[[name]]` 或 `[[name(n)]]`
    fn attribute(&mut self) -> Result<Option<(String, Option<usize>)>> {
        if !(self.peek() == Some(&Token::LBracket) && self.peek_at(1) == Some(&Token::LBracket)) {
            return Ok(None);
        }
        self.pos += 2;
        let name = self.ident()?;
        let arg = if self.eat(&Token::LParen) {
            let Some(&(Token::Int(n) | Token::UInt(n))) = self.peek() else {
                return Err(self.error("expected integer"));
            };
            self.pos += 1;
            self.expect(Token::RParen)?;
            Some(n as usize)
        } else {
            None
        };
        self.expect(Token::RBracket)?;
        self.expect(Token::RBracket)?;
        Ok(Some((name, arg)))
    }

    // # 语句

    fn lookup(&self, name: &str) -> Option<Name> {
        self.scopes
            .iter()
            .rev()
            .flat_map(|scope| scope.iter().rev())
            .find(|(n, _)| n == name)
            .map(|&(_, name)| name)
    }

    fn block(&mut self) -> Result<Vec<Stmt>> {
        self.expect(Token::LBrace)?;
        self.scopes.push(Vec::new());
        let mut stmts = Vec::new();
        while !self.eat(&Token::RBrace) {
            if self.peek().is_none() {
                return Err(self.error("expected `}`"));
            }
            stmts.push(self.statement()?);
        }
        self.scopes.pop();
        Ok(stmts)
    }

    fn statement(&mut self) -> Result<Stmt> {
        match self.peek() {
            Some(Token::LBrace) => return self.block().map(Stmt::Block),
            Some(Token::Semi) => {
                self.pos += 1;
                return Ok(Stmt::Block(Vec::new()));
            }
            _ => {}
        }
        match self.peek_ident(0) {
            Some("if") => {
                self.pos += 1;
                let cond = self.condition()?;
                let then = Box::new(self.scoped()?);
                let otherwise = if self.eat_ident("else") {
                    Some(Box::new(self.scoped()?))
                } else {
                    None
                };
                Ok(Stmt::If {
                    cond,
                    then,
                    otherwise,
                })
            }
            Some("while") => {
                self.pos += 1;
                let cond = self.condition()?;
                let body = Box::new(self.loop_body()?);
                Ok(Stmt::While { cond, body })
            }
            Some("for") => {
                self.pos += 1;
                self.expect(Token::LParen)?;
                self.scopes.push(Vec::new());
                let init = if self.eat(&Token::Semi) {
                    None
                } else {
                    let init = self.simple()?;
                    self.expect(Token::Semi)?;
                    Some(Box::new(init))
                };
                let cond = if self.peek() == Some(&Token::Semi) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(Token::Semi)?;
                let step = if self.peek() == Some(&Token::RParen) {
                    None
                } else {
                    Some(Box::new(self.simple()?))
                };
                self.expect(Token::RParen)?;
                let body = Box::new(self.loop_body()?);
                self.scopes.pop();
                Ok(Stmt::For {
                    init,
                    cond,
                    step,
                    body,
                })
            }
            Some("return") => {
                self.pos += 1;
                if !self.eat(&Token::Semi) {
                    return Err(self.error("kernels cannot return a value"));
                }
                Ok(Stmt::Return)
            }
            Some(word @ ("break" | "continue")) => {
                let stmt = if word == "break" {
                    Stmt::Break
                } else {
                    Stmt::Continue
                };
                if self.loops == 0 {
                    return Err(self.error("not inside a loop"));
                }
                self.pos += 1;
                self.expect(Token::Semi)?;
                Ok(stmt)
            }
            _ => {
                let stmt = self.simple()?;
                self.expect(Token::Semi)?;
                Ok(stmt)
            }
        }
    }

    /// 分支体和循环体中的声明只在其内部可见。
    fn scoped(&mut self) -> Result<Stmt> {
        self.scopes.push(Vec::new());
        let stmt = self.statement();
        self.scopes.pop();
        stmt
    }

    fn loop_body(&mut self) -> Result<Stmt> {
        self.loops += 1;
        let body = self.scoped();
        self.loops -= 1;
        body
    }

    fn condition(&mut self) -> Result<Expr> {
        self.expect(Token::LParen)?;
        let cond = self.expr()?;
        self.expect(Token::RParen)?;
        Ok(cond)
    }

    fn step_op(&self) -> Option<BinaryOp> {
        match self.peek() {
            Some(Token::PlusPlus) => Some(BinaryOp::Add),
            Some(Token::MinusMinus) => Some(BinaryOp::Sub),
            _ => None,
        }
    }

    /// 声明、赋值、自增自减或表达式，不含结尾的分号。
    fn simple(&mut self) -> Result<Stmt> {
        if self.is_declaration() {
            return self.declaration();
        }
        if let Some(op) = self.step_op() {
            self.pos += 1;
            let target = self.unary()?;
            return Ok(step(self.place(target)?, op));
        }

        let target = self.expr()?;
        if let Some(op) = self.step_op() {
            self.pos += 1;
            return Ok(step(self.place(target)?, op));
        }
        let op = match self.peek() {
            Some(Token::Assign) => None,
            Some(Token::PlusAssign) => Some(BinaryOp::Add),
            Some(Token::MinusAssign) => Some(BinaryOp::Sub),
            Some(Token::StarAssign) => Some(BinaryOp::Mul),
            Some(Token::SlashAssign) => Some(BinaryOp::Div),
            _ => return Ok(Stmt::Expr(target)),
        };
        let place = self.place(target)?;
        self.pos += 1;
        let value = self.expr()?;
        Ok(Stmt::Assign { place, op, value })
    }

    fn is_declaration(&self) -> bool {
        match self.peek_ident(0) {
            Some("const") => true,
            Some(ty) => {
                (scalar(ty).is_some() || vector(ty).is_some())
                    && matches!(self.peek_at(1), Some(Token::Ident(_)))
            }
            None => false,
        }
    }

    fn declaration(&mut self) -> Result<Stmt> {
        self.eat_ident("const");
        let ty = self.ident()?;
        let Some(kind) = scalar(&ty) else {
            return Err(self.error(format!("local variables of type `{ty}` are not supported")));
        };
        let mut decls = Vec::new();
        loop {
            let name = self.ident()?;
            if self.peek() == Some(&Token::LBracket) {
                return Err(self.error("local arrays are not supported"));
            }
            // 初始化式中的同名标识符仍指向外层
            let value = if self.eat(&Token::Assign) {
                self.ternary()?
            } else {
                Expr::Lit(Value::Int(0, ElemKind::Int))
            };
            let slot = self.locals.len();
            self.locals.push(kind);
            if let Some(scope) = self.scopes.last_mut() {
                scope.push((name, Name::Local(slot)))
            }
            decls.push(Stmt::Assign {
                place: Place::Local(slot),
                op: None,
                value,
            });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(if decls.len() == 1 {
            decls.swap_remove(0)
        } else {
            Stmt::Block(decls)
        })
    }

    fn place(&self, target: Expr) -> Result<Place> {
        match target {
            Expr::Local(slot) => Ok(Place::Local(slot)),
            Expr::Load(param, index) => match &self.params[param] {
                Param::Buffer { writable: true, .. } => Ok(Place::Element(param, *index)),
                p => Err(self.error(format!("`{}` is read-only", p.name()))),
            },
            _ => Err(self.error("expression is not assignable")),
        }
    }

    // # 表达式

    fn expr(&mut self) -> Result<Expr> {
        self.ternary()
    }

    fn ternary(&mut self) -> Result<Expr> {
        let cond = self.binary(0)?;
        if !self.eat(&Token::Question) {
            return Ok(cond);
        }
        let a = self.expr()?;
        self.expect(Token::Colon)?;
        let b = self.ternary()?;
        Ok(Expr::Select(Box::new(cond), Box::new(a), Box::new(b)))
    }

    fn binary(&mut self, level: usize) -> Result<Expr> {
        let operand = |p: &mut Self| {
            if level == TOP_LEVEL {
                p.unary()
            } else {
                p.binary(level + 1)
            }
        };
        let mut lhs = operand(self)?;
        while let Some((l, op)) = self.peek().and_then(binary_op) {
            if l != level {
                break;
            }
            self.pos += 1;
            let rhs = operand(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let op = match self.peek() {
            Some(Token::Minus) => UnaryOp::Neg,
            Some(Token::Bang) => UnaryOp::Not,
            Some(Token::Tilde) => UnaryOp::BitNot,
            Some(Token::Plus) => {
                self.pos += 1;
                return self.unary();
            }
            // (T) x
            Some(Token::LParen) if self.peek_at(2) == Some(&Token::RParen) => {
                match self.peek_ident(1).and_then(scalar) {
                    Some(kind) => {
                        self.pos += 3;
                        return Ok(Expr::Cast(kind, Box::new(self.unary()?)));
                    }
                    None => return self.primary(),
                }
            }
            _ => return self.primary(),
        };
        self.pos += 1;
        Ok(Expr::Unary(op, Box::new(self.unary()?)))
    }

    fn primary(&mut self) -> Result<Expr> {
        let expr = match self.peek() {
            Some(&Token::Int(n)) => {
                self.pos += 1;
                // 无后缀的字面量依次尝试 int、long、ulong
                let kind = if i32::try_from(n).is_ok() {
                    ElemKind::Int
                } else if i64::try_from(n).is_ok() {
                    ElemKind::Long
                } else {
                    ElemKind::ULong
                };
                Expr::Lit(Value::Int(n as _, kind))
            }
            Some(&Token::UInt(n)) => {
                self.pos += 1;
                let kind = if u32::try_from(n).is_ok() {
                    ElemKind::UInt
                } else {
                    ElemKind::ULong
                };
                Expr::Lit(Value::Int(n as _, kind))
            }
            Some(&Token::Float(x)) => {
                self.pos += 1;
                Expr::Lit(Value::Float(x))
            }
            Some(Token::LParen) => self.condition()?,
            Some(Token::Ident(_)) => {
                let name = self.ident()?;
                self.named(name)?
            }
            _ => return Err(self.error("expected expression")),
        };
        match self.peek() {
            Some(Token::LBracket) => Err(self.error("only buffers can be indexed")),
            Some(Token::Dot) => Err(self.error("member access on a scalar")),
            _ => Ok(expr),
        }
    }

    fn named(&mut self, mut name: String) -> Result<Expr> {
        // metal::sqrt, precise::cos
        while self.eat(&Token::ColonColon) {
            name = self.ident()?;
        }
        match name.as_str() {
            "true" => return Ok(Expr::Lit(Value::Bool(true))),
            "false" => return Ok(Expr::Lit(Value::Bool(false))),
            "static_cast" => {
                self.expect(Token::Lt)?;
                let ty = self.ident()?;
                let Some(kind) = scalar(&ty) else {
                    return Err(self.error(format!("cannot cast to `{ty}`")));
                };
                self.expect(Token::Gt)?;
                let value = self.condition()?;
                return Ok(Expr::Cast(kind, Box::new(value)));
            }
            _ => {}
        }
        if self.peek() == Some(&Token::LParen) {
            return self.call(name);
        }

        let param = match self.lookup(&name) {
            Some(Name::Local(slot)) => return Ok(Expr::Local(slot)),
            Some(Name::Param(i)) => i,
            None => return Err(self.error(format!("use of undeclared identifier `{name}`"))),
        };
        match &self.params[param] {
            Param::Buffer { .. } => {
                if !self.eat(&Token::LBracket) {
                    return Err(self.error(format!("buffer `{name}` must be indexed")));
                }
                let index = self.expr()?;
                self.expect(Token::RBracket)?;
                Ok(Expr::Load(param, Box::new(index)))
            }
            Param::Constant { .. } => {
                if let Some(kind) = scalar(&self.param_types[param]) {
                    return Ok(Expr::Field {
                        param,
                        offset: 0,
                        kind,
                    });
                }
                self.expect(Token::Dot)?;
                let field = self.ident()?;
                let found = self
                    .structs
                    .get(&self.param_types[param])
                    .and_then(|def| def.fields.iter().find(|f| f.name == field))
                    .map(|f| (f.offset, f.kind));
                match found {
                    Some((offset, kind)) => Ok(Expr::Field {
                        param,
                        offset,
                        kind,
                    }),
                    None => Err(self.error(format!("`{name}` has no field `{field}`"))),
                }
            }
            &Param::Builtin { dims, .. } => {
                if !self.eat(&Token::Dot) {
                    return if dims == 1 {
                        Ok(Expr::Param(param))
                    } else {
                        Err(self.error(format!("vector `{name}` must be accessed by component")))
                    };
                }
                let component = self.ident()?;
                match ["x", "y", "z"][..dims].iter().position(|c| *c == component) {
                    Some(axis) => Ok(Expr::Component(param, axis)),
                    None => Err(self.error(format!("`{name}` has no component `{component}`"))),
                }
            }
        }
    }

    /// 函数调用或函数式类型转换。
    fn call(&mut self, name: String) -> Result<Expr> {
        if let Some(kind) = scalar(&name) {
            let value = self.condition()?;
            return Ok(Expr::Cast(kind, Box::new(value)));
        }
        let Some(func) = Func::from_name(&name) else {
            return Err(self.error(format!("unknown function `{name}`")));
        };
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if !self.eat(&Token::RParen) {
            loop {
                args.push(self.expr()?);
                if self.eat(&Token::RParen) {
                    break;
                }
                self.expect(Token::Comma)?;
            }
        }
        if args.len() != func.arity() {
            return Err(self.error(format!(
                "`{name}` takes {} argument(s), {} given",
                func.arity(),
                args.len(),
            )));
        }
        Ok(Expr::Call(func, args))
    }
}

#[cfg(test)]
mod test {
    use super::{parse, Builtin, Param, Stmt};
    use crate::{ElemKind, ErrorKind};

    const MATMUL: &str = r#"
#include <metal_stdlib>
using namespace metal;

struct MatDims {
    uint M;
    uint N;
    uint K;
};

kernel void matmul(
    device const float* a [[buffer(0)]],
    device const float* b [[buffer(1)]],
    device float* c [[buffer(2)]],
    constant MatDims& dims [[buffer(3)]],
    uint2 gid [[thread_position_in_grid]]
) {
    uint row = gid.y;
    uint col = gid.x;
    if (row >= dims.M || col >= dims.N) return;
    float sum = 0.0f;
    for (uint k = 0; k < dims.K; k++) {
        sum += a[row * dims.K + k] * b[k * dims.N + col];
    }
    c[row * dims.N + col] = sum;
}
"#;

    #[test]
    fn test_matmul() {
        let module = parse(MATMUL).unwrap();
        let kernel = &module.kernels["matmul"];
        assert_eq!(kernel.params.len(), 5);
        assert!(matches!(
            kernel.params[0],
            Param::Buffer {
                kind: ElemKind::Float,
                slot: 0,
                writable: false,
                ..
            }
        ));
        assert!(matches!(kernel.params[2], Param::Buffer { writable: true, .. }));
        assert!(matches!(
            kernel.params[3],
            Param::Constant {
                slot: 3,
                size: 12,
                ..
            }
        ));
        assert!(matches!(
            kernel.params[4],
            Param::Builtin {
                which: Builtin::ThreadPosition,
                dims: 2,
                kind: ElemKind::UInt,
                ..
            }
        ));
        // row col sum k
        assert_eq!(
            kernel.locals,
            [ElemKind::UInt, ElemKind::UInt, ElemKind::Float, ElemKind::UInt]
        );
        assert_eq!(kernel.body.len(), 6);
        assert!(matches!(kernel.body[2], Stmt::If { .. }));
        assert!(matches!(kernel.body[4], Stmt::For { .. }));
        assert!(matches!(kernel.body[5], Stmt::Assign { .. }));
    }

    #[test]
    fn test_multiple_kernels() {
        let module = parse(
            "kernel void a() {}
             kernel void b(device int *x [[buffer(0)]], uint i [[thread_position_in_grid]]) {
                 x[i] = -x[i] % 3 << 1 ? 1 : static_cast<int>(metal::abs(2.5f));
             }",
        )
        .unwrap();
        assert_eq!(module.kernels.len(), 2);
        assert!(module.kernels["a"].body.is_empty());
    }

    #[test]
    fn test_scopes() {
        let module = parse(
            "kernel void f(device int *x [[buffer(0)]]) {
                 int i = 1;
                 { int i = 2; x[1] = i; }
                 x[0] = i;
             }",
        )
        .unwrap();
        assert_eq!(module.kernels["f"].locals.len(), 2);

        let e = parse("kernel void f() { { int i = 2; } i = 1; }").unwrap_err();
        assert!(e.info.contains("undeclared identifier `i`"), "{e}");
    }

    #[test]
    fn test_errors() {
        for (src, message) in [
            ("kernel void f() { x = 1; }", "undeclared"),
            ("kernel void f() { int a = foo(1); }", "unknown function"),
            ("kernel void f() { int a = sqrt(1, 2); }", "argument"),
            ("kernel void f() { break; }", "loop"),
            ("kernel void f() { return 1; }", "return a value"),
            (
                "kernel void f(const device int *x [[buffer(0)]]) { x[0] = 1; }",
                "read-only",
            ),
            ("kernel void f(device int *x) {}", "buffer(n)"),
            (
                "kernel void f(device int *x [[buffer(0)]], device int *y [[buffer(0)]]) {}",
                "bound twice",
            ),
            (
                "struct S { uint n; };
                 kernel void f(constant S &s [[buffer(0)]], device uint *y [[buffer(1)]]) { y[0] = s.m; }",
                "no field",
            ),
            ("kernel void f() { int a = 1 }", "expected"),
            ("void f() {}", "expected `kernel`"),
            ("kernel void f() {", "end of source"),
            ("kernel void f() {}\nkernel void f() {}", "redefinition"),
        ] {
            let e = parse(src).unwrap_err();
            assert_eq!(e.kind, ErrorKind::CompileError);
            assert!(e.info.contains(message), "{src}: {e}");
        }
    }

    #[test]
    fn test_line_numbers() {
        let e = parse("kernel void f() {\n    int a = 1;\n    a = b;\n}").unwrap_err();
        assert!(e.info.starts_with("line 3:"), "{e}");
    }
}
