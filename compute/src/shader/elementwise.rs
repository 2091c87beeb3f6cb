use super::{BinaryOp, KernelSource, UnaryOp};
use crate::{unsupported_type, ElemKind, Error, TypeDescriptor};

const PRELUDE: &str = "\
#include <metal_stdlib>

using namespace metal;
";

/// 会话初始化时装载的空程序。
pub fn placeholder() -> KernelSource {
    const ENTRY: &str = "empty_kernel";
    KernelSource::new(format!("{PRELUDE}\nkernel void {ENTRY}() {{}}\n"), ENTRY)
}

/// `c[i] = a[i] op b[i]`
pub fn binary(op: BinaryOp, ty: &TypeDescriptor) -> Result<KernelSource, Error> {
    if ty.kind() == ElemKind::Bool {
        return Err(unsupported_type(format!("{} is not defined for bool", op.name())));
    }
    let ty = ty.name();
    let name = op.name();
    let symbol = op.symbol();
    let entry = format!("{name}_kernel");
    Ok(KernelSource::new(
        format!(
            r#"{PRELUDE}
kernel void {entry}(
    const device {ty} *a [[buffer(0)]],
    const device {ty} *b [[buffer(1)]],
    device {ty} *c [[buffer(2)]],
    uint id [[thread_position_in_grid]]
) {{
    c[id] = a[id] {symbol} b[id];
}}
"#
        ),
        entry,
    ))
}

/// `y[i] = to(x[i])`
pub fn cast(from: &TypeDescriptor, to: &TypeDescriptor) -> KernelSource {
    let from = from.name();
    let to = to.name();
    const ENTRY: &str = "cast_kernel";
    KernelSource::new(
        format!(
            r#"{PRELUDE}
kernel void {ENTRY}(
    const device {from} *x [[buffer(0)]],
    device {to} *y [[buffer(1)]],
    uint id [[thread_position_in_grid]]
) {{
    y[id] = {to}(x[id]);
}}
"#
        ),
        ENTRY,
    )
}

/// `y[i] = f(x[i])`，只接受浮点类型。
pub fn unary(op: UnaryOp, ty: &TypeDescriptor) -> Result<KernelSource, Error> {
    let name = op.name();
    if !ty.is_float() {
        return Err(unsupported_type(format!(
            "{name} requires a float element type, found {ty}"
        )));
    }
    let ty = ty.name();
    let entry = format!("{name}_kernel");
    Ok(KernelSource::new(
        format!(
            r#"{PRELUDE}
kernel void {entry}(
    const device {ty} *x [[buffer(0)]],
    device {ty} *y [[buffer(1)]],
    uint id [[thread_position_in_grid]]
) {{
    y[id] = {name}(x[id]);
}}
"#
        ),
        entry,
    ))
}
