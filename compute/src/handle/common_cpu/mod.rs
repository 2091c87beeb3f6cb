//! CPU 参考设备。
//!
//! 以解释执行的方式运行 Metal 着色语言的一个子集：标量类型、`struct` 常量参数、
//! `device`/`constant` 缓冲区、一至三维线程位置、常用控制流和数学函数。
//! 网格中的线程由 rayon 线程池并行执行，发射总是在返回前完成。

mod ast;
mod exec;
mod lexer;
mod parser;

pub use crate::common::Blob;

use crate::{dispatch_error, resource_exhausted, Device, DeviceMemory, Error, Grid, Limits};
use exec::RawMem;
use log::{debug, trace};
use std::cell::Cell;

#[derive(Clone, Debug)]
pub struct CpuConfig {
    pub max_threads_per_group: usize,
    pub execution_width: usize,
    /// 可分配的总字节数，[`None`] 表示不限制。
    pub memory_limit: Option<usize>,
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            max_threads_per_group: 1024,
            execution_width: 32,
            memory_limit: None,
        }
    }
}

pub struct Cpu {
    config: CpuConfig,
    allocated: Cell<usize>,
}

impl Default for Cpu {
    #[inline]
    fn default() -> Self {
        Self::new(CpuConfig::default())
    }
}

impl Cpu {
    #[inline]
    pub fn new(config: CpuConfig) -> Self {
        Self {
            config,
            allocated: Cell::new(0),
        }
    }

    #[inline]
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// 尚未回收的字节数。
    #[inline]
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }
}

/// 解析后的程序。
pub struct Program(ast::Module);

impl Program {
    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.0.kernels.keys().map(String::as_str)
    }

    fn kernel(&self, entry: &str) -> Result<&ast::Kernel, Error> {
        self.0
            .kernels
            .get(entry)
            .ok_or_else(|| dispatch_error(format!("entry point `{entry}` not found in program")))
    }
}

impl Device for Cpu {
    type Memory = Blob;
    type Program = Program;

    fn alloc(&self, size: usize) -> Result<Blob, Error> {
        let in_use = self.allocated.get();
        let total = in_use
            .checked_add(size)
            .ok_or_else(|| resource_exhausted(format!("{size} bytes exceeds the address space")))?;
        if let Some(limit) = self.config.memory_limit {
            if total > limit {
                return Err(resource_exhausted(format!(
                    "{size} bytes requested, {in_use} of {limit} bytes in use"
                )));
            }
        }
        let blob = Blob::new(size)?;
        self.allocated.set(total);
        Ok(blob)
    }

    fn free(&self, mem: Blob) {
        self.allocated.set(self.allocated.get() - mem.len())
    }

    fn compile(&self, source: &str) -> Result<Program, Error> {
        let module = parser::parse(source)?;
        debug!("compiled {} kernel(s)", module.kernels.len());
        Ok(Program(module))
    }

    fn limits(&self, program: &Program, entry: &str) -> Result<Limits, Error> {
        program.kernel(entry)?;
        Ok(Limits {
            max_threads_per_group: self.config.max_threads_per_group,
            execution_width: self.config.execution_width,
        })
    }

    fn launch(
        &self,
        program: &Program,
        entry: &str,
        grid: Grid,
        group: Grid,
        args: &[Option<&Blob>],
        _wait: bool,
    ) -> Result<(), Error> {
        let kernel = program.kernel(entry)?;
        grid.validate()?;
        match group.threads() {
            Some(n) if 0 < n && n <= self.config.max_threads_per_group => {}
            _ => {
                return Err(dispatch_error(format!(
                    "thread group {group} exceeds {} threads",
                    self.config.max_threads_per_group,
                )))
            }
        }
        trace!("launch {entry} grid {grid} group {group}");

        let args = args
            .iter()
            .map(|arg| arg.map(RawMem::new))
            .collect::<Vec<_>>();
        exec::run(kernel, grid, &args)
    }

    /// 发射总是在返回前完成，没有需要等待的工作。
    #[inline]
    fn synchronize(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Blob, Cpu, CpuConfig};
    use crate::{shader, Device, DeviceMemory, ErrorKind, Grid};
    use std::mem::{size_of, size_of_val};

    fn upload<T: Copy>(cpu: &Cpu, data: &[T]) -> Blob {
        let blob = cpu.alloc(size_of_val(data)).unwrap();
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr().cast::<u8>(), blob.as_mut_ptr(), blob.len())
        };
        blob
    }

    fn download<T: Copy>(blob: &Blob) -> Vec<T> {
        let ptr = blob.as_mut_ptr().cast::<T>();
        (0..blob.len() / size_of::<T>())
            .map(|i| unsafe { ptr.add(i).read_unaligned() })
            .collect()
    }

    fn launch(cpu: &Cpu, src: &str, entry: &str, grid: Grid, args: &[Option<&Blob>]) {
        let program = cpu.compile(src).unwrap();
        let group = grid.group(cpu.limits(&program, entry).unwrap());
        cpu.launch(&program, entry, grid, group, args, true).unwrap()
    }

    #[test]
    fn test_builtin_kernels() {
        let cpu = Cpu::default();
        let a = upload(&cpu, &[1i32, 2, 3, -4]);
        let b = upload(&cpu, &[10i32, 20, 30, 40]);
        let c = upload(&cpu, &[0i32; 4]);
        let src = shader::binary(shader::BinaryOp::Multiply, crate::resolve("int").unwrap()).unwrap();
        launch(&cpu, &src.text, &src.entry_point, Grid::linear(4), &[Some(&a), Some(&b), Some(&c)]);
        assert_eq!(download::<i32>(&c), [10, 40, 90, -160]);

        let x = upload(&cpu, &[1.5f32, -2.5, 3.]);
        let y = upload(&cpu, &[0u8; 3]);
        let src = shader::cast(crate::resolve("float").unwrap(), crate::resolve("uchar").unwrap());
        launch(&cpu, &src.text, &src.entry_point, Grid::linear(3), &[Some(&x), Some(&y)]);
        assert_eq!(download::<u8>(&y), [1, 254, 3]);
    }

    #[test]
    fn test_half() {
        use half::f16;
        let cpu = Cpu::default();
        let data = [1., 4., 9.].map(f16::from_f32);
        let x = upload(&cpu, &data);
        let y = upload(&cpu, &[f16::ZERO; 3]);
        let src = shader::unary(shader::UnaryOp::Sqrt, crate::resolve("half").unwrap()).unwrap();
        launch(&cpu, &src.text, &src.entry_point, Grid::linear(3), &[Some(&x), Some(&y)]);
        assert_eq!(download::<f16>(&y), [1., 2., 3.].map(f16::from_f32));
    }

    #[test]
    fn test_matmul() {
        const SRC: &str = r#"
struct MatDims { uint M; uint N; uint K; };

kernel void matmul(
    device const float *a [[buffer(0)]],
    device const float *b [[buffer(1)]],
    device float *c [[buffer(2)]],
    constant MatDims &dims [[buffer(3)]],
    uint2 gid [[thread_position_in_grid]]
) {
    if (gid.y >= dims.M || gid.x >= dims.N) return;
    float sum = 0.0f;
    for (uint k = 0; k < dims.K; k++) {
        sum += a[gid.y * dims.K + k] * b[k * dims.N + gid.x];
    }
    c[gid.y * dims.N + gid.x] = sum;
}
"#;
        let cpu = Cpu::default();
        // [2x3] · [3x2]
        let a = upload(&cpu, &[1f32, 2., 3., 4., 5., 6.]);
        let b = upload(&cpu, &[7f32, 8., 9., 10., 11., 12.]);
        let c = upload(&cpu, &[0f32; 4]);
        let dims = upload(&cpu, &[2u32, 2, 3]);
        launch(
            &cpu,
            SRC,
            "matmul",
            Grid::new(4, 4, 1),
            &[Some(&a), Some(&b), Some(&c), Some(&dims)],
        );
        assert_eq!(download::<f32>(&c), [58., 64., 139., 154.]);
    }

    #[test]
    fn test_control_flow() {
        const SRC: &str = r#"
kernel void collatz(device uint *steps [[buffer(0)]],
                    uint3 pos [[thread_position_in_grid]],
                    uint3 size [[threads_per_grid]]) {
    uint n = pos.x + pos.y * size.x + 1, count = 0;
    while (true) {
        if (n == 1) break;
        n = n % 2 == 0 ? n / 2 : 3 * n + 1;
        ++count;
    }
    int odd = 0;
    for (int i = 0; i < 10; i += 1) {
        if (i & 1) continue;
        odd -= -1;
    }
    steps[pos.x + pos.y * size.x] = count * 100 + (uint) odd;
}
"#;
        let cpu = Cpu::default();
        let steps = upload(&cpu, &[0u32; 6]);
        launch(&cpu, SRC, "collatz", Grid::new(3, 2, 1), &[Some(&steps)]);
        assert_eq!(download::<u32>(&steps), [5, 105, 705, 205, 505, 805]);
    }

    #[test]
    fn test_integer_types() {
        const SRC: &str = r#"
kernel void ints(device uint *y [[buffer(0)]], device int *z [[buffer(1)]]) {
    uint u = 0;
    y[0] = (u - 1u) > 10u ? 1u : 2u;
    y[1] = -1 < 1u ? 1 : 2;
    y[2] = u - 1 >> 28;
    uchar c = 255;
    y[3] = c + 1;
    c += 1;
    y[4] = c;
    int big = 2147483647;
    z[0] = big + 1 < 0 ? 1 : 2;
    z[1] = 0xFFFFFFFF;
    z[2] = -7 / 2;
    ushort s = 65535;
    z[3] = ~s;
}
"#;
        let cpu = Cpu::default();
        let y = upload(&cpu, &[0u32; 5]);
        let z = upload(&cpu, &[0i32; 4]);
        launch(&cpu, SRC, "ints", Grid::linear(1), &[Some(&y), Some(&z)]);
        assert_eq!(download::<u32>(&y), [1, 2, 15, 256, 0]);
        assert_eq!(download::<i32>(&z), [1, -1, -3, -65536]);
    }

    #[test]
    fn test_dispatch_errors() {
        const SRC: &str = r#"
kernel void copy(const device int *x [[buffer(0)]],
                 device int *y [[buffer(1)]],
                 uint i [[thread_position_in_grid]]) {
    y[i] = x[i] / x[0];
}
"#;
        let cpu = Cpu::default();
        let program = cpu.compile(SRC).unwrap();
        let x = upload(&cpu, &[1i32, 2]);
        let y = upload(&cpu, &[0i32; 4]);
        let zero = upload(&cpu, &[0i32; 4]);
        let group = Grid::linear(1);

        for (entry, grid, args) in [
            ("nothing", Grid::linear(2), [Some(&x), Some(&y)]),
            ("copy", Grid::linear(2), [Some(&x), None]),
            ("copy", Grid::linear(4), [Some(&x), Some(&y)]),
            ("copy", Grid::linear(1), [Some(&zero), Some(&y)]),
        ] {
            let e = cpu.launch(&program, entry, grid, group, &args, true).unwrap_err();
            assert_eq!(e.kind, ErrorKind::DispatchError, "{e}");
        }
        let e = cpu
            .launch(&program, "copy", Grid::linear(2), Grid::linear(2048), &[Some(&x), Some(&y)], true)
            .unwrap_err();
        assert_eq!(e.kind, ErrorKind::DispatchError);
        assert!(cpu.limits(&program, "nothing").is_err());
    }

    #[test]
    fn test_memory_limit() {
        let cpu = Cpu::new(CpuConfig {
            memory_limit: Some(1024),
            ..CpuConfig::default()
        });
        let a = cpu.alloc(1000).unwrap();
        assert_eq!(cpu.allocated(), 1000);
        assert_eq!(cpu.alloc(100).err().unwrap().kind, ErrorKind::ResourceExhausted);
        cpu.free(a);
        assert_eq!(cpu.allocated(), 0);
        cpu.free(cpu.alloc(1024).unwrap());
    }

    #[test]
    fn test_compile_error() {
        let cpu = Cpu::default();
        let e = cpu.compile("kernel void f( {}").err().unwrap();
        assert_eq!(e.kind, ErrorKind::CompileError);
        let program = cpu.compile(&shader::placeholder().text).unwrap();
        assert_eq!(program.entry_points().collect::<Vec<_>>(), ["empty_kernel"]);
    }
}
