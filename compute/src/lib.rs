// #![deny(warnings)]

mod buffer;
mod common;
mod dispatch;
mod handle;
mod session;

pub mod shader;

pub use ::common::*;
pub use buffer::BufferId;
pub use common::Config;
pub use dispatch::{Grid, Limits};
pub use session::{DispatchOptions, ProgramSource, Session};

#[cfg(any(use_cpu, test))]
pub use handle::common_cpu;

#[cfg(use_metal)]
pub use handle::apple_metal;
#[cfg(use_metal)]
pub extern crate metal;

/// 统一内存。
///
/// 设备与主机共享同一块存储区域，主机写入在设备读取前可见，反之亦然（需等待此前的发射完成）。
pub trait DeviceMemory {
    /// 存储区域的字节数。
    fn len(&self) -> usize;
    /// 主机地址空间中的起始地址。
    ///
    /// 地址来自设备分配，而非来自对 `self` 的引用，因此设备可以通过它写入。
    fn as_mut_ptr(&self) -> *mut u8;

    #[inline]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 计算设备抽象。
///
/// 约定设备如何分配统一内存、编译程序和发射线程网格。
/// 这个特质应该由管理设备的基本单元实现，通常是**设备上下文**。
pub trait Device {
    /// 设备分配的统一内存类型。
    type Memory: DeviceMemory;
    /// 编译后的程序，可能包含多个入口。
    type Program;

    /// 分配 `size` 字节的统一内存，内容初始化为 0。
    fn alloc(&self, size: usize) -> Result<Self::Memory, Error>;
    /// 回收统一内存。
    fn free(&self, mem: Self::Memory);

    /// 编译程序源码。
    fn compile(&self, source: &str) -> Result<Self::Program, Error>;

    /// 查询程序中某个入口的执行限制。
    fn limits(&self, program: &Self::Program, entry: &str) -> Result<Limits, Error>;

    /// 发射线程网格。
    ///
    /// `args` 按缓冲区槽位排列，`None` 表示该槽位不绑定。
    /// `wait` 为假时，函数可能在网格执行完成前返回。
    fn launch(
        &self,
        program: &Self::Program,
        entry: &str,
        grid: Grid,
        group: Grid,
        args: &[Option<&Self::Memory>],
        wait: bool,
    ) -> Result<(), Error>;

    /// 等待所有已发射的网格执行完成。
    ///
    /// 未等待的发射失败时在这里报告。
    fn synchronize(&self) -> Result<(), Error>;
}
