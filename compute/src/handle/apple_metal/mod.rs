//! Apple Metal 设备。

use crate::{
    compile_error, dispatch_error, resource_exhausted, Device, DeviceMemory, Error, Grid, Limits,
};
use log::{debug, trace, warn};
use metal::{
    Buffer, CommandBuffer, CommandBufferRef, CommandQueue, CompileOptions, ComputePipelineState,
    Library, MTLCommandBufferStatus, MTLResourceOptions, MTLSize,
};
use std::{cell::RefCell, collections::HashMap};

impl DeviceMemory for Buffer {
    #[inline]
    fn len(&self) -> usize {
        self.length() as _
    }

    #[inline]
    fn as_mut_ptr(&self) -> *mut u8 {
        self.contents().cast()
    }
}

pub struct MtlDevice {
    device: metal::Device,
    queue: CommandQueue,
    /// 已提交但未等待的命令，同步时检查状态。
    pending: RefCell<Vec<(String, CommandBuffer)>>,
}

impl MtlDevice {
    /// 系统默认的 Metal 设备。
    pub fn system_default() -> Result<Self, Error> {
        let device = metal::Device::system_default()
            .ok_or_else(|| resource_exhausted("no Metal device available"))?;
        debug!("metal device: {}", device.name());
        Ok(Self::new(device))
    }

    pub fn new(device: metal::Device) -> Self {
        let queue = device.new_command_queue();
        Self {
            device,
            queue,
            pending: Default::default(),
        }
    }

    #[inline]
    pub fn device(&self) -> &metal::Device {
        &self.device
    }
}

/// 编译后的库，每个入口的计算管线在首次使用时创建。
pub struct Program {
    library: Library,
    pipelines: RefCell<HashMap<String, ComputePipelineState>>,
}

impl Program {
    fn pipeline(
        &self,
        device: &metal::Device,
        entry: &str,
    ) -> Result<ComputePipelineState, Error> {
        if let Some(pipeline) = self.pipelines.borrow().get(entry) {
            return Ok(pipeline.clone());
        }
        let function = self
            .library
            .get_function(entry, None)
            .map_err(|e| dispatch_error(format!("entry point `{entry}` not found: {e}")))?;
        let pipeline = device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(|e| dispatch_error(format!("pipeline for `{entry}` failed: {e}")))?;
        trace!("pipeline created: {entry}");
        self.pipelines
            .borrow_mut()
            .insert(entry.to_string(), pipeline.clone());
        Ok(pipeline)
    }
}

impl Device for MtlDevice {
    type Memory = Buffer;
    type Program = Program;

    fn alloc(&self, size: usize) -> Result<Buffer, Error> {
        let max = self.device.max_buffer_length();
        if size as u64 > max {
            return Err(resource_exhausted(format!(
                "{size} bytes exceeds the maximum buffer length {max}"
            )));
        }
        // 共享存储的新缓冲区内容为 0
        Ok(self
            .device
            .new_buffer(size.max(1) as _, MTLResourceOptions::StorageModeShared))
    }

    #[inline]
    fn free(&self, mem: Buffer) {
        drop(mem)
    }

    fn compile(&self, source: &str) -> Result<Program, Error> {
        let library = self
            .device
            .new_library_with_source(source, &CompileOptions::new())
            .map_err(compile_error)?;
        debug!("compiled library with {} function(s)", library.function_names().len());
        Ok(Program {
            library,
            pipelines: Default::default(),
        })
    }

    fn limits(&self, program: &Program, entry: &str) -> Result<Limits, Error> {
        let pipeline = program.pipeline(&self.device, entry)?;
        Ok(Limits {
            max_threads_per_group: pipeline.max_total_threads_per_threadgroup() as _,
            execution_width: pipeline.thread_execution_width() as _,
        })
    }

    fn launch(
        &self,
        program: &Program,
        entry: &str,
        grid: Grid,
        group: Grid,
        args: &[Option<&Buffer>],
        wait: bool,
    ) -> Result<(), Error> {
        let pipeline = program.pipeline(&self.device, entry)?;
        let size = |g: Grid| MTLSize::new(g.width as _, g.height as _, g.depth as _);

        let cmd = self.queue.new_command_buffer();
        let encoder = cmd.new_compute_command_encoder();
        encoder.set_compute_pipeline_state(&pipeline);
        for (i, arg) in args.iter().enumerate() {
            encoder.set_buffer(i as _, arg.map(|buf| &**buf), 0)
        }
        encoder.dispatch_threads(size(grid), size(group));
        encoder.end_encoding();
        cmd.commit();
        trace!("launch {entry} grid {grid} group {group} wait {wait}");

        if wait {
            cmd.wait_until_completed();
            completed(entry, cmd)
        } else {
            self.pending
                .borrow_mut()
                .push((entry.to_string(), cmd.to_owned()));
            Ok(())
        }
    }

    fn synchronize(&self) -> Result<(), Error> {
        let pending = std::mem::take(&mut *self.pending.borrow_mut());
        let mut result = Ok(());
        for (entry, cmd) in pending {
            cmd.wait_until_completed();
            if let Err(e) = completed(&entry, &cmd) {
                // 报告第一个错误，其余只记录
                if result.is_ok() {
                    result = Err(e)
                } else {
                    warn!("{e}")
                }
            }
        }
        result
    }
}

fn completed(entry: &str, cmd: &CommandBufferRef) -> Result<(), Error> {
    match cmd.status() {
        MTLCommandBufferStatus::Error => {
            Err(dispatch_error(format!("{entry}: command buffer failed")))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use super::MtlDevice;
    use crate::{shader, Device, DeviceMemory, ErrorKind, Grid};

    #[test]
    fn test_add() {
        let Ok(mtl) = MtlDevice::system_default() else {
            return;
        };
        let src = shader::binary(shader::BinaryOp::Add, crate::resolve("int").unwrap()).unwrap();
        let program = mtl.compile(&src.text).unwrap();
        let n = 1000;
        let buffers = [(); 3].map(|_| mtl.alloc(n * 4).unwrap());
        for (i, buf) in buffers[..2].iter().enumerate() {
            let ptr = buf.as_mut_ptr().cast::<i32>();
            for j in 0..n {
                unsafe { ptr.add(j).write(j as i32 * (i as i32 + 1)) }
            }
        }
        let grid = Grid::linear(n);
        let group = grid.group(mtl.limits(&program, &src.entry_point).unwrap());
        let args = buffers.iter().map(Some).collect::<Vec<_>>();
        mtl.launch(&program, &src.entry_point, grid, group, &args, true)
            .unwrap();
        let c = buffers[2].as_mut_ptr().cast::<i32>();
        for j in 0..n {
            assert_eq!(unsafe { c.add(j).read() }, 3 * j as i32);
        }

        for buf in &buffers[..2] {
            let ptr = buf.as_mut_ptr().cast::<i32>();
            unsafe { ptr.write(-1) }
        }
        mtl.launch(&program, &src.entry_point, grid, group, &args, false)
            .unwrap();
        mtl.synchronize().unwrap();
        assert_eq!(unsafe { buffers[2].as_mut_ptr().cast::<i32>().read() }, -2);
        assert!(mtl.pending.borrow().is_empty());

        let e = mtl.limits(&program, "nothing").unwrap_err();
        assert_eq!(e.kind, ErrorKind::DispatchError);
        assert_eq!(
            mtl.compile("kernel void f( {").err().unwrap().kind,
            ErrorKind::CompileError
        );
    }
}
