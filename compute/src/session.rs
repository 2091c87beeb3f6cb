use crate::{
    buffer::BufferManager,
    compile_error,
    dispatch::marshal,
    dispatch_error, invalid_argument, resolve,
    shader::{BinaryOp, BuiltinOp, KernelCache, KernelSource, UnaryOp},
    BufferId, Config, Device, Element, Error, Grid, Limits, TypeDescriptor, TypeToken,
};
use log::{debug, info, trace, warn};
use std::{
    cell::Cell,
    fmt,
    ops::{Deref, DerefMut},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

/// 活动程序的来源。
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ProgramSource {
    Text(Arc<str>),
    File(PathBuf),
}

impl fmt::Display for ProgramSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Text(text) => write!(f, "<source, {} bytes>", text.len()),
            Self::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// 单次发射的选项。
#[derive(Clone, Copy, Debug)]
pub struct DispatchOptions<'a> {
    /// 只对本次发射生效的入口，[`None`] 使用活动入口。
    pub entry_point: Option<&'a str>,
    /// 为假时发射可能在网格执行完成前返回。
    /// 之后第一次从主机访问或释放缓冲区，以及 [`Session::synchronize`]，
    /// 都会先等待它完成并报告它的错误。
    pub wait_for_completion: bool,
}

impl Default for DispatchOptions<'_> {
    #[inline]
    fn default() -> Self {
        Self {
            entry_point: None,
            wait_for_completion: true,
        }
    }
}

impl<'a> DispatchOptions<'a> {
    #[inline]
    pub fn entry_point(name: &'a str) -> Self {
        Self {
            entry_point: Some(name),
            ..Self::default()
        }
    }

    #[inline]
    pub fn no_wait(self) -> Self {
        Self {
            wait_for_completion: false,
            ..self
        }
    }
}

struct ActiveProgram<P> {
    source: ProgramSource,
    program: P,
    entry: Option<String>,
}

/// 计算会话。
///
/// 独占一个设备，持有一个活动程序和至多一个活动入口。
/// 会话创建的缓冲区只能在本会话中使用，会话结束时全部释放。
pub struct Session<D: Device> {
    id: u32,
    closed: bool,
    /// 有未等待的发射。
    pending: Cell<bool>,
    // 字段按声明顺序析构，设备最后释放
    buffers: BufferManager<D::Memory>,
    active: ActiveProgram<D::Program>,
    kernels: KernelCache,
    device: D,
}

impl<D: Device> Session<D> {
    #[inline]
    pub fn initialize(device: D) -> Result<Self, Error> {
        Self::with_config(device, Config::default())
    }

    /// 建立会话，装载空程序作为初始的活动程序和入口。
    pub fn with_config(device: D, config: Config) -> Result<Self, Error> {
        static NEXT_ID: AtomicU32 = AtomicU32::new(0);

        let placeholder = crate::shader::placeholder();
        let program = device.compile(&placeholder.text)?;
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        info!("session {id} initialized");
        Ok(Self {
            id,
            closed: false,
            pending: Cell::new(false),
            buffers: BufferManager::new(id),
            active: ActiveProgram {
                source: ProgramSource::Text(placeholder.text),
                program,
                entry: Some(placeholder.entry_point),
            },
            kernels: KernelCache::new(config.new_cache()),
            device,
        })
    }

    #[inline]
    pub fn device(&self) -> &D {
        &self.device
    }

    // # 缓冲区

    /// 创建 `len` 个 `kind` 类型元素的缓冲区，内容为 0。
    pub fn create_buffer<'t>(
        &mut self,
        len: usize,
        kind: impl Into<TypeToken<'t>>,
    ) -> Result<BufferId, Error> {
        let kind = resolve(kind).map_err(|e| invalid_argument(e.info))?;
        self.buffers.create(&self.device, len, kind)
    }

    /// 创建与 `data` 等长的缓冲区并复制其内容。
    pub fn buffer_from_slice<T: Element>(&mut self, data: &[T]) -> Result<BufferId, Error> {
        let id = self
            .buffers
            .create(&self.device, data.len(), T::KIND.descriptor())?;
        self.view_mut::<T>(id)?.copy_from_slice(data);
        Ok(id)
    }

    /// 缓冲区的主机视图，`bool` 缓冲区以 `u8` 访问。
    ///
    /// 视图借用会话，持有视图时不能发射：
    ///
    /// ```compile_fail
    /// use compute::{common_cpu::Cpu, Session};
    ///
    /// let mut session = Session::initialize(Cpu::default()).unwrap();
    /// let y = session.create_buffer(4, "int").unwrap();
    /// let view = session.view::<i32>(y).unwrap();
    /// session.dispatch(4, &[Some(y)]).unwrap();
    /// assert_eq!(view[0], 0);
    /// ```
    pub fn view<T: Element>(&self, id: BufferId) -> Result<&[T], Error> {
        self.settle()?;
        self.buffers.get(id)?.view(id)
    }

    pub fn view_mut<T: Element>(&mut self, id: BufferId) -> Result<&mut [T], Error> {
        self.settle()?;
        self.buffers.get_mut(id)?.view_mut(id)
    }

    #[inline]
    pub fn buffer_len(&self, id: BufferId) -> Result<usize, Error> {
        self.buffers.get(id).map(|buf| buf.len)
    }

    #[inline]
    pub fn buffer_kind(&self, id: BufferId) -> Result<&'static TypeDescriptor, Error> {
        self.buffers.get(id).map(|buf| buf.kind)
    }

    #[inline]
    pub fn live_buffers(&self) -> impl Iterator<Item = BufferId> + '_ {
        self.buffers.live()
    }

    /// 释放缓冲区，重复释放没有效果。
    pub fn release_buffer(&mut self, id: BufferId) -> Result<(), Error> {
        self.settle()?;
        self.buffers.release(&self.device, id).map(drop)
    }

    // # 程序

    /// 编译并装载程序。失败时活动程序不变；成功后需要重新绑定入口。
    pub fn load_program(&mut self, source: impl Into<Arc<str>>) -> Result<(), Error> {
        let text = source.into();
        self.install(ProgramSource::Text(text.clone()), &text)
    }

    pub fn load_program_from_path(&mut self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| compile_error(format!("failed to read {}: {e}", path.display())))?;
        self.install(ProgramSource::File(path.to_path_buf()), &text)
    }

    fn install(&mut self, source: ProgramSource, text: &str) -> Result<(), Error> {
        let program = self.device.compile(text)?;
        debug!("session {} loaded {source}", self.id);
        self.active = ActiveProgram {
            source,
            program,
            entry: None,
        };
        Ok(())
    }

    /// 绑定活动入口。入口是否存在在发射时才检查。
    pub fn bind_entry_point(&mut self, name: impl Into<String>) {
        let name = name.into();
        trace!("session {} bound {name}", self.id);
        self.active.entry = Some(name)
    }

    #[inline]
    pub fn active_program(&self) -> &ProgramSource {
        &self.active.source
    }

    #[inline]
    pub fn active_entry_point(&self) -> Option<&str> {
        self.active.entry.as_deref()
    }

    // # 发射

    /// 以活动入口发射网格并等待完成。
    #[inline]
    pub fn dispatch(
        &mut self,
        grid: impl Into<Grid>,
        args: &[Option<BufferId>],
    ) -> Result<(), Error> {
        self.dispatch_with(grid, args, DispatchOptions::default())
    }

    pub fn dispatch_with(
        &mut self,
        grid: impl Into<Grid>,
        args: &[Option<BufferId>],
        options: DispatchOptions,
    ) -> Result<(), Error> {
        let grid = grid.into();
        grid.validate()?;
        let entry = self.entry(options.entry_point)?;
        let args = marshal(&self.buffers, args)?;

        let program = &self.active.program;
        let group = grid.group(self.device.limits(program, entry)?);
        trace!("session {} dispatch {entry} grid {grid} group {group}", self.id);
        self.device.launch(
            program,
            entry,
            grid,
            group,
            &args,
            options.wait_for_completion,
        )?;
        if !options.wait_for_completion {
            self.pending.set(true)
        }
        Ok(())
    }

    /// 等待此前所有的发射完成，报告未等待的发射中出现的错误。
    #[inline]
    pub fn synchronize(&mut self) -> Result<(), Error> {
        self.pending.set(false);
        self.device.synchronize()
    }

    fn settle(&self) -> Result<(), Error> {
        if self.pending.replace(false) {
            trace!("session {} waits for pending dispatches", self.id);
            self.device.synchronize()?
        }
        Ok(())
    }

    /// 活动入口单个线程组的最大线程数。
    #[inline]
    pub fn max_threads_per_group(&self) -> Result<usize, Error> {
        self.limits().map(|l| l.max_threads_per_group)
    }

    /// 活动入口偏好的执行宽度。
    #[inline]
    pub fn preferred_execution_width(&self) -> Result<usize, Error> {
        self.limits().map(|l| l.execution_width)
    }

    fn limits(&self) -> Result<Limits, Error> {
        let entry = self.entry(None)?;
        self.device.limits(&self.active.program, entry)
    }

    fn entry<'a>(&'a self, overridden: Option<&'a str>) -> Result<&'a str, Error> {
        overridden
            .or(self.active.entry.as_deref())
            .ok_or_else(|| dispatch_error("no entry point bound"))
    }

    // # 内置运算

    pub fn add(&mut self, a: BufferId, b: BufferId) -> Result<BufferId, Error> {
        self.binary(BinaryOp::Add, a, b)
    }

    pub fn subtract(&mut self, a: BufferId, b: BufferId) -> Result<BufferId, Error> {
        self.binary(BinaryOp::Subtract, a, b)
    }

    pub fn multiply(&mut self, a: BufferId, b: BufferId) -> Result<BufferId, Error> {
        self.binary(BinaryOp::Multiply, a, b)
    }

    /// 把 `x` 的每个元素转换为 `kind`，存入新的缓冲区。
    pub fn cast<'t>(
        &mut self,
        x: BufferId,
        kind: impl Into<TypeToken<'t>>,
    ) -> Result<BufferId, Error> {
        let to = resolve(kind)?;
        let (len, from) = self.describe(x)?;
        let op = BuiltinOp::Cast {
            from: from.kind(),
            to: to.kind(),
        };
        self.transient(op, len, to, &[Some(x)])
    }

    pub fn sqrt(&mut self, x: BufferId) -> Result<BufferId, Error> {
        self.unary(UnaryOp::Sqrt, x)
    }

    pub fn cos(&mut self, x: BufferId) -> Result<BufferId, Error> {
        self.unary(UnaryOp::Cos, x)
    }

    pub fn sin(&mut self, x: BufferId) -> Result<BufferId, Error> {
        self.unary(UnaryOp::Sin, x)
    }

    pub fn tan(&mut self, x: BufferId) -> Result<BufferId, Error> {
        self.unary(UnaryOp::Tan, x)
    }

    fn describe(&self, id: BufferId) -> Result<(usize, &'static TypeDescriptor), Error> {
        self.buffers.get(id).map(|buf| (buf.len, buf.kind))
    }

    fn binary(&mut self, op: BinaryOp, a: BufferId, b: BufferId) -> Result<BufferId, Error> {
        let (len, kind) = self.describe(a)?;
        let (len_b, kind_b) = self.describe(b)?;
        if kind != kind_b {
            return Err(invalid_argument(format!(
                "{a} holds {kind}, {b} holds {kind_b}"
            )));
        }
        if len != len_b {
            return Err(invalid_argument(format!(
                "{a} has {len} elements, {b} has {len_b}"
            )));
        }
        self.transient(BuiltinOp::Binary(op, kind.kind()), len, kind, &[Some(a), Some(b)])
    }

    fn unary(&mut self, op: UnaryOp, x: BufferId) -> Result<BufferId, Error> {
        let (len, kind) = self.describe(x)?;
        self.transient(BuiltinOp::Unary(op, kind.kind()), len, kind, &[Some(x)])
    }

    /// 在临时装载的内置程序上以 `(len, 1, 1)` 网格计算，输出追加为最后一个参数。
    fn transient(
        &mut self,
        op: BuiltinOp,
        len: usize,
        kind: &'static TypeDescriptor,
        inputs: &[Option<BufferId>],
    ) -> Result<BufferId, Error> {
        let kernel = self.kernels.get(op)?;
        let out = self.buffers.create(&self.device, len, kind)?;
        let mut args = inputs.to_vec();
        args.push(Some(out));

        let result =
            Transient::enter(self, kernel).and_then(|mut session| session.dispatch(len, &args));
        match result {
            Ok(()) => Ok(out),
            Err(e) => {
                warn!("session {} builtin {op} failed: {e}", self.id);
                self.buffers.release(&self.device, out)?;
                Err(e)
            }
        }
    }

    // # 结束

    /// 等待所有发射完成，释放所有缓冲区，然后释放程序和设备。
    #[inline]
    pub fn teardown(mut self) {
        self.close()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.device.synchronize() {
            warn!("session {} had a failed dispatch at teardown: {e}", self.id)
        }
        self.buffers.clear(&self.device);
        info!("session {} torn down", self.id);
    }
}

impl<D: Device> Drop for Session<D> {
    #[inline]
    fn drop(&mut self) {
        self.close()
    }
}

/// 内置运算期间的会话。
///
/// 进入时保存活动程序和入口，离开时（包括出错和展开）原样恢复。
/// 保存的是已编译的程序，恢复不需要重新编译。
struct Transient<'s, D: Device> {
    session: &'s mut Session<D>,
    saved: Option<ActiveProgram<D::Program>>,
}

impl<'s, D: Device> Transient<'s, D> {
    fn enter(session: &'s mut Session<D>, kernel: KernelSource) -> Result<Self, Error> {
        let program = session.device.compile(&kernel.text)?;
        let builtin = ActiveProgram {
            source: ProgramSource::Text(kernel.text),
            program,
            entry: Some(kernel.entry_point),
        };
        let saved = std::mem::replace(&mut session.active, builtin);
        Ok(Self {
            session,
            saved: Some(saved),
        })
    }
}

impl<D: Device> Deref for Transient<'_, D> {
    type Target = Session<D>;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl<D: Device> DerefMut for Transient<'_, D> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl<D: Device> Drop for Transient<'_, D> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.session.active = saved;
            trace!("session {} restored {}", self.session.id, self.session.active.source);
        }
    }
}
