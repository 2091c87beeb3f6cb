use crate::{
    invalid_argument, use_after_free, Device, DeviceMemory, Element, Error, TypeDescriptor,
};
use log::{debug, trace};
use std::{
    fmt,
    slice::{from_raw_parts, from_raw_parts_mut},
};

/// 缓冲区标识。
///
/// 槽位释放后可以被新的缓冲区复用，但代数不同，因此标识在所属会话内不会重复。
/// 携带会话标记以拒绝跨会话使用。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct BufferId {
    session: u32,
    index: u32,
    generation: u32,
}

impl BufferId {
    /// 缓冲区在会话内的槽位。
    #[inline]
    pub const fn index(&self) -> usize {
        self.index as _
    }
}

impl fmt::Display for BufferId {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buffer#{}.{}", self.index, self.generation)
    }
}

pub(crate) struct Buffer<M> {
    pub kind: &'static TypeDescriptor,
    pub len: usize,
    pub mem: M,
}

impl<M: DeviceMemory> Buffer<M> {
    fn check<T: Element>(&self, id: BufferId) -> Result<(), Error> {
        if T::KIND == self.kind.kind().storage() {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "{id} holds {}, viewed as {}",
                self.kind,
                T::KIND,
            )))
        }
    }

    pub fn view<T: Element>(&self, id: BufferId) -> Result<&[T], Error> {
        self.check::<T>(id)?;
        Ok(unsafe { from_raw_parts(self.mem.as_mut_ptr().cast::<T>(), self.len) })
    }

    pub fn view_mut<T: Element>(&mut self, id: BufferId) -> Result<&mut [T], Error> {
        self.check::<T>(id)?;
        Ok(unsafe { from_raw_parts_mut(self.mem.as_mut_ptr().cast::<T>(), self.len) })
    }
}

struct Slot<M> {
    generation: u32,
    buffer: Option<Buffer<M>>,
}

/// 会话独占的缓冲区表。
///
/// 释放的槽位进入空闲表，复用时代数加一；持有旧代数的标识访问时报告
/// [`UseAfterFree`](crate::ErrorKind::UseAfterFree)。
pub(crate) struct BufferManager<M> {
    session: u32,
    slots: Vec<Slot<M>>,
    free: Vec<u32>,
}

impl<M: DeviceMemory> BufferManager<M> {
    pub const fn new(session: u32) -> Self {
        Self {
            session,
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub fn create<D>(
        &mut self,
        device: &D,
        len: usize,
        kind: &'static TypeDescriptor,
    ) -> Result<BufferId, Error>
    where
        D: Device<Memory = M>,
    {
        if len == 0 {
            return Err(invalid_argument("buffer length must be greater than 0"));
        }
        let size = len
            .checked_mul(kind.size())
            .ok_or_else(|| invalid_argument(format!("{len} × {kind} overflows")))?;
        if self.free.is_empty() && u32::try_from(self.slots.len()).is_err() {
            return Err(invalid_argument("too many buffers in one session"));
        }

        let mem = device.alloc(size)?;
        debug_assert!(mem.len() >= size);
        let buffer = Some(Buffer { kind, len, mem });
        let (index, generation) = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.buffer = buffer;
                (index, slot.generation)
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    buffer,
                });
                ((self.slots.len() - 1) as _, 0)
            }
        };

        let id = BufferId {
            session: self.session,
            index,
            generation,
        };
        trace!("{id} created: {len} × {kind} ({size} bytes)");
        Ok(id)
    }

    /// 释放缓冲区，重复释放没有效果。返回本次调用是否真正释放了存储。
    pub fn release<D>(&mut self, device: &D, id: BufferId) -> Result<bool, Error>
    where
        D: Device<Memory = M>,
    {
        let slot = self.slot(id)?;
        // 槽位已被复用，旧标识早已释放
        if slot.generation != id.generation {
            return Ok(false);
        }
        Ok(match slot.buffer.take() {
            Some(Buffer { mem, .. }) => {
                device.free(mem);
                self.free.push(id.index);
                trace!("{id} released");
                true
            }
            None => false,
        })
    }

    pub fn get(&self, id: BufferId) -> Result<&Buffer<M>, Error> {
        self.belongs(id)?;
        match self.slots.get(id.index()) {
            Some(Slot {
                generation,
                buffer: Some(buf),
            }) if *generation == id.generation => Ok(buf),
            Some(_) => Err(use_after_free(format!("{id} has been released"))),
            None => Err(invalid_argument(format!("{id} does not exist"))),
        }
    }

    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut Buffer<M>, Error> {
        match self.slot(id)? {
            Slot {
                generation,
                buffer: Some(buf),
            } if *generation == id.generation => Ok(buf),
            _ => Err(use_after_free(format!("{id} has been released"))),
        }
    }

    pub fn live(&self) -> impl Iterator<Item = BufferId> + '_ {
        let session = self.session;
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.buffer.is_some())
            .map(move |(i, slot)| BufferId {
                session,
                index: i as _,
                generation: slot.generation,
            })
    }

    /// 释放所有仍存活的缓冲区。
    pub fn clear<D>(&mut self, device: &D)
    where
        D: Device<Memory = M>,
    {
        let mut count = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(buf) = slot.buffer.take() {
                device.free(buf.mem);
                self.free.push(i as _);
                count += 1
            }
        }
        if count > 0 {
            debug!("released {count} buffers still alive");
        }
    }

    fn belongs(&self, id: BufferId) -> Result<(), Error> {
        if id.session == self.session {
            Ok(())
        } else {
            Err(invalid_argument(format!(
                "{id} belongs to session {}, not {}",
                id.session, self.session,
            )))
        }
    }

    fn slot(&mut self, id: BufferId) -> Result<&mut Slot<M>, Error> {
        self.belongs(id)?;
        self.slots
            .get_mut(id.index())
            .ok_or_else(|| invalid_argument(format!("{id} does not exist")))
    }
}
