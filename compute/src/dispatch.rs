use crate::{buffer::BufferManager, invalid_argument, BufferId, DeviceMemory, Error};
use std::fmt;

/// 线程网格。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Grid {
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

impl Grid {
    #[inline]
    pub const fn new(width: usize, height: usize, depth: usize) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    /// `(n, 1, 1)` 网格。
    #[inline]
    pub const fn linear(n: usize) -> Self {
        Self::new(n, 1, 1)
    }

    /// 网格中的线程总数，溢出时返回 [`None`]。
    #[inline]
    pub fn threads(&self) -> Option<usize> {
        self.width
            .checked_mul(self.height)?
            .checked_mul(self.depth)
    }

    pub(crate) fn validate(&self) -> Result<usize, Error> {
        match self.threads() {
            Some(0) => Err(invalid_argument(format!("empty grid {self}"))),
            Some(n) => Ok(n),
            None => Err(invalid_argument(format!("grid {self} overflows"))),
        }
    }

    /// 在设备限制内为网格选择线程组形状。
    ///
    /// 组宽度不超过网格宽度和单组线程上限，且大于执行宽度时取执行宽度的整数倍；
    /// 剩余的单组容量依次分给高度和深度。
    pub fn group(&self, limits: Limits) -> Grid {
        let Limits {
            max_threads_per_group: max,
            execution_width: simd,
        } = limits;
        let max = max.max(1);
        let simd = simd.max(1);

        let mut width = self.width.clamp(1, max);
        if width > simd {
            width -= width % simd
        }
        let height = self.height.clamp(1, max / width);
        let depth = self.depth.clamp(1, max / (width * height));
        Grid::new(width, height, depth)
    }
}

impl From<usize> for Grid {
    #[inline]
    fn from(n: usize) -> Self {
        Self::linear(n)
    }
}

impl From<[usize; 3]> for Grid {
    #[inline]
    fn from([width, height, depth]: [usize; 3]) -> Self {
        Self::new(width, height, depth)
    }
}

impl From<(usize, usize, usize)> for Grid {
    #[inline]
    fn from((width, height, depth): (usize, usize, usize)) -> Self {
        Self::new(width, height, depth)
    }
}

impl fmt::Display for Grid {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.width, self.height, self.depth)
    }
}

/// 入口的执行限制。
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Limits {
    /// 单个线程组的最大线程数。
    pub max_threads_per_group: usize,
    /// 设备偏好的执行宽度，线程组宽度应是它的倍数。
    pub execution_width: usize,
}

/// 把缓冲区参数编组为设备参数，`None` 保留为空槽位。
pub(crate) fn marshal<'a, M: DeviceMemory>(
    buffers: &'a BufferManager<M>,
    args: &[Option<BufferId>],
) -> Result<Vec<Option<&'a M>>, Error> {
    args.iter()
        .map(|arg| match arg {
            Some(id) => buffers.get(*id).map(|buf| Some(&buf.mem)),
            None => Ok(None),
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::{Grid, Limits};
    use crate::ErrorKind;

    const LIMITS: Limits = Limits {
        max_threads_per_group: 1024,
        execution_width: 32,
    };

    #[test]
    fn test_normalize() {
        assert_eq!(Grid::from(100), Grid::new(100, 1, 1));
        assert_eq!(Grid::from([3, 4, 5]), Grid::new(3, 4, 5));
        assert_eq!(Grid::from((3, 4, 5)).threads(), Some(60));
        assert_eq!(Grid::new(usize::MAX, 2, 1).threads(), None);
    }

    #[test]
    fn test_validate() {
        assert_eq!(Grid::linear(7).validate().unwrap(), 7);
        for grid in [Grid::linear(0), Grid::new(4, 0, 1), Grid::new(usize::MAX, 3, 1)] {
            assert_eq!(grid.validate().unwrap_err().kind, ErrorKind::InvalidArgument);
        }
    }

    #[test]
    fn test_group() {
        assert_eq!(Grid::linear(100_000).group(LIMITS), Grid::new(1024, 1, 1));
        assert_eq!(Grid::linear(100).group(LIMITS), Grid::new(96, 1, 1));
        assert_eq!(Grid::linear(10).group(LIMITS), Grid::new(10, 1, 1));
        assert_eq!(Grid::new(10, 10, 1).group(LIMITS), Grid::new(10, 10, 1));
        assert_eq!(Grid::new(64, 64, 64).group(LIMITS), Grid::new(64, 16, 1));
        for grid in [Grid::linear(1), Grid::new(33, 77, 5), Grid::new(5000, 3, 2)] {
            let group = grid.group(LIMITS);
            assert!(group.threads().unwrap() <= LIMITS.max_threads_per_group);
        }
    }
}
