#[cfg(any(use_cpu, test))]
mod blob;

#[cfg(any(use_cpu, test))]
pub use blob::Blob;

use lru::LruCache;
use std::{hash::Hash, num::NonZeroUsize};

#[derive(Clone, Debug)]
pub struct Config {
    /// 生成内核的缓存容量，为 0 时每次调用都重新生成。
    pub kernel_cache: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { kernel_cache: 16 }
    }
}

impl Config {
    pub(crate) fn new_cache<K: Hash + Eq, V>(&self) -> Option<LruCache<K, V>> {
        NonZeroUsize::new(self.kernel_cache).map(LruCache::new)
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::fmt;

    /// 结果与参考值之间允许的误差，绝对误差和相对误差都超出才算不符。
    #[derive(Clone, Copy, Debug)]
    pub struct Tolerance {
        pub abs: f64,
        pub rel: f64,
    }

    impl Tolerance {
        pub const fn new(abs: f64, rel: f64) -> Self {
            Self { abs, rel }
        }

        /// 逐个比较 `(结果, 参考值)`，NaN 总是不符。
        pub fn check(self, pairs: impl IntoIterator<Item = (f64, f64)>) -> Report {
            let mut report = Report {
                tolerance: self,
                worst_abs: 0.,
                worst_rel: 0.,
                mismatches: Vec::new(),
                total: 0,
            };
            for (actual, expected) in pairs {
                let abs = (actual - expected).abs();
                let rel = abs / expected.abs().max(f64::MIN_POSITIVE);
                report.worst_abs = report.worst_abs.max(abs);
                report.worst_rel = report.worst_rel.max(rel);
                if !(abs <= self.abs || rel <= self.rel) {
                    report.mismatches.push((report.total, actual, expected));
                }
                report.total += 1;
            }
            report
        }
    }

    pub struct Report {
        tolerance: Tolerance,
        worst_abs: f64,
        worst_rel: f64,
        mismatches: Vec<(usize, f64, f64)>,
        total: usize,
    }

    impl Report {
        #[inline]
        pub fn passed(&self) -> bool {
            self.mismatches.is_empty()
        }

        #[inline]
        pub fn total(&self) -> usize {
            self.total
        }
    }

    impl fmt::Display for Report {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            let Tolerance { abs, rel } = self.tolerance;
            write!(
                f,
                "{}/{} outside (abs {abs:e}, rel {rel:e}); worst abs {:.3e}, worst rel {:.3e}",
                self.mismatches.len(),
                self.total,
                self.worst_abs,
                self.worst_rel,
            )?;
            for (i, actual, expected) in self.mismatches.iter().take(8) {
                write!(f, "\n  [{i}] {actual} != {expected}")?
            }
            Ok(())
        }
    }

    #[test]
    fn test_tolerance() {
        let tol = Tolerance::new(1e-3, 1e-2);
        let report = tol.check([(1.0, 1.0005), (100.5, 100.), (0., 1e-4), (f64::NAN, 0.)]);
        assert_eq!(report.total(), 4);
        assert_eq!(report.mismatches.iter().map(|m| m.0).collect::<Vec<_>>(), [3]);
        assert!(!tol.check([(1., 2.)]).passed());
        assert!(tol.check(std::iter::empty()).passed());
    }
}
