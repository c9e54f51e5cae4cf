use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

pub const K: usize = 1024;
pub const M: usize = K * K;

#[inline(always)]
pub const fn align_down(addr: usize, align: usize) -> usize {
    addr & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !align.wrapping_sub(1)
}

#[inline(always)]
pub const fn is_aligned(addr: usize, align: usize) -> bool {
    addr & align.wrapping_sub(1) == 0
}

/// Rounds `value` up to the nearest multiple of `align`, which does not have to be a power of two.
pub fn align_usize(value: usize, align: usize) -> usize {
    if align == 0 {
        return value;
    }

    ((value + align - 1) / align) * align
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}

/// Wall clock time in seconds.
pub fn os_elapsed_time() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Percentage of `value` in `of`, 0 when `of` is 0.
pub fn percent_of(value: usize, of: usize) -> f64 {
    if of == 0 {
        0.0
    } else {
        value as f64 * 100.0 / of as f64
    }
}

/// Boolean flag shared between mutators and collector threads.
///
/// `try_set` and `try_unset` report whether this call performed the transition, which lets
/// exactly one of many racing threads act on it.
#[derive(Default)]
pub struct ShenandoahSharedFlag {
    value: AtomicBool,
}

impl ShenandoahSharedFlag {
    pub const fn new() -> Self {
        Self {
            value: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn set(&self) {
        self.value.store(true, Ordering::Release);
    }

    #[inline]
    pub fn unset(&self) {
        self.value.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_unset(&self) -> bool {
        !self.is_set()
    }

    pub fn try_set(&self) -> bool {
        self.value
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn try_unset(&self) -> bool {
        self.value
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Keeps the last `capacity` samples and answers average queries over them.
#[derive(Clone, Debug)]
pub struct TruncatedSeq {
    samples: VecDeque<f64>,
    capacity: usize,
    total: usize,
}

impl TruncatedSeq {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            total: 0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        self.total += 1;
    }

    /// Number of samples ever added, including those that fell out of the window.
    pub fn num(&self) -> usize {
        self.total
    }

    pub fn avg(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    pub fn sd(&self) -> f64 {
        if self.samples.len() < 2 {
            return 0.0;
        }
        let avg = self.avg();
        let var = self
            .samples
            .iter()
            .map(|x| (x - avg) * (x - avg))
            .sum::<f64>()
            / self.samples.len() as f64;
        var.sqrt()
    }

    pub fn last(&self) -> Option<f64> {
        self.samples.back().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_down(13, 8), 8);
        assert!(is_aligned(4096, 4096));
        assert_eq!(align_usize(10, 3), 12);
    }

    #[test]
    fn test_formatted_size() {
        assert_eq!(formatted_size(512).to_string(), "512B");
        assert_eq!(formatted_size(2048).to_string(), "2.0K");
        assert_eq!(formatted_size(3 * 1024 * 1024).to_string(), "3.0M");
    }

    #[test]
    fn test_shared_flag_single_winner() {
        let flag = ShenandoahSharedFlag::new();
        assert!(flag.try_set());
        assert!(!flag.try_set());
        assert!(flag.is_set());
        assert!(flag.try_unset());
        assert!(!flag.try_unset());
    }

    #[test]
    fn test_truncated_seq_window() {
        let mut seq = TruncatedSeq::new(3);
        for x in [1.0, 2.0, 3.0, 4.0].iter() {
            seq.add(*x);
        }
        assert_eq!(seq.num(), 4);
        assert!((seq.avg() - 3.0).abs() < 1e-9);
        assert_eq!(seq.last(), Some(4.0));
    }
}
