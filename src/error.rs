use thiserror::Error;

use crate::utils::{formatted_size, FormattedSize};

fn fmt_size(size: &usize) -> FormattedSize {
    formatted_size(*size)
}

/// Rejected heap configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Max heap size ({}) is too low to afford the minimum number of regions ({}) of region size ({})",
        fmt_size(.max_heap_size),
        .min_regions,
        fmt_size(.region_size)
    )]
    HeapTooSmall {
        max_heap_size: usize,
        min_regions: usize,
        region_size: usize,
    },
    #[error("Heap region size ({}) should be larger than min region size ({})", fmt_size(.size), fmt_size(.min))]
    RegionTooSmall { size: usize, min: usize },
    #[error("Heap region size ({}) should be lower than max region size ({})", fmt_size(.size), fmt_size(.max))]
    RegionTooLarge { size: usize, max: usize },
    #[error("{name} should be within [0; 100], got {value}")]
    BadPercentage { name: &'static str, value: usize },
    #[error("{0} should be at least 1")]
    NoWorkers(&'static str),
    #[error("Cannot reserve {} for the heap", fmt_size(.0))]
    ReserveFailed(usize),
    #[error("Cannot start the control thread: {0}")]
    ControlThread(#[from] std::io::Error),
}

/// Allocation failure that survived every retry, including a full collection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("Out of memory: cannot allocate {requested_words} words")]
    OutOfMemory { requested_words: usize },
    #[error("Heap is shutting down")]
    ShuttingDown,
}

/// Heap inconsistency reported by the verifier.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("{label}: region {index}: {message}")]
    Region {
        label: &'static str,
        index: usize,
        message: String,
    },
    #[error("{label}: object {addr:#x}: {message}")]
    Object {
        label: &'static str,
        addr: usize,
        message: String,
    },
    #[error("{label}: root {root}: {message}")]
    Root {
        label: &'static str,
        root: &'static str,
        message: String,
    },
    #[error("{label}: {message}")]
    Heap { label: &'static str, message: String },
}
