//! Target capabilities and fixed hardware maxima.
//!
//! The scheduling core only needs to know whether it is scheduling for a GPU
//! and the hard limits that make a schedule illegal on that device.

/// Description of the machine being scheduled for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Target identifier (e.g., "CPU", "CUDA").
    pub device: String,

    /// Whether loops are mapped onto GPU blocks and threads.
    pub has_gpu: bool,

    /// Maximum grid extent per block dimension [x, y, z].
    pub max_blocks: [i64; 3],

    /// Maximum block extent per thread dimension [x, y, z].
    pub max_threads: [i64; 3],

    /// Maximum number of threads in one block.
    pub max_threads_per_block: i64,

    /// Threads per warp.
    pub warp_size: i64,

    /// Largest serial tile that is fully unrolled.
    pub unroll_limit: i64,

    /// Largest extent product of any other serial loop inside a block.
    pub max_serial_extents: i64,

    /// Hard limit on dynamically sized per-thread allocations, in bytes.
    pub local_memory_limit: i64,

    /// Per-thread bytes that are promoted to registers.
    pub register_allocation_limit: i64,

    /// Baseline per-thread stack budget before the configured scale is applied.
    pub stack_baseline: i64,
}

impl Target {
    /// Create a CPU target.
    pub fn cpu() -> Self {
        Self { device: "CPU".to_string(), has_gpu: false, ..Self::cuda() }
    }

    /// Create a CUDA target.
    pub fn cuda() -> Self {
        Self {
            device: "CUDA".to_string(),
            has_gpu: true,
            max_blocks: [2147483647, 65535, 65535],
            max_threads: [1024, 1024, 64],
            max_threads_per_block: 1024,
            warp_size: 32,
            unroll_limit: 16,
            max_serial_extents: 64,
            local_memory_limit: 524288,
            register_allocation_limit: 128,
            stack_baseline: 103232,
        }
    }

    /// Stack budget for statically sized per-thread allocations.
    pub fn stack_memory_limit(&self, stack_factor: f64) -> i64 {
        (stack_factor * self.stack_baseline as f64) as i64
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::cuda()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_limit_default_factor() {
        let t = Target::cuda();
        assert_eq!(t.stack_memory_limit(0.95), 98070);
    }

    #[test]
    fn test_cpu_shares_maxima() {
        let cpu = Target::cpu();
        assert!(!cpu.has_gpu);
        assert_eq!(cpu.max_threads, Target::cuda().max_threads);
    }
}
