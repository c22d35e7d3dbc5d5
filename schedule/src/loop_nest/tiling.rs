//! Candidate tile-size generators.
//!
//! All generators return tilings indexed by pure dimension. Serial tilings
//! hold outer extents; GPU tilings hold thread extents.

/// Thread count ceiling used while enumerating tilings; below the hardware
/// maximum to keep the branching factor down.
const TILING_THREAD_LIMIT: i64 = 1024;
const MAX_THREADS_EXTENT: i64 = 64;
const MAX_NON_VECTOR_THREADS: i64 = 16;
const MAX_SERIAL_EXTENT: i64 = 16;

fn all_ones(nums: &[i64]) -> bool {
    nums.iter().all(|n| *n == 1)
}

fn equal_to_existing_size(s: &[i64], nums: &[i64]) -> bool {
    s.iter().zip(nums).all(|(a, b)| a == b)
}

/// Outer extents for splitting a compute-root loop into parallel and serial
/// loops. `vec_dim_serial_sizes` adds odd inner sizes for the vectorized
/// dimension that leave thread tiles a multiple of a warp.
pub fn generate_serial_tilings(
    s: &[i64],
    d: isize,
    last_d: isize,
    vectorized_index: Option<usize>,
    vec_dim_serial_sizes: &[i64],
    filter_small_outer_extents: bool,
    allow_inner_ones: bool,
) -> Vec<Vec<i64>> {
    if d < 0 {
        return vec![Vec::new()];
    }
    let du = d as usize;
    let mut result = Vec::new();
    let prefixes = generate_serial_tilings(
        s,
        d - 1,
        last_d,
        vectorized_index,
        vec_dim_serial_sizes,
        filter_small_outer_extents,
        allow_inner_ones,
    );
    for mut t in prefixes {
        t.push(0);
        let mut used_full_extent = false;
        if !vec_dim_serial_sizes.is_empty() && vectorized_index == Some(du) {
            for &inner in vec_dim_serial_sizes {
                let outer = (s[du] + inner - 1) / inner;
                if filter_small_outer_extents && outer < 16 {
                    continue;
                }
                t[du] = outer;
                if d == last_d && (equal_to_existing_size(s, &t) || all_ones(&t)) {
                    continue;
                }
                used_full_extent = inner == s[du];
                result.push(t.clone());
            }
        }

        let odd = matches!(s[du], 3 | 5 | 7);
        let max = if odd { s[du] } else { 8 };
        let factor = if odd { s[du] } else { 2 };

        let mut inner = 1;
        while inner <= max {
            if inner > s[du] {
                break;
            }
            if !(inner == s[du] && used_full_extent) {
                let outer = (s[du] + inner - 1) / inner;
                let too_small = vectorized_index == Some(du) && filter_small_outer_extents && outer < 16;
                if !too_small {
                    t[du] = outer;
                    let trivial = (!allow_inner_ones && equal_to_existing_size(s, &t)) || all_ones(&t);
                    if !(d == last_d && trivial) {
                        result.push(t.clone());
                    }
                }
            }
            inner *= factor;
        }
    }
    result
}

/// Move the vectorized loop first and drop unit loops, as loops are lowered
/// onto GPU thread dimensions.
pub fn lowered_dims(size: &[i64], vector_loop_index: Option<usize>) -> Vec<i64> {
    let mut lowered = Vec::with_capacity(size.len());
    if let Some(v) = vector_loop_index
        && size.get(v).is_some_and(|s| *s > 1)
    {
        lowered.push(size[v]);
    }
    lowered.extend(size.iter().enumerate().filter(|(i, s)| Some(*i) != vector_loop_index && **s > 1).map(|(_, s)| *s));
    lowered
}

/// At most three non-unit thread dimensions and at most `max_threads_per_block`
/// threads.
pub fn are_valid_thread_extents(counts: &[i64], max_threads_per_block: i64) -> bool {
    let mut num_thread_loops = 0;
    let mut num_threads = 1;
    for &c in counts.iter().filter(|c| **c != 1) {
        if num_thread_loops >= 3 || num_threads * c > max_threads_per_block {
            return false;
        }
        num_threads *= c;
        num_thread_loops += 1;
    }
    true
}

/// Sizes of one func's stages inside a loop nest, as consumed by
/// [`generate_gpu_tilings`].
#[derive(Debug, Clone, Default)]
pub struct StageSizes {
    pub sizes: Vec<Vec<i64>>,
    /// Pure dimension of every loop, `None` for reduction loops.
    pub pure_dims: Vec<Vec<Option<usize>>>,
    pub vectorized_indices: Vec<Option<usize>>,
}

#[derive(Debug, PartialEq, Eq)]
enum Validity {
    SerialCount,
    ThreadCount,
    Valid,
}

/// Thread extents for splitting a parallel loop into (block, thread) loops, or
/// a thread loop into (thread, serial) loops when `serial_inner` is set.
///
/// `max_s` holds the largest sibling thread extents per lowered dimension so
/// the union of thread counts inside one block stays legal.
pub fn generate_gpu_tilings(
    stages: &StageSizes,
    max_s: &[i64],
    d: isize,
    serial_inner: bool,
    is_compute_root_stage: bool,
) -> Vec<Vec<i64>> {
    if d < 0 {
        return vec![Vec::new()];
    }
    let du = d as usize;
    let pure_size = &stages.sizes[0];
    let vectorized = stages.vectorized_indices[0];
    let innermost_warp_extent = if is_compute_root_stage && stages.pure_dims[0].len() == 1 { 1 } else { 16 };

    let mut result = Vec::new();
    for mut t in generate_gpu_tilings(stages, max_s, d - 1, serial_inner, is_compute_root_stage) {
        t.push(0);

        let is_valid_tiling = |t: &[i64]| -> Validity {
            if du + 1 != pure_size.len() {
                return Validity::Valid;
            }
            let lowered = lowered_dims(t, vectorized);
            let mut new_max_s = max_s.to_vec();
            for (stage, dims) in stages.pure_dims.iter().enumerate() {
                let stage_t: Vec<i64> = dims.iter().map(|l| l.map_or(1, |i| t[i])).collect();
                let stage_lowered = lowered_dims(&stage_t, stages.vectorized_indices[stage]);
                for (dim, ext) in stage_lowered.into_iter().enumerate() {
                    match new_max_s.get_mut(dim) {
                        Some(m) => *m = (*m).max(ext),
                        None => new_max_s.push(ext),
                    }
                }
            }
            let mut total_threads = 1;
            let mut not_ext1 = 0;
            for dim in 0..new_max_s.len().max(lowered.len()) {
                let union = match (new_max_s.get(dim), lowered.get(dim)) {
                    (Some(m), Some(l)) => (*m).max(*l),
                    (Some(m), None) => *m,
                    (None, Some(l)) => *l,
                    (None, None) => 1,
                };
                if union > 1 {
                    not_ext1 += 1;
                }
                total_threads *= union;
            }
            if total_threads > TILING_THREAD_LIMIT || not_ext1 > 3 {
                return Validity::ThreadCount;
            }
            if serial_inner && pure_size.iter().zip(t).any(|(s, t)| (s + t - 1) / t > MAX_SERIAL_EXTENT) {
                return Validity::SerialCount;
            }
            Validity::Valid
        };

        let extent = pure_size[du];
        let min_threads = if vectorized == Some(du) { innermost_warp_extent } else { 1 };
        let mut full_extent_considered = false;
        let mut threads_ext = min_threads;
        while threads_ext <= MAX_THREADS_EXTENT {
            full_extent_considered |= threads_ext == extent;
            if threads_ext > extent {
                break;
            }
            if vectorized != Some(du) && threads_ext > MAX_NON_VECTOR_THREADS {
                break;
            }
            let other_ext = (extent + threads_ext - 1) / threads_ext;
            if vectorized != Some(du) && threads_ext > 1 && threads_ext * other_ext * 7 > extent * 8 {
                break;
            }
            t[du] = threads_ext;
            match is_valid_tiling(&t) {
                Validity::SerialCount => {
                    threads_ext *= 2;
                    continue;
                }
                Validity::ThreadCount => break,
                Validity::Valid => result.push(t.clone()),
            }
            if threads_ext >= extent {
                break;
            }
            threads_ext *= 2;
        }

        if !full_extent_considered && extent < MAX_THREADS_EXTENT {
            t[du] = extent;
            if is_valid_tiling(&t) == Validity::Valid {
                result.push(t);
            }
        }
    }
    result
}
