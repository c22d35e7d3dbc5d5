//! Candidate schedules as persistent loop-nest trees.
//!
//! A [`LoopNest`] is one loop level: the synthetic root, or a loop of one
//! stage. Nodes are immutable once wrapped in an [`Arc`] and shared between
//! search states; every edit clones the nodes on the path it touches and
//! leaves the rest of the tree shared.
//!
//! # Layout of a computed func
//!
//! `compute_here` inserts, for every stage of the func, a loop over the whole
//! region with a single-vector `Simd` leaf beneath it. `parallelize_in_tiles`
//! later splits such a loop into an outer and an inner loop; on GPU targets the
//! outer loop of a compute-root stage becomes `Parallelized`, then `Block`
//! above a `Thread` loop.

pub mod bounds;
mod edit;
mod queries;
pub mod tiling;
pub mod tree;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_dag::{FunctionDag, NodeId, Stage, StageId};
use parking_lot::RwLock;
use smallvec::SmallVec;

pub use bounds::Bound;
pub use edit::TileOptions;
pub use queries::GpuLoopInfo;
pub use queries::ThreadInfo;

use crate::featurize::FeatureMemo;

// ============================================================================
// IDENTITY
// ============================================================================

static LOOP_NEST_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_loop_nest_id() -> u64 {
    LOOP_NEST_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Boost-style hash mixing.
pub fn hash_combine(seed: &mut u64, value: u64) {
    *seed ^= value.wrapping_add(0x9e3779b9).wrapping_add(*seed << 6).wrapping_add(*seed >> 2);
}

/// How a loop is mapped onto the GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum GpuRole {
    #[default]
    None,
    /// Outer half of a compute-root split, to be split again into blocks and threads.
    Parallelized,
    Block,
    Thread,
    Serial,
    Simd,
}

// ============================================================================
// LOOP NEST
// ============================================================================

#[derive(derive_more::Debug)]
pub struct LoopNest {
    id: u64,

    /// Extent of every loop of the stage at this level.
    pub size: SmallVec<[i64; 4]>,

    /// Loop levels inside this one, outermost first.
    pub children: Vec<Arc<LoopNest>>,

    /// Funcs inlined into this (innermost) loop with their call counts.
    pub inlined: BTreeMap<NodeId, i64>,

    /// Funcs whose storage is allocated at this level.
    pub store_at: BTreeSet<NodeId>,

    #[debug(skip)]
    bounds: RwLock<HashMap<NodeId, Arc<Bound>>>,

    /// Func and stage iterated by this loop; `None` at the root.
    pub node: Option<NodeId>,
    pub stage: Option<StageId>,

    pub innermost: bool,
    pub tileable: bool,
    pub parallel: bool,

    /// Storage dimension of the func that is vectorized.
    pub vector_dim: Option<usize>,
    /// Loop of the stage bound to `vector_dim`, if the stage has one.
    pub vectorized_loop_index: Option<usize>,

    pub gpu_role: GpuRole,

    /// Features of the stages under a root-level loop, keyed by the hash of
    /// the producers stored at root.
    #[debug(skip)]
    features: papaya::HashMap<u64, Arc<FeatureMemo>>,
}

impl LoopNest {
    /// The empty root of a schedule.
    pub fn root() -> Self {
        Self {
            id: next_loop_nest_id(),
            size: SmallVec::new(),
            children: Vec::new(),
            inlined: BTreeMap::new(),
            store_at: BTreeSet::new(),
            bounds: RwLock::new(HashMap::new()),
            node: None,
            stage: None,
            innermost: false,
            tileable: false,
            parallel: false,
            vector_dim: None,
            vectorized_loop_index: None,
            gpu_role: GpuRole::None,
            features: papaya::HashMap::new(),
        }
    }

    /// A loop of `stage` with every other field at its root default.
    pub(crate) fn for_stage(stage: &Stage) -> Self {
        Self { node: Some(stage.node), stage: Some(stage.id), ..Self::root() }
    }

    /// Unique id of this loop level, used as the key of parent maps.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.node.is_none()
    }

    /// Func of a non-root loop.
    pub fn node_id(&self) -> NodeId {
        match self.node {
            Some(n) => n,
            None => panic!("loop nest invariant: the root has no func"),
        }
    }

    /// Stage of a non-root loop.
    pub fn stage_id(&self) -> StageId {
        match self.stage {
            Some(s) => s,
            None => panic!("loop nest invariant: the root has no stage"),
        }
    }

    pub fn is_gpu_block(&self) -> bool {
        self.gpu_role == GpuRole::Block
    }

    pub fn is_gpu_thread(&self) -> bool {
        self.gpu_role == GpuRole::Thread
    }

    pub fn is_gpu_serial(&self) -> bool {
        self.gpu_role == GpuRole::Serial
    }

    /// Record the bound of `f` at this level. Only valid while building.
    pub(crate) fn set_bounds(&mut self, f: NodeId, bound: Bound) {
        self.bounds.get_mut().insert(f, Arc::new(bound));
    }

    pub(crate) fn memoized_features(&self, producers_hash: u64) -> Option<Arc<FeatureMemo>> {
        self.features.pin().get(&producers_hash).cloned()
    }

    pub(crate) fn memoize_features(&self, producers_hash: u64, memo: FeatureMemo) {
        self.features.pin().insert(producers_hash, Arc::new(memo));
    }

    /// Hash of the loop structure down to `depth`, used to deduplicate
    /// search states.
    ///
    /// Depth 0 covers the funcs stored, computed and inlined here; every
    /// further level adds child loop sizes (depth 1 only records whether each
    /// extent exceeds one), and every second level descends one tree level.
    pub fn structural_hash(&self, h: &mut u64, depth: i32) {
        if depth < 0 {
            return;
        }

        for n in &self.store_at {
            hash_combine(h, n.0 as u64);
        }
        hash_combine(h, u64::MAX);

        for c in &self.children {
            hash_combine(h, c.stage_id().0 as u64);
        }
        // Barrier so that moving the last computed func to the first inlined
        // one changes the hash.
        hash_combine(h, u64::MAX);

        for n in self.inlined.keys() {
            hash_combine(h, n.0 as u64);
        }
        hash_combine(h, u64::MAX);

        if depth > 0 {
            for c in &self.children {
                for &s in &c.size {
                    let s = if depth == 1 { (s > 1) as i64 } else { s };
                    hash_combine(h, s as u64);
                }
                hash_combine(h, c.gpu_role as u64);
            }
            hash_combine(h, self.vectorized_loop_index.map_or(u64::MAX, |v| v as u64));
            hash_combine(h, self.vector_dim.map_or(u64::MAX, |v| v as u64));
        }

        if depth > 1 {
            for c in &self.children {
                c.structural_hash(h, depth - 2);
            }
        }
    }

    /// Product of the extents of loop `loop_index` along the chain of
    /// same-stage loops from this one down to the innermost.
    pub fn product_of_self_and_descendants(&self, loop_index: usize) -> i64 {
        self.size[loop_index] * self.product_of_descendants(loop_index)
    }

    pub fn product_of_descendants(&self, loop_index: usize) -> i64 {
        let mut prod = 1;
        let mut cur = self;
        while !cur.innermost {
            let Some(c) = cur.children.iter().find(|c| c.stage == self.stage) else {
                panic!("loop nest invariant: a non-innermost loop of {:?} has no inner loop of its stage", self.stage);
            };
            prod *= c.size[loop_index];
            cur = c;
        }
        prod
    }

    /// Write the tree for debugging.
    pub fn dump(&self, dag: &FunctionDag) -> String {
        tree::render(self, dag)
    }
}

/// A copy gets a fresh id and an empty feature memo; bounds are shared.
impl Clone for LoopNest {
    fn clone(&self) -> Self {
        Self {
            id: next_loop_nest_id(),
            size: self.size.clone(),
            children: self.children.clone(),
            inlined: self.inlined.clone(),
            store_at: self.store_at.clone(),
            bounds: RwLock::new(self.bounds.read().clone()),
            node: self.node,
            stage: self.stage,
            innermost: self.innermost,
            tileable: self.tileable,
            parallel: self.parallel,
            vector_dim: self.vector_dim,
            vectorized_loop_index: self.vectorized_loop_index,
            gpu_role: self.gpu_role,
            features: papaya::HashMap::new(),
        }
    }
}

impl Default for LoopNest {
    fn default() -> Self {
        Self::root()
    }
}
