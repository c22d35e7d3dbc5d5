//! Function DAG: funcs, their definition stages, and producer/consumer edges.
//!
//! Nodes are stored consumers-first: outputs come before the funcs they read,
//! inputs come last. [`NodeId`], [`StageId`] and [`EdgeId`] are dense indices
//! into the owning [`FunctionDag`].

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::features::PipelineFeatures;
use crate::span::Span;

// ============================================================================
// IDENTIFIERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("n{_0}")]
pub struct NodeId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("s{_0}")]
pub struct StageId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("e{_0}")]
pub struct EdgeId(pub usize);

/// Per-stage associative storage. Ordered by stage id, so iteration visits
/// consumers before their producers.
pub type StageMap<T> = BTreeMap<StageId, T>;

/// Per-node associative storage.
pub type NodeMap<T> = BTreeMap<NodeId, T>;

// ============================================================================
// LOOPS AND STAGES
// ============================================================================

/// What a stage loop iterates over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopKind {
    /// Pure variable bound to storage dimension `dim` of the func.
    Pure { dim: usize },
    /// Reduction variable over a static domain.
    Reduction { domain: Span },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopVar {
    pub name: String,
    pub kind: LoopKind,
}

impl LoopVar {
    pub fn pure(name: impl Into<String>, dim: usize) -> Self {
        Self { name: name.into(), kind: LoopKind::Pure { dim } }
    }

    pub fn reduction(name: impl Into<String>, min: i64, extent: i64) -> Self {
        Self { name: name.into(), kind: LoopKind::Reduction { domain: Span::new(min, min + extent - 1, true) } }
    }

    pub fn is_pure(&self) -> bool {
        matches!(self.kind, LoopKind::Pure { .. })
    }

    pub fn is_rvar(&self) -> bool {
        matches!(self.kind, LoopKind::Reduction { .. })
    }

    pub fn pure_dim(&self) -> Option<usize> {
        match self.kind {
            LoopKind::Pure { dim } => Some(dim),
            LoopKind::Reduction { .. } => None,
        }
    }
}

/// One definition of a func: the pure definition (index 0) or an update.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub node: NodeId,
    pub index: usize,
    /// `f` for the pure stage, `f.update(k)` for update `k`.
    pub name: String,
    /// Loops from innermost to outermost.
    pub loops: Vec<LoopVar>,
    /// Native vector width for the stage's element type.
    pub vector_size: i64,
    pub incoming_edges: Vec<EdgeId>,
    pub features: PipelineFeatures,
    /// Every node this stage transitively reads.
    pub(crate) upstream: BTreeSet<NodeId>,
}

impl Stage {
    /// True when this stage (transitively) consumes `node`.
    pub fn downstream_of(&self, node: NodeId) -> bool {
        self.upstream.contains(&node)
    }
}

// ============================================================================
// NODES AND EDGES
// ============================================================================

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    /// Storage dimension names, innermost first.
    pub args: Vec<String>,
    pub bytes_per_point: i64,
    pub is_input: bool,
    pub is_output: bool,
    /// A func that only copies another func (e.g. a staging wrapper).
    pub is_wrapper: bool,
    pub is_pointwise: bool,
    pub is_boundary_condition: bool,
    /// Cheap enough that inlining it never counts as recomputation.
    pub trivial_to_inline: bool,
    pub stages: Vec<StageId>,
    pub outgoing_edges: Vec<EdgeId>,
    /// Bounds estimate; required for outputs.
    pub estimated_region: Vec<Span>,
}

impl Node {
    pub fn dimensions(&self) -> usize {
        self.args.len()
    }
}

/// How one storage dimension of a producer is read by a consumer stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimFootprint {
    /// `[loop.min * scale + min_offset, loop.max * scale + max_offset]`.
    Affine { loop_index: usize, scale: i64, min_offset: i64, max_offset: i64 },
    /// A fixed region independent of the consumer's loops.
    Constant(Span),
}

impl DimFootprint {
    pub const fn identity(loop_index: usize) -> Self {
        Self::Affine { loop_index, scale: 1, min_offset: 0, max_offset: 0 }
    }

    pub const fn stencil(loop_index: usize, min_offset: i64, max_offset: i64) -> Self {
        Self::Affine { loop_index, scale: 1, min_offset, max_offset }
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub id: EdgeId,
    pub producer: NodeId,
    pub consumer: StageId,
    /// One entry per producer storage dimension.
    pub footprint: Vec<DimFootprint>,
    /// Number of call sites of the producer in the consumer definition.
    pub calls: i64,
}

impl Edge {
    /// Map the consumer's loop intervals to the producer region they read.
    pub fn expand_footprint(&self, consumer_loops: &[Span]) -> SmallVec<[Span; 4]> {
        self.footprint
            .iter()
            .map(|fp| match *fp {
                DimFootprint::Affine { loop_index, scale, min_offset, max_offset } => {
                    let l = consumer_loops[loop_index];
                    let (lo, hi) = if scale >= 0 { (l.min(), l.max()) } else { (l.max(), l.min()) };
                    Span::new(lo * scale + min_offset, hi * scale + max_offset, l.constant_extent())
                }
                DimFootprint::Constant(span) => span,
            })
            .collect()
    }
}

// ============================================================================
// FUNCTION DAG
// ============================================================================

#[derive(Debug, Clone)]
pub struct FunctionDag {
    pub(crate) nodes: Vec<Node>,
    pub(crate) stages: Vec<Stage>,
    pub(crate) edges: Vec<Edge>,
}

impl FunctionDag {
    /// Nodes in consumers-first order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.0]
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id.0]
    }

    /// Stage `index` of `node`.
    pub fn stage_of(&self, node: NodeId, index: usize) -> &Stage {
        self.stage(self.node(node).stages[index])
    }

    /// The node owning `stage`.
    pub fn node_of(&self, stage: StageId) -> &Node {
        self.node(self.stage(stage).node)
    }

    pub fn find_node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn outgoing(&self, node: NodeId) -> impl Iterator<Item = &Edge> {
        self.node(node).outgoing_edges.iter().map(|e| self.edge(*e))
    }

    pub fn incoming(&self, stage: StageId) -> impl Iterator<Item = &Edge> {
        self.stage(stage).incoming_edges.iter().map(|e| self.edge(*e))
    }

    /// True when stage `stage` transitively reads `node`.
    pub fn stage_is_downstream_of(&self, stage: StageId, node: NodeId) -> bool {
        self.stage(stage).downstream_of(node)
    }

    /// Position of the node in the pipeline's realization order, as used by
    /// `pipeline.get_func(i)`.
    pub fn realization_index(&self, node: NodeId) -> usize {
        self.nodes.len() - 1 - node.0
    }

    /// Loops of `stage` for a given computed region of its node.
    pub fn loops_for_region(&self, stage: StageId, region_computed: &[Span]) -> SmallVec<[Span; 4]> {
        self.stage(stage)
            .loops
            .iter()
            .map(|l| match l.kind {
                LoopKind::Pure { dim } => region_computed[dim],
                LoopKind::Reduction { domain } => domain,
            })
            .collect()
    }
}
