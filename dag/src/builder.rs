//! Incremental construction of a [`FunctionDag`].
//!
//! Funcs and edges are declared by name in any order; [`DagBuilder::build`]
//! validates the declarations, orders the nodes consumers-first and derives
//! the transitive producer sets.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

use bon::bon;
use snafu::OptionExt;
use snafu::ensure;

use crate::error::*;
use crate::features::PipelineFeatures;
use crate::graph::*;
use crate::span::Span;

// ============================================================================
// DECLARATIONS
// ============================================================================

/// Declaration of one func (input or computed).
#[derive(Debug, Clone)]
pub struct FuncDecl {
    pub name: String,
    pub args: Vec<String>,
    pub bytes_per_point: i64,
    pub vector_size: i64,
    pub is_output: bool,
    pub is_wrapper: bool,
    pub is_boundary_condition: bool,
    pub trivial_to_inline: bool,
    pub estimate: Vec<Span>,
    pub features: Option<Vec<f64>>,
}

#[bon]
impl FuncDecl {
    /// Declare a func with builder pattern.
    ///
    /// `vector_size` defaults to a 16-byte native vector for the element size.
    #[builder]
    pub fn builder(
        #[builder(into)] name: String,
        args: Vec<String>,
        #[builder(default = 4)] bytes_per_point: i64,
        vector_size: Option<i64>,
        #[builder(default = false)] is_output: bool,
        #[builder(default = false)] is_wrapper: bool,
        #[builder(default = false)] is_boundary_condition: bool,
        #[builder(default = false)] trivial_to_inline: bool,
        #[builder(default)] estimate: Vec<Span>,
        features: Option<Vec<f64>>,
    ) -> Self {
        let vector_size = vector_size.unwrap_or_else(|| (16 / bytes_per_point.max(1)).max(1));
        Self {
            name,
            args,
            bytes_per_point,
            vector_size,
            is_output,
            is_wrapper,
            is_boundary_condition,
            trivial_to_inline,
            estimate,
            features,
        }
    }
}

#[derive(Debug)]
struct PendingFunc {
    decl: FuncDecl,
    is_input: bool,
    /// Loops of each stage; stage 0 is the pure definition.
    stages: Vec<Vec<LoopVar>>,
}

#[derive(Debug)]
struct PendingEdge {
    producer: String,
    consumer: String,
    stage: usize,
    footprint: Vec<DimFootprint>,
    calls: i64,
}

// ============================================================================
// BUILDER
// ============================================================================

#[derive(Debug, Default)]
pub struct DagBuilder {
    funcs: Vec<PendingFunc>,
    edges: Vec<PendingEdge>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a pipeline input buffer.
    pub fn input(&mut self, name: &str, args: &[&str], bytes_per_point: i64) -> &mut Self {
        let decl = FuncDecl::builder()
            .name(name)
            .args(args.iter().map(|a| a.to_string()).collect())
            .bytes_per_point(bytes_per_point)
            .build();
        self.push(decl, true)
    }

    /// Declare a computed func. Its pure stage iterates its args in order.
    pub fn func(&mut self, decl: FuncDecl) -> &mut Self {
        self.push(decl, false)
    }

    /// Append an update stage to a declared func.
    pub fn update(&mut self, func: &str, loops: Vec<LoopVar>) -> Result<&mut Self> {
        let pending = self.funcs.iter_mut().find(|f| f.decl.name == func).context(UnknownFuncSnafu { name: func })?;
        ensure!(!pending.is_input, InputWithUpdateSnafu { name: func });
        pending.stages.push(loops);
        Ok(self)
    }

    /// Declare that stage `stage` of `consumer` reads `producer` through `footprint`.
    pub fn edge(
        &mut self,
        producer: &str,
        consumer: &str,
        stage: usize,
        footprint: Vec<DimFootprint>,
        calls: i64,
    ) -> &mut Self {
        self.edges.push(PendingEdge {
            producer: producer.to_string(),
            consumer: consumer.to_string(),
            stage,
            footprint,
            calls,
        });
        self
    }

    /// Elementwise read: producer dimension `d` is read at consumer loop `d`.
    pub fn pointwise(&mut self, producer: &str, consumer: &str) -> &mut Self {
        let dims = self.dimensions_of(producer);
        self.edge(producer, consumer, 0, (0..dims).map(DimFootprint::identity).collect(), 1)
    }

    /// Square stencil of `radius` around each consumer point, `calls` taps.
    pub fn stencil(&mut self, producer: &str, consumer: &str, radius: i64, calls: i64) -> &mut Self {
        let dims = self.dimensions_of(producer);
        self.edge(producer, consumer, 0, (0..dims).map(|d| DimFootprint::stencil(d, -radius, radius)).collect(), calls)
    }

    fn push(&mut self, decl: FuncDecl, is_input: bool) -> &mut Self {
        let pure = decl.args.iter().enumerate().map(|(i, a)| LoopVar::pure(a.clone(), i)).collect();
        self.funcs.push(PendingFunc { decl, is_input, stages: vec![pure] });
        self
    }

    fn dimensions_of(&self, name: &str) -> usize {
        self.funcs.iter().find(|f| f.decl.name == name).map(|f| f.decl.args.len()).unwrap_or(0)
    }

    /// Validate declarations and produce the ordered graph.
    #[tracing::instrument(skip_all, fields(funcs = self.funcs.len(), edges = self.edges.len()))]
    pub fn build(self) -> Result<FunctionDag> {
        let mut by_name: HashMap<&str, usize> = HashMap::new();
        for (i, f) in self.funcs.iter().enumerate() {
            ensure!(by_name.insert(f.decl.name.as_str(), i).is_none(), DuplicateFuncSnafu { name: &f.decl.name });
        }
        ensure!(self.funcs.iter().any(|f| f.decl.is_output), NoOutputsSnafu);

        for f in &self.funcs {
            let dims = f.decl.args.len();
            if f.decl.is_output {
                ensure!(f.decl.estimate.len() == dims, MissingEstimateSnafu { name: &f.decl.name, dimensions: dims });
            }
            for lv in f.stages.iter().flatten() {
                if let Some(dim) = lv.pure_dim() {
                    ensure!(dim < dims, PureDimOutOfRangeSnafu { func: &f.decl.name, dim, dimensions: dims });
                }
            }
        }

        // Resolve edges against declaration indices.
        let mut resolved = Vec::with_capacity(self.edges.len());
        for e in &self.edges {
            let p = *by_name.get(e.producer.as_str()).context(UnknownFuncSnafu { name: &e.producer })?;
            let c = *by_name.get(e.consumer.as_str()).context(UnknownFuncSnafu { name: &e.consumer })?;
            ensure!(p != c, SelfReferenceSnafu { name: &e.producer });
            let consumer = &self.funcs[c];
            let loops = consumer
                .stages
                .get(e.stage)
                .context(UnknownStageSnafu { func: &e.consumer, stage: e.stage })?;
            let expected = self.funcs[p].decl.args.len();
            ensure!(
                e.footprint.len() == expected,
                FootprintRankSnafu {
                    producer: &e.producer,
                    consumer: &e.consumer,
                    expected,
                    found: e.footprint.len()
                }
            );
            for fp in &e.footprint {
                if let DimFootprint::Affine { loop_index, .. } = *fp {
                    ensure!(
                        loop_index < loops.len(),
                        FootprintLoopSnafu {
                            producer: &e.producer,
                            consumer: &e.consumer,
                            loop_index,
                            num_loops: loops.len()
                        }
                    );
                }
            }
            resolved.push((p, c, e));
        }

        let order = consumers_first_order(&self.funcs, &resolved)?;
        tracing::debug!(order = ?order.iter().map(|i| &self.funcs[*i].decl.name).collect::<Vec<_>>(), "dag ordered");

        // Declaration index -> NodeId.
        let mut node_of = vec![NodeId(0); self.funcs.len()];
        for (pos, decl_idx) in order.iter().enumerate() {
            node_of[*decl_idx] = NodeId(pos);
        }

        let mut nodes = Vec::with_capacity(order.len());
        let mut stages = Vec::new();
        for (pos, decl_idx) in order.iter().enumerate() {
            let f = &self.funcs[*decl_idx];
            let mut stage_ids = Vec::with_capacity(f.stages.len());
            for (index, loops) in f.stages.iter().enumerate() {
                let id = StageId(stages.len());
                let name = if index == 0 { f.decl.name.clone() } else { format!("{}.update({})", f.decl.name, index - 1) };
                stages.push(Stage {
                    id,
                    node: NodeId(pos),
                    index,
                    name,
                    loops: loops.clone(),
                    vector_size: f.decl.vector_size,
                    incoming_edges: Vec::new(),
                    features: PipelineFeatures::default(),
                    upstream: BTreeSet::new(),
                });
                stage_ids.push(id);
            }
            nodes.push(Node {
                id: NodeId(pos),
                name: f.decl.name.clone(),
                args: f.decl.args.clone(),
                bytes_per_point: f.decl.bytes_per_point,
                is_input: f.is_input,
                is_output: f.decl.is_output,
                is_wrapper: f.decl.is_wrapper,
                is_pointwise: false,
                is_boundary_condition: f.decl.is_boundary_condition,
                trivial_to_inline: f.decl.trivial_to_inline,
                stages: stage_ids,
                outgoing_edges: Vec::new(),
                estimated_region: f.decl.estimate.clone(),
            });
        }

        let mut edges = Vec::with_capacity(resolved.len());
        for (p, c, e) in resolved {
            let id = EdgeId(edges.len());
            let producer = node_of[p];
            let consumer = nodes[node_of[c].0].stages[e.stage];
            edges.push(Edge { id, producer, consumer, footprint: e.footprint.clone(), calls: e.calls });
            nodes[producer.0].outgoing_edges.push(id);
            stages[consumer.0].incoming_edges.push(id);
        }

        // Producers sit after their consumers, so walking backwards sees every
        // producer's upstream set before it is needed.
        for s in (0..stages.len()).rev() {
            let mut upstream = BTreeSet::new();
            for e in &stages[s].incoming_edges {
                let producer = edges[e.0].producer;
                upstream.insert(producer);
                for ps in &nodes[producer.0].stages {
                    upstream.extend(stages[ps.0].upstream.iter().copied());
                }
            }
            stages[s].upstream = upstream;
        }

        for n in nodes.iter_mut() {
            n.is_pointwise = !n.is_input
                && n.stages.len() == 1
                && stages[n.stages[0].0].incoming_edges.iter().all(|e| {
                    let edge = &edges[e.0];
                    edge.footprint.iter().enumerate().all(|(d, fp)| *fp == DimFootprint::identity(d))
                });
        }

        for (pos, decl_idx) in order.iter().enumerate() {
            let f = &self.funcs[*decl_idx];
            for sid in &nodes[pos].stages {
                let stage = &stages[sid.0];
                let features = match &f.decl.features {
                    Some(values) => PipelineFeatures::new(values.clone()),
                    None => PipelineFeatures::derived(
                        stage.loops.len(),
                        stage.loops.iter().filter(|l| l.is_rvar()).count(),
                        stage.incoming_edges.len(),
                        stage.incoming_edges.iter().map(|e| edges[e.0].calls).sum(),
                        f.decl.bytes_per_point,
                        f.decl.vector_size,
                    ),
                };
                stages[sid.0].features = features;
            }
        }

        Ok(FunctionDag { nodes, stages, edges })
    }
}

/// Kahn's algorithm over the consumer relation: a func is emitted once every
/// func reading it has been emitted.
fn consumers_first_order(funcs: &[PendingFunc], edges: &[(usize, usize, &PendingEdge)]) -> Result<Vec<usize>> {
    let n = funcs.len();
    let mut consumers: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut producers: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (p, c, _) in edges {
        consumers[*p].insert(*c);
        producers[*c].insert(*p);
    }
    for (i, f) in funcs.iter().enumerate() {
        ensure!(f.decl.is_output || !consumers[i].is_empty(), DeadFuncSnafu { name: &f.decl.name });
    }

    let mut pending: Vec<usize> = consumers.iter().map(|c| c.len()).collect();
    let mut ready: VecDeque<usize> = (0..n).filter(|i| pending[*i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = ready.pop_front() {
        order.push(i);
        for p in &producers[i] {
            pending[*p] -= 1;
            if pending[*p] == 0 {
                ready.push_back(*p);
            }
        }
    }

    if order.len() != n {
        let stuck = (0..n).find(|i| pending[*i] > 0).map(|i| funcs[i].decl.name.clone()).unwrap_or_default();
        return CycleSnafu { name: stuck }.fail();
    }

    // Inputs go last, keeping their relative order.
    let (mut computed, inputs): (Vec<usize>, Vec<usize>) = order.into_iter().partition(|i| !funcs[*i].is_input);
    computed.extend(inputs);
    Ok(computed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blur_dag() -> FunctionDag {
        let mut b = DagBuilder::new();
        b.input("input", &["x", "y"], 4);
        b.func(FuncDecl::builder().name("blur_x").args(vec!["x".into(), "y".into()]).build());
        b.func(
            FuncDecl::builder()
                .name("blur_y")
                .args(vec!["x".into(), "y".into()])
                .is_output(true)
                .estimate(vec![Span::with_extent(256), Span::with_extent(256)])
                .build(),
        );
        b.edge("input", "blur_x", 0, vec![DimFootprint::stencil(0, -1, 1), DimFootprint::identity(1)], 3);
        b.edge("blur_x", "blur_y", 0, vec![DimFootprint::identity(0), DimFootprint::stencil(1, -1, 1)], 3);
        b.build().unwrap()
    }

    #[test]
    fn test_nodes_are_consumers_first() {
        let dag = blur_dag();
        let names: Vec<_> = dag.nodes().iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, ["blur_y", "blur_x", "input"]);
        assert!(dag.node(NodeId(2)).is_input);
    }

    #[test]
    fn test_downstream_is_transitive() {
        let dag = blur_dag();
        let out = dag.node(NodeId(0)).stages[0];
        assert!(dag.stage_is_downstream_of(out, NodeId(1)));
        assert!(dag.stage_is_downstream_of(out, NodeId(2)));
        assert!(!dag.stage_is_downstream_of(dag.node(NodeId(1)).stages[0], NodeId(0)));
    }

    #[test]
    fn test_default_features_are_derived() {
        let dag = blur_dag();
        let f = &dag.stage(StageId(1)).features;
        assert_eq!(f.len(), PipelineFeatures::DERIVED_LEN);
        assert_eq!(f.as_slice()[3], 3.0);
    }

    #[test]
    fn test_stencil_is_not_pointwise() {
        let dag = blur_dag();
        assert!(!dag.node(NodeId(1)).is_pointwise);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut b = DagBuilder::new();
        let args = vec!["x".to_string()];
        b.func(FuncDecl::builder().name("a").args(args.clone()).is_output(true).estimate(vec![Span::with_extent(8)]).build());
        b.func(FuncDecl::builder().name("b").args(args.clone()).build());
        b.func(FuncDecl::builder().name("c").args(args).build());
        b.pointwise("b", "a").pointwise("c", "b").pointwise("b", "c");
        assert!(matches!(b.build(), Err(DagError::Cycle { .. })));
    }

    #[test]
    fn test_footprint_loop_out_of_range() {
        let mut b = DagBuilder::new();
        b.input("in", &["x"], 1);
        b.func(
            FuncDecl::builder()
                .name("out")
                .args(vec!["x".into()])
                .is_output(true)
                .estimate(vec![Span::with_extent(8)])
                .build(),
        );
        b.edge("in", "out", 0, vec![DimFootprint::identity(3)], 1);
        assert!(matches!(b.build(), Err(DagError::FootprintLoop { loop_index: 3, .. })));
    }

    #[test]
    fn test_output_needs_estimate() {
        let mut b = DagBuilder::new();
        b.func(FuncDecl::builder().name("out").args(vec!["x".into()]).is_output(true).build());
        assert!(matches!(b.build(), Err(DagError::MissingEstimate { .. })));
    }

    #[test]
    fn test_update_stage_naming() {
        let mut b = DagBuilder::new();
        b.input("in", &["x"], 4);
        b.func(
            FuncDecl::builder()
                .name("hist")
                .args(vec!["x".into()])
                .is_output(true)
                .estimate(vec![Span::with_extent(256)])
                .build(),
        );
        b.update("hist", vec![LoopVar::reduction("r", 0, 1024)]).unwrap();
        b.edge("in", "hist", 1, vec![DimFootprint::identity(0)], 1);
        let dag = b.build().unwrap();
        let hist = dag.find_node("hist").unwrap();
        assert_eq!(dag.stage(hist.stages[1]).name, "hist.update(0)");
        assert!(!hist.is_pointwise);
    }
}
