//! Regions of a func required and computed at one loop level.

use std::sync::Arc;

use arbor_dag::{FunctionDag, NodeId, Span};
use smallvec::SmallVec;

use super::LoopNest;

/// Bounds of one func at one loop level.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound {
    /// Region of the func read by its consumers inside the loop.
    pub region_required: SmallVec<[Span; 4]>,
    /// Region actually produced; equal to the required region for every func
    /// this core schedules.
    pub region_computed: SmallVec<[Span; 4]>,
    /// Loop intervals of every stage needed to produce `region_computed`,
    /// indexed by stage index then loop.
    pub loops: Vec<SmallVec<[Span; 4]>>,
}

impl Bound {
    /// Bound derived from a required region of `f`.
    pub fn from_required(dag: &FunctionDag, f: NodeId, region_required: SmallVec<[Span; 4]>) -> Self {
        let region_computed = region_required.clone();
        let loops = dag.node(f).stages.iter().map(|s| dag.loops_for_region(*s, &region_computed)).collect();
        Self { region_required, region_computed, loops }
    }

    /// Points in the computed region.
    pub fn points_computed(&self) -> i64 {
        self.region_computed.iter().map(Span::extent).product()
    }

    /// Whether every dimension of the computed region has a static extent.
    pub fn constant_region_computed(&self) -> bool {
        self.region_computed.iter().all(Span::constant_extent)
    }
}

impl LoopNest {
    /// Bounds of `f` within one iteration of this loop.
    ///
    /// Outputs at the root use their estimated region. Anything else unions
    /// the footprints of the consumers that run inside this loop. Results are
    /// memoized per loop level; the lock is never held across the recursion
    /// into consumer bounds.
    pub fn get_bounds(&self, f: NodeId, dag: &FunctionDag) -> Arc<Bound> {
        if let Some(b) = self.bounds.read().get(&f) {
            return b.clone();
        }

        let node = dag.node(f);
        let region_required: SmallVec<[Span; 4]> = if node.is_output && self.is_root() {
            node.estimated_region.iter().copied().collect()
        } else {
            assert!(
                !node.outgoing_edges.is_empty(),
                "bounds invariant: {} has no consumers at loop over {}",
                node.name,
                self.node.map_or("root".to_string(), |n| dag.node(n).name.clone())
            );
            let mut region: SmallVec<[Span; 4]> = SmallVec::from_elem(Span::empty(), node.dimensions());
            for e in dag.outgoing(f) {
                // Consumers outside this loop do not constrain the region.
                if let Some(stage) = self.stage
                    && stage != e.consumer
                    && !dag.stage(stage).downstream_of(dag.stage(e.consumer).node)
                {
                    continue;
                }
                let consumer = dag.stage(e.consumer);
                let c_bounds = self.get_bounds(consumer.node, dag);
                for (r, fp) in region.iter_mut().zip(e.expand_footprint(&c_bounds.loops[consumer.index])) {
                    r.union(&fp);
                }
            }
            region
        };

        let bound = Arc::new(Bound::from_required(dag, f, region_required));
        self.bounds.write().entry(f).or_insert(bound).clone()
    }

    /// Computed region of `f` at this level.
    pub fn region_computed(&self, f: NodeId, dag: &FunctionDag) -> SmallVec<[Span; 4]> {
        self.get_bounds(f, dag).region_computed.clone()
    }
}

#[cfg(test)]
mod tests {
    use arbor_dag::{DagBuilder, DimFootprint, FuncDecl};

    use super::*;

    fn chain() -> FunctionDag {
        let mut b = DagBuilder::new();
        b.input("in", &["x"], 4);
        b.func(FuncDecl::builder().name("f").args(vec!["x".into()]).build());
        b.func(
            FuncDecl::builder()
                .name("out")
                .args(vec!["x".into()])
                .is_output(true)
                .estimate(vec![Span::with_extent(100)])
                .build(),
        );
        b.edge("in", "f", 0, vec![DimFootprint::identity(0)], 1);
        b.edge("f", "out", 0, vec![DimFootprint::stencil(0, -2, 2)], 5);
        b.build().unwrap()
    }

    #[test]
    fn test_output_uses_estimate_at_root() {
        let dag = chain();
        let root = LoopNest::root();
        let out = dag.find_node("out").unwrap().id;
        let b = root.get_bounds(out, &dag);
        assert_eq!(b.region_required.as_slice(), &[Span::with_extent(100)]);
        assert_eq!(b.loops[0].as_slice(), &[Span::with_extent(100)]);
    }

    #[test]
    fn test_producer_bounds_union_footprints() {
        let dag = chain();
        let root = LoopNest::root();
        let f = dag.find_node("f").unwrap().id;
        let input = dag.find_node("in").unwrap().id;
        assert_eq!(root.get_bounds(f, &dag).region_computed.as_slice(), &[Span::new(-2, 101, true)]);
        assert_eq!(root.get_bounds(input, &dag).region_computed[0].extent(), 104);
    }

    #[test]
    fn test_bounds_are_memoized() {
        let dag = chain();
        let root = LoopNest::root();
        let f = dag.find_node("f").unwrap().id;
        let a = root.get_bounds(f, &dag);
        let b = root.get_bounds(f, &dag);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
