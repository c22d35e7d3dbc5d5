//! Where every stage is computed, stored and produced in a loop nest.

use std::collections::BTreeMap;
use std::collections::HashMap;

use arbor_dag::{DimFootprint, NodeId, StageId, StageMap};

use crate::context::Context;
use crate::loop_nest::{GpuRole, LoopNest, hash_combine};

/// GPU memory a func's storage lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum MemoryType {
    #[default]
    Global,
    Shared,
    Local,
    Registers,
    Inlined,
}

/// Loop levels associated with one stage.
#[derive(Debug, Clone, Default)]
pub struct Sites<'a> {
    /// Loop the func is computed at.
    pub compute: Option<&'a LoopNest>,
    /// Loop the func's storage is allocated at.
    pub store: Option<&'a LoopNest>,
    /// Outermost loop of the stage itself.
    pub produce: Option<&'a LoopNest>,
    /// Innermost loop of the stage.
    pub innermost: Option<&'a LoopNest>,
    /// Root-level loop the stage runs in.
    pub task: Option<&'a LoopNest>,
    /// Enclosing GPU thread loop.
    pub thread: Option<&'a LoopNest>,
    pub memory_type: MemoryType,
    pub allocation_size: i64,
    pub is_constant_allocation: bool,
    /// Times the func is realized; only meaningful for unscheduled funcs.
    pub num_realizations: i64,
    pub inlined: bool,
    /// Every innermost loop the func is inlined into.
    pub inlined_innermosts: Vec<&'a LoopNest>,
    pub hash_of_producers_stored_at_root: u64,
}

impl<'a> Sites<'a> {
    pub fn store(&self) -> &'a LoopNest {
        match self.store {
            Some(s) => s,
            None => panic!("site invariant: stage has no store site"),
        }
    }

    pub fn compute(&self) -> &'a LoopNest {
        match self.compute {
            Some(c) => c,
            None => panic!("site invariant: stage has no compute site"),
        }
    }

    pub fn is_scheduled(&self) -> bool {
        self.produce.is_some()
    }
}

/// Sites of every stage plus the tree facts the featurizer needs alongside.
#[derive(Debug, Default)]
pub struct SiteMap<'a> {
    pub sites: StageMap<Sites<'a>>,
    /// Loop id → (parent loop, depth of the loop below the root).
    parents: HashMap<u64, (&'a LoopNest, usize)>,
    /// Shared memory allocated per block loop, keyed by the block's stage.
    pub total_shared_mem_alloc_sizes: StageMap<i64>,
}

impl<'a> SiteMap<'a> {
    /// Sites of every stage scheduled in the tree under `root`.
    pub fn collect(root: &'a LoopNest, ctx: &Context) -> Self {
        let mut map = Self::default();
        map.visit(root, None, None, None, ctx);
        map.compute_parents(root, 0);
        map
    }

    pub fn get(&self, s: StageId) -> &Sites<'a> {
        match self.sites.get(&s) {
            Some(site) => site,
            None => panic!("site invariant: stage {} has no sites", s.0),
        }
    }

    /// Sites of the pure stage of `f`.
    pub fn of_node(&self, f: NodeId, ctx: &Context) -> &Sites<'a> {
        self.get(ctx.dag.node(f).stages[0])
    }

    fn visit(
        &mut self,
        nest: &'a LoopNest,
        task: Option<&'a LoopNest>,
        parent: Option<&'a LoopNest>,
        thread: Option<&'a LoopNest>,
        ctx: &Context,
    ) {
        let dag = ctx.dag;
        let thread = if nest.is_gpu_thread() { Some(nest) } else { thread };
        let task = if task.is_none() && !nest.is_root() { Some(nest) } else { task };

        for c in &nest.children {
            self.visit(c, task, Some(nest), thread, ctx);
        }

        if let Some(parent) = parent
            && nest.node != parent.node
        {
            let s = self.sites.entry(nest.stage_id()).or_default();
            s.compute = Some(parent);
            s.produce = Some(nest);
            s.task = task;
        }

        let memory_type = match (task.is_some(), thread.is_some()) {
            (_, true) => MemoryType::Local,
            (true, false) => MemoryType::Shared,
            (false, false) => MemoryType::Global,
        };
        for &f in &nest.store_at {
            let (allocation_size, is_constant_allocation) = nest.compute_alloc_size_of_node_here(f, dag);
            for &sid in &dag.node(f).stages {
                let s = self.sites.entry(sid).or_default();
                s.store = Some(nest);
                s.memory_type = memory_type;
                s.allocation_size = allocation_size;
                s.is_constant_allocation = is_constant_allocation;
                if nest.is_gpu_block() && dag.stage(sid).index == 0 {
                    *self.total_shared_mem_alloc_sizes.entry(nest.stage_id()).or_default() += allocation_size;
                }
            }
        }

        for &f in nest.inlined.keys() {
            let s = self.sites.entry(dag.node(f).stages[0]).or_default();
            s.inlined = true;
            s.compute = Some(nest);
            s.store = Some(nest);
            s.produce = Some(nest);
            s.innermost = Some(nest);
            s.memory_type = MemoryType::Inlined;
            s.task = task;
            s.inlined_innermosts.push(nest);
        }

        if nest.innermost {
            let s = self.sites.entry(nest.stage_id()).or_default();
            s.innermost = Some(nest);
            s.thread = thread;
        }
    }

    fn compute_parents(&mut self, nest: &'a LoopNest, depth: usize) {
        for c in &nest.children {
            self.parents.insert(c.id(), (nest, depth + 1));
            self.compute_parents(c, depth + 1);
        }
    }

    fn parent_of(&self, nest: &LoopNest) -> Option<(&'a LoopNest, usize)> {
        self.parents.get(&nest.id()).copied()
    }

    // ========================================================================
    // REGISTER PROMOTION
    // ========================================================================

    /// Move thread-local allocations into registers.
    ///
    /// An allocation qualifies when it has a constant size within the
    /// register limit and every innermost loop reading it does so at indices
    /// fixed once the surrounding loops are unrolled. Returns false when some
    /// thread-local allocation does not qualify.
    pub fn promote_allocs_to_registers(&mut self, root: &'a LoopNest, ctx: &Context) -> bool {
        let mut can_promote = BTreeMap::new();
        self.find_promotable(root, None, None, &mut can_promote, ctx);
        for (f, ok) in &can_promote {
            if !ok {
                return false;
            }
            for &sid in &ctx.dag.node(*f).stages {
                let s = self.sites.entry(sid).or_default();
                assert_eq!(s.memory_type, MemoryType::Local, "site invariant: promoting a non-local allocation");
                s.memory_type = MemoryType::Registers;
            }
        }
        true
    }

    fn find_promotable(
        &self,
        nest: &'a LoopNest,
        grandparent: Option<&'a LoopNest>,
        parent: Option<&'a LoopNest>,
        can_promote: &mut BTreeMap<NodeId, bool>,
        ctx: &Context,
    ) {
        let dag = ctx.dag;
        for &f in &nest.store_at {
            let site = self.of_node(f, ctx);
            if site.memory_type != MemoryType::Local {
                continue;
            }
            can_promote.insert(
                f,
                site.is_constant_allocation && site.allocation_size <= ctx.target.register_allocation_limit,
            );
        }

        for c in &nest.children {
            self.find_promotable(c, parent, Some(nest), can_promote, ctx);
        }

        if nest.innermost
            && let (Some(parent), Some(grandparent)) = (parent, grandparent)
        {
            let unrolled = nest.unrolled_loops(parent, grandparent, ctx);
            for e in dag.incoming(nest.stage_id()) {
                let Some(ok) = can_promote.get_mut(&e.producer) else {
                    continue;
                };
                let constant_index = e.footprint.iter().all(|fp| match *fp {
                    DimFootprint::Affine { loop_index, scale, .. } => {
                        scale == 0 || unrolled.get(loop_index).copied().unwrap_or(false)
                    }
                    DimFootprint::Constant(_) => true,
                });
                *ok &= constant_index;
            }
        }
    }

    // ========================================================================
    // UNSCHEDULED FUNCS
    // ========================================================================

    /// Give inputs, unscheduled outputs and every func the search has not
    /// placed yet a plausible site, then hash the producers each root-level
    /// loop nest depends on.
    pub fn finish(&mut self, root: &'a LoopNest, ctx: &Context) {
        let dag = ctx.dag;
        for n in dag.nodes().iter().filter(|n| n.is_input || n.is_output) {
            for &sid in &n.stages {
                let s = self.sites.entry(sid).or_default();
                if s.compute.is_none() {
                    s.compute = Some(root);
                    s.store = Some(root);
                    s.memory_type = MemoryType::Global;
                }
            }
        }

        for n in dag.nodes() {
            if self.sites.contains_key(&n.stages[0]) {
                continue;
            }
            let mut lca: Option<&'a LoopNest> = None;
            for e in dag.outgoing(n.id) {
                let consumer = self.get(e.consumer);
                let locations: Vec<&'a LoopNest> = if consumer.inlined {
                    consumer.inlined_innermosts.clone()
                } else {
                    match consumer.innermost.or(consumer.compute) {
                        Some(l) => vec![l],
                        None => panic!("site invariant: consumer of {} has no site", n.name),
                    }
                };
                for l in locations {
                    lca = Some(match lca {
                        Some(acc) => self.deepest_common_ancestor(l, acc),
                        None => l,
                    });
                }
            }
            let Some(lca) = lca else {
                panic!("site invariant: no plausible site for unscheduled func {}", n.name);
            };

            let location = self.deepest_valid_compute_location(n.id, lca, root, ctx);
            let num_realizations = self.total_loop_extents_of_ancestors(location);
            for &sid in &n.stages {
                let mut site = Sites {
                    compute: Some(location),
                    store: Some(location),
                    num_realizations,
                    ..Default::default()
                };
                if ctx.has_gpu() {
                    self.set_gpu_store_site(location, &mut site);
                }
                self.sites.insert(sid, site);
            }
        }

        for c in &root.children {
            let hash = self.hash_of_producers_stored_at_root(c, ctx);
            self.sites.entry(c.stage_id()).or_default().hash_of_producers_stored_at_root = hash;
        }
    }

    pub fn deepest_common_ancestor(&self, a: &'a LoopNest, b: &'a LoopNest) -> &'a LoopNest {
        if a.is_root() {
            return a;
        }
        if b.is_root() || a.id() == b.id() {
            return b;
        }
        let (mut a, mut b) = (a, b);
        let depth = |l: &LoopNest| self.parent_of(l).map_or(0, |(_, d)| d);
        while depth(a) > depth(b) {
            a = self.parent_or_panic(a);
        }
        while depth(b) > depth(a) {
            b = self.parent_or_panic(b);
        }
        while a.id() != b.id() {
            a = self.parent_or_panic(a);
            b = self.parent_or_panic(b);
        }
        a
    }

    fn parent_or_panic(&self, l: &LoopNest) -> &'a LoopNest {
        match self.parent_of(l) {
            Some((p, _)) => p,
            None => panic!("loop nest invariant: loop {} has no parent", l.id()),
        }
    }

    /// Walk down from the root toward `lca`, stopping where the func's
    /// region stops shrinking or where it no longer fits in shared memory or
    /// registers. Innermost loops are never compute locations.
    fn deepest_valid_compute_location(
        &mut self,
        f: NodeId,
        lca: &'a LoopNest,
        root: &'a LoopNest,
        ctx: &Context,
    ) -> &'a LoopNest {
        let dag = ctx.dag;
        let mut ancestors = Vec::new();
        if !lca.innermost {
            ancestors.push(lca);
        }
        let mut cur = lca;
        while let Some((p, _)) = self.parent_of(cur) {
            ancestors.push(p);
            cur = p;
        }
        let Some(&outermost) = ancestors.last() else {
            return root;
        };

        let shared_limit = ctx.config.gpu.shared_memory_limit();
        let mut candidate = outermost;
        let mut new_shared_mem_alloc_size = 0;
        for &l in ancestors.iter().rev().skip(1) {
            let (bytes, _) = l.compute_alloc_size_of_node_here(f, dag);
            if l.is_gpu_block() {
                let total = bytes + self.total_shared_mem_alloc_sizes.get(&l.stage_id()).copied().unwrap_or(0);
                if shared_limit > 0 && total > shared_limit {
                    continue;
                }
                new_shared_mem_alloc_size = bytes;
            }
            if matches!(l.gpu_role, GpuRole::Thread | GpuRole::Serial) && bytes > ctx.target.register_allocation_limit {
                continue;
            }
            if !l.region_computed_shrinks(f, candidate, dag) {
                break;
            }
            candidate = l;
        }

        if candidate.is_gpu_block() {
            *self.total_shared_mem_alloc_sizes.entry(candidate.stage_id()).or_default() += new_shared_mem_alloc_size;
        }
        assert!(!candidate.innermost, "site invariant: innermost loop chosen as compute location");
        candidate
    }

    /// Product of every loop extent from `l` up to the root.
    fn total_loop_extents_of_ancestors(&self, l: &'a LoopNest) -> i64 {
        let mut total = 1;
        let mut cur = Some(l);
        while let Some(c) = cur
            && !c.is_root()
        {
            total *= c.size.iter().product::<i64>();
            cur = self.parent_of(c).map(|(p, _)| p);
        }
        total
    }

    /// A func stored inside a block but outside its thread loops has its
    /// allocation hoisted to the block.
    fn set_gpu_store_site(&self, location: &'a LoopNest, site: &mut Sites<'a>) {
        let mut cur = location;
        loop {
            if cur.is_gpu_thread() {
                site.memory_type = MemoryType::Registers;
                return;
            }
            if cur.is_root() {
                site.memory_type = MemoryType::Global;
                return;
            }
            if cur.is_gpu_block() {
                site.store = Some(cur);
                site.memory_type = MemoryType::Shared;
                return;
            }
            cur = self.parent_or_panic(cur);
        }
    }

    /// Hash of the producers of everything under `c` that are stored at the
    /// root, with the dimension each is vectorized along.
    fn hash_of_producers_stored_at_root(&self, c: &LoopNest, ctx: &Context) -> u64 {
        let dag = ctx.dag;
        let mut producers = std::collections::BTreeSet::new();
        let mut pending: Vec<StageId> = Vec::new();
        collect_stages(c, &mut pending);
        let mut seen = std::collections::BTreeSet::new();
        while let Some(s) = pending.pop() {
            if !seen.insert(s) {
                continue;
            }
            for e in dag.incoming(s) {
                let site = self.of_node(e.producer, ctx);
                if site.store.is_some_and(LoopNest::is_root) {
                    producers.insert(e.producer);
                } else if site.inlined {
                    pending.push(dag.node(e.producer).stages[0]);
                }
            }
        }

        let mut h = 0;
        for p in producers {
            hash_combine(&mut h, p.0 as u64);
            let vector_dim = self.of_node(p, ctx).produce.and_then(|l| l.vector_dim);
            hash_combine(&mut h, vector_dim.map_or(u64::MAX, |v| v as u64));
        }
        h
    }
}

/// Every stage with a loop under `nest`.
pub fn collect_stages(nest: &LoopNest, out: &mut Vec<StageId>) {
    if let Some(s) = nest.stage {
        out.push(s);
    }
    for c in &nest.children {
        collect_stages(c, out);
    }
}

#[cfg(test)]
mod tests {
    use crate::test::helpers::*;

    use super::*;

    #[test]
    fn test_root_stores_are_global() {
        let h = Harness::blur();
        let ctx = h.ctx();
        let root = h.compute_root_all();
        let mut sites = SiteMap::collect(&root, &ctx);
        sites.finish(&root, &ctx);
        for name in ["blur_x", "blur_y"] {
            let s = sites.of_node(h.node(name), &ctx);
            assert_eq!(s.memory_type, MemoryType::Global);
            assert!(s.store().is_root());
            assert!(s.is_scheduled());
        }
        let input = sites.of_node(h.node("in"), &ctx);
        assert!(input.compute().is_root());
        assert!(!input.is_scheduled());
    }

    #[test]
    fn test_unscheduled_producer_sits_with_consumer() {
        let h = Harness::blur();
        let ctx = h.ctx();
        let mut root = LoopNest::root();
        root.compute_here(h.node("blur_y"), true, 0, false, &ctx);
        root.store_at.insert(h.node("blur_y"));
        let mut sites = SiteMap::collect(&root, &ctx);
        sites.finish(&root, &ctx);
        let bx = sites.of_node(h.node("blur_x"), &ctx);
        assert!(!bx.is_scheduled());
        assert!(bx.num_realizations >= 1);
        assert!(!bx.compute().innermost);
    }

    #[test]
    fn test_deepest_common_ancestor() {
        let h = Harness::blur();
        let ctx = h.ctx();
        let root = h.compute_root_all();
        let sites = SiteMap::collect(&root, &ctx);
        let a: &LoopNest = &root.children[0].children[0];
        let b: &LoopNest = &root.children[1].children[0];
        assert!(sites.deepest_common_ancestor(a, b).is_root());
        let parent: &LoopNest = &root.children[0];
        assert_eq!(sites.deepest_common_ancestor(a, parent).id(), parent.id());
    }

    #[test]
    fn test_producer_hash_ignores_unrelated_children() {
        let h = Harness::blur();
        let ctx = h.ctx();
        let root = h.compute_root_all();
        let mut sites = SiteMap::collect(&root, &ctx);
        sites.finish(&root, &ctx);
        let blur_y = sites.of_node(h.node("blur_y"), &ctx).hash_of_producers_stored_at_root;
        let blur_x = sites.of_node(h.node("blur_x"), &ctx).hash_of_producers_stored_at_root;
        // blur_y reads blur_x from root; blur_x reads only the input.
        assert_ne!(blur_y, blur_x);
    }
}
