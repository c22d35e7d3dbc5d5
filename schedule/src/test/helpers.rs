//! Test utilities for loop nest, featurization and search tests.
//!
//! [`Harness`] owns a small pipeline together with the configuration and
//! target a [`Context`] borrows, so tests can build loop nests against it
//! without repeating the setup.

use std::sync::Arc;

use arbor_dag::{DagBuilder, DimFootprint, FuncDecl, FunctionDag, LoopVar, NodeId, Span};

use crate::config::AutoschedulerConfig;
use crate::context::Context;
use crate::loop_nest::{GpuRole, LoopNest, TileOptions};
use crate::target::Target;

pub struct Harness {
    dag: FunctionDag,
    pub config: AutoschedulerConfig,
    pub target: Target,
}

impl Harness {
    /// Wrap a pipeline with the default configuration and a CUDA target.
    pub fn new(dag: FunctionDag) -> Self {
        Self { dag, config: AutoschedulerConfig::default(), target: Target::cuda() }
    }

    /// `out(x) = in(x)` over `n` points.
    pub fn pointwise_1d(n: i64) -> Self {
        let mut b = DagBuilder::new();
        b.input("in", &["x"], 4);
        b.func(output("out", &["x"], &[n]));
        b.pointwise("in", "out");
        Self::new(b.build().unwrap())
    }

    /// `out(x, y) = in(x, y)` over a `w` × `h` image.
    pub fn pointwise_2d(w: i64, h: i64) -> Self {
        let mut b = DagBuilder::new();
        b.input("in", &["x", "y"], 4);
        b.func(output("out", &["x", "y"], &[w, h]));
        b.pointwise("in", "out");
        Self::new(b.build().unwrap())
    }

    /// Separable 3×3 box blur of a 1024 × 1024 image.
    ///
    /// ```text
    /// blur_x(x, y) = in(x - 1, y) + in(x, y) + in(x + 1, y)
    /// blur_y(x, y) = blur_x(x, y - 1) + blur_x(x, y) + blur_x(x, y + 1)
    /// ```
    pub fn blur() -> Self {
        let mut b = DagBuilder::new();
        b.input("in", &["x", "y"], 4);
        b.func(func("blur_x", &["x", "y"]));
        b.func(output("blur_y", &["x", "y"], &[1024, 1024]));
        b.edge("in", "blur_x", 0, vec![DimFootprint::stencil(0, -1, 1), DimFootprint::identity(1)], 3);
        b.edge("blur_x", "blur_y", 0, vec![DimFootprint::identity(0), DimFootprint::stencil(1, -1, 1)], 3);
        Self::new(b.build().unwrap())
    }

    /// `sum(x) = 0; sum(x) += in(x, r)` for `r` in `[0, depth)`.
    pub fn reduction(width: i64, depth: i64) -> Self {
        let mut b = DagBuilder::new();
        b.input("in", &["x", "r"], 4);
        b.func(output("sum", &["x"], &[width]));
        b.update("sum", vec![LoopVar::pure("x", 0), LoopVar::reduction("r", 0, depth)]).unwrap();
        b.edge("in", "sum", 1, vec![DimFootprint::identity(0), DimFootprint::identity(1)], 1);
        Self::new(b.build().unwrap())
    }

    /// `out(x) = f(0)` where `f(x) = in(x)` takes `bytes` per point, so any
    /// realization of `f` is exactly `bytes` large.
    pub fn single_point_read(bytes: i64) -> Self {
        let mut b = DagBuilder::new();
        b.input("in", &["x"], 4);
        b.func(FuncDecl::builder().name("f").args(vec!["x".into()]).bytes_per_point(bytes).build());
        b.func(output("out", &["x"], &[64]));
        b.pointwise("in", "f");
        b.edge("f", "out", 0, vec![DimFootprint::Constant(Span::with_extent(1))], 1);
        Self::new(b.build().unwrap())
    }

    /// `out(x)` reads `taps` points of `f` within `radius` of `x`, where
    /// `f(x) = in(x)`, over `n` points.
    pub fn stencil_1d(n: i64, radius: i64, taps: i64) -> Self {
        let mut b = DagBuilder::new();
        b.input("in", &["x"], 4);
        b.func(func("f", &["x"]));
        b.func(output("out", &["x"], &[n]));
        b.pointwise("in", "f");
        b.stencil("f", "out", radius, taps);
        Self::new(b.build().unwrap())
    }

    pub fn with_cpu(mut self) -> Self {
        self.target = Target::cpu();
        self
    }

    pub fn with_config(mut self, edit: impl FnOnce(&mut AutoschedulerConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn with_target(mut self, edit: impl FnOnce(&mut Target)) -> Self {
        edit(&mut self.target);
        self
    }

    pub fn ctx(&self) -> Context<'_> {
        Context::new(&self.dag, &self.config, &self.target)
    }

    pub fn dag(&self) -> &FunctionDag {
        &self.dag
    }

    /// Id of the func called `name`.
    pub fn node(&self, name: &str) -> NodeId {
        match self.dag.find_node(name) {
            Some(n) => n.id,
            None => panic!("no func named {name}"),
        }
    }

    /// Root with every computed func realized at root, vectorized along its
    /// first dimension.
    pub fn compute_root_all(&self) -> LoopNest {
        let ctx = self.ctx();
        let mut root = LoopNest::root();
        for n in self.dag.nodes().iter().filter(|n| !n.is_input) {
            root.compute_here(n.id, true, 0, false, &ctx);
            root.store_at.insert(n.id);
        }
        root
    }

    /// [`Self::compute_root_all`] with the first root-level loop split into
    /// serial tiles of `serial`, then into blocks of `threads` threads.
    pub fn gpu_tiled(&self, serial: &[i64], threads: &[i64]) -> LoopNest {
        let ctx = self.ctx();
        let mut root = self.compute_root_all();
        let parallel = root.children[0].parallelize_in_tiles(serial, &root, TileOptions::inner(false), &ctx);
        root.children[0] = parallel.parallelize_in_tiles(threads, &root, TileOptions::inner(false), &ctx);
        root
    }

    /// `consumer` realized at root as one block with `producer` computed in
    /// it. `producer` is stored at the block, or at its own thread loop when
    /// `in_thread` is set.
    pub fn block_with_producer(&self, consumer: &str, producer: &str, in_thread: bool) -> LoopNest {
        let ctx = self.ctx();
        let (c, p) = (self.node(consumer), self.node(producer));
        let mut root = LoopNest::root();
        root.compute_here(c, true, 0, false, &ctx);
        root.store_at.insert(c);

        let mut block = (*root.children[0]).clone();
        block.gpu_role = GpuRole::Block;
        block.compute_here(p, true, 0, false, &ctx);
        if in_thread {
            let Some(last) = block.children.last_mut() else {
                panic!("{producer} was not computed in the block");
            };
            let mut thread = (**last).clone();
            assert_eq!(thread.gpu_role, GpuRole::Thread);
            thread.store_at.insert(p);
            *last = Arc::new(thread);
        } else {
            block.store_at.insert(p);
        }
        root.children[0] = Arc::new(block);
        root
    }
}

fn func(name: &str, args: &[&str]) -> FuncDecl {
    FuncDecl::builder().name(name).args(args.iter().map(|a| a.to_string()).collect()).build()
}

fn output(name: &str, args: &[&str], extents: &[i64]) -> FuncDecl {
    FuncDecl::builder()
        .name(name)
        .args(args.iter().map(|a| a.to_string()).collect())
        .is_output(true)
        .estimate(extents.iter().map(|e| Span::with_extent(*e)).collect())
        .build()
}
