//! Unit tests for schedules materialized from searched states.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::apply::{Directive, LoopLevel, MemoryKind, OUTERMOST, Scheduled, apply_schedule, sanitize_names};
use crate::cost::AnalyticCostModel;
use crate::loop_nest::GpuRole;
use crate::search::beam_search;
use crate::test::helpers::*;

fn searched(h: &Harness) -> (String, Vec<(Scheduled, Directive)>) {
    let ctx = h.ctx();
    let mut model = AnalyticCostModel::new(ctx.parallelism());
    let mut sink = Vec::new();
    let result = beam_search(&ctx, &mut model, &mut sink).unwrap();
    (result.state.schedule_source, sink)
}

#[test]
fn test_source_declares_every_realized_func() {
    let h = Harness::blur();
    let (source, _) = searched(&h);
    let mut lines = source.lines();
    assert_eq!(lines.next(), Some("auto pipeline = get_pipeline();"));
    for n in h.dag().nodes().iter().filter(|n| !n.is_input) {
        let handle = format!("Func {} = pipeline.get_func({});", n.name, h.dag().realization_index(n.id));
        assert!(source.contains(&handle), "missing `{handle}` in\n{source}");
    }
    assert!(!source.contains("Func in ="));
}

#[test]
fn test_source_is_already_sanitized() {
    let (source, _) = searched(&Harness::reduction(128, 32));
    assert_eq!(sanitize_names(&source), source);
}

#[test]
fn test_every_stage_chain_is_terminated() {
    let h = Harness::reduction(128, 32).with_cpu();
    let (source, _) = searched(&h);
    for stage in h.dag().stages().iter().filter(|s| !h.dag().node(s.node).is_input) {
        let start = source.find(&format!("\n{}", stage.name)).unwrap_or_else(|| panic!("no chain for {}", stage.name));
        assert!(source[start..].contains(';'));
    }
}

#[test]
fn test_output_is_computed_at_root() {
    let h = Harness::pointwise_2d(256, 256).with_cpu();
    let (_, sink) = searched(&h);
    let out_stage = h.dag().node(h.node("out")).stages[0];
    let levels: Vec<&LoopLevel> = sink
        .iter()
        .filter(|(on, _)| *on == Scheduled::Stage(out_stage))
        .filter_map(|(_, d)| match d {
            Directive::Compute(level) => Some(level),
            _ => None,
        })
        .collect();
    assert_eq!(levels, vec![&LoopLevel::Root]);
}

#[test]
fn test_sink_only_sees_computed_stages() {
    let h = Harness::blur();
    let (_, sink) = searched(&h);
    let input = h.node("in");
    let targets: BTreeSet<_> = sink
        .iter()
        .filter_map(|(on, _)| match on {
            Scheduled::Stage(s) => Some(h.dag().stage(*s).node),
            Scheduled::Staged { .. } => None,
        })
        .collect();
    assert!(!targets.contains(&input));
    assert!(targets.contains(&h.node("blur_y")));
}

#[test]
fn test_thread_loops_without_blocks_get_an_outer_block() {
    let h = Harness::pointwise_2d(64, 64);
    let ctx = h.ctx();
    let mut root = h.compute_root_all();
    let mut thread = (*root.children[0]).clone();
    thread.gpu_role = GpuRole::Thread;
    root.children[0] = Arc::new(thread);

    let mut sink: Vec<(Scheduled, Directive)> = Vec::new();
    let m = apply_schedule(&root, &ctx, &mut sink);
    let out = h.dag().node(h.node("out")).stages[0];
    let directives = &m.stages[&out].directives;
    let repair = [
        Directive::Split { old: "y".into(), outer: "y_outer".into(), inner: "y".into(), factor: 64, tail: None },
        Directive::Reorder(vec!["xi".into(), "x".into(), "y".into(), "y_outer".into(), OUTERMOST.into()]),
        Directive::GpuBlocks("y_outer".into()),
    ];
    assert!(directives.ends_with(&repair), "{directives:#?}");
    assert!(!directives.contains(&Directive::GpuSingleThread));
    assert!(m.new_serial_vars.contains("y_outer"));
    assert!(m.source.contains("Var y_outer(\"y_outer\");"));
    assert!(m.source.contains(".reorder(xi, x, y, y_outer, Var::outermost())"));
}

#[test]
fn test_tiled_blur_stages_producer_in_registers() {
    // Each thread computes 4 × 2 points of blur_y and reads a 4 × 4 window
    // of blur_x.
    let h = Harness::blur();
    let root = h.gpu_tiled(&[1, 2], &[8, 8]);
    let mut sink: Vec<(Scheduled, Directive)> = Vec::new();
    let m = apply_schedule(&root, &h.ctx(), &mut sink);

    let (bx, by) = (h.node("blur_x"), h.node("blur_y"));
    assert_eq!(m.staged.len(), 1);
    let staged = &m.staged[0];
    assert_eq!((staged.producer, staged.consumer), (bx, by));
    let expected = vec![
        Directive::StoreIn(MemoryKind::Register),
        Directive::Compute(LoopLevel::At { func: "blur_y".into(), var: "xi".into() }),
        Directive::BoundExtent { var: "x".into(), extent: 4 },
        Directive::Unroll("x".into()),
        Directive::BoundExtent { var: "y".into(), extent: 4 },
        Directive::Unroll("y".into()),
    ];
    assert_eq!(staged.directives, expected);

    let to_copy: Vec<&Directive> = sink
        .iter()
        .filter(|(on, _)| *on == Scheduled::Staged { producer: bx, consumer: by })
        .map(|(_, d)| d)
        .collect();
    assert_eq!(to_copy, expected.iter().collect::<Vec<_>>());
    assert!(m.source.contains(concat!(
        "blur_x.in(blur_y)\n",
        "    .store_in(MemoryType::Register)\n",
        "    .compute_at(blur_y, xi)\n",
        "    .bound_extent(x, 4)\n",
        "    .unroll(x)\n",
        "    .bound_extent(y, 4)\n",
        "    .unroll(y);"
    )));
}
