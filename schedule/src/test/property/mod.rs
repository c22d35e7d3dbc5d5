//! Property-based tests for fingerprints, GPU mapping, feasibility and
//! source rendering.

mod gpu_props;
mod loop_nest_props;
mod source_props;
mod state_props;
