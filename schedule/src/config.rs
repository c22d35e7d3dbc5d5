//! Autoscheduler configuration types.
//!
//! One immutable [`AutoschedulerConfig`] is built at the start of a search and
//! passed by reference to every component. Each section can be built
//! explicitly with a bon builder or read from `ARBOR_*` environment variables.

use std::str::FromStr;

use bon::bon;

use crate::error::*;

// ============================================================================
// ENVIRONMENT HELPERS
// ============================================================================

/// Boolean toggle accepting `1`/`0`, `true`/`false` and `on`/`off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EnvFlag(bool);

impl FromStr for EnvFlag {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "on" => Ok(Self(true)),
            "0" | "false" | "off" => Ok(Self(false)),
            _ => Err(()),
        }
    }
}

/// Read and parse `var`; `Ok(None)` when unset.
fn env_var<T: FromStr>(var: &'static str) -> Result<Option<T>> {
    let Ok(value) = std::env::var(var) else {
        return Ok(None);
    };
    match value.parse() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(_) => InvalidEnvSnafu { var, value }.fail(),
    }
}

/// Lenient variant of [`env_var`]: unset or unparsable values fall back to `default`.
fn env_or<T: FromStr>(var: &'static str, default: T) -> T {
    std::env::var(var).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn env_flag_or(var: &'static str, default: bool) -> bool {
    env_or(var, EnvFlag(default)).0
}

fn try_env_flag(var: &'static str, default: bool) -> Result<bool> {
    Ok(env_var::<EnvFlag>(var)?.map_or(default, |f| f.0))
}

// ============================================================================
// GPU PARAMETERS
// ============================================================================

/// Machine parameters of the GPU being scheduled for.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuParams {
    /// Number of streaming multiprocessors (or CPU cores).
    pub parallelism: i64,
    /// Shared memory available to one block, in KiB. Zero disables the check.
    pub shared_memory_limit_kb: i64,
    /// Shared memory available to one SM, in KiB.
    pub shared_memory_sm_limit_kb: i64,
    /// Maximum resident blocks per SM.
    pub active_block_limit: i64,
    /// Maximum resident warps per SM.
    pub active_warp_limit: i64,
    /// Scale applied to the per-thread stack baseline.
    pub stack_factor: f64,
}

impl GpuParams {
    pub fn shared_memory_limit(&self) -> i64 {
        self.shared_memory_limit_kb * 1024
    }

    pub fn shared_memory_sm_limit(&self) -> i64 {
        self.shared_memory_sm_limit_kb * 1024
    }

    /// Create parameters from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `ARBOR_PARALLELISM` - Number of SMs (default: 80)
    /// * `ARBOR_SHARED_MEMORY_LIMIT_KB` - Per-block shared memory (default: 48)
    /// * `ARBOR_SHARED_MEMORY_SM_LIMIT_KB` - Per-SM shared memory (default: 96)
    /// * `ARBOR_ACTIVE_BLOCK_LIMIT` - Resident blocks per SM (default: 32)
    /// * `ARBOR_ACTIVE_WARP_LIMIT` - Resident warps per SM (default: 64)
    /// * `ARBOR_STACK_FACTOR` - Stack budget scale (default: 0.95)
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            parallelism: env_or("ARBOR_PARALLELISM", d.parallelism),
            shared_memory_limit_kb: env_or("ARBOR_SHARED_MEMORY_LIMIT_KB", d.shared_memory_limit_kb),
            shared_memory_sm_limit_kb: env_or("ARBOR_SHARED_MEMORY_SM_LIMIT_KB", d.shared_memory_sm_limit_kb),
            active_block_limit: env_or("ARBOR_ACTIVE_BLOCK_LIMIT", d.active_block_limit),
            active_warp_limit: env_or("ARBOR_ACTIVE_WARP_LIMIT", d.active_warp_limit),
            stack_factor: env_or("ARBOR_STACK_FACTOR", d.stack_factor),
        }
    }

    /// Like [`GpuParams::from_env`], but rejects unparsable values.
    pub fn try_from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            parallelism: env_var("ARBOR_PARALLELISM")?.unwrap_or(d.parallelism),
            shared_memory_limit_kb: env_var("ARBOR_SHARED_MEMORY_LIMIT_KB")?.unwrap_or(d.shared_memory_limit_kb),
            shared_memory_sm_limit_kb: env_var("ARBOR_SHARED_MEMORY_SM_LIMIT_KB")?
                .unwrap_or(d.shared_memory_sm_limit_kb),
            active_block_limit: env_var("ARBOR_ACTIVE_BLOCK_LIMIT")?.unwrap_or(d.active_block_limit),
            active_warp_limit: env_var("ARBOR_ACTIVE_WARP_LIMIT")?.unwrap_or(d.active_warp_limit),
            stack_factor: env_var("ARBOR_STACK_FACTOR")?.unwrap_or(d.stack_factor),
        })
    }
}

impl Default for GpuParams {
    fn default() -> Self {
        Self {
            parallelism: 80,
            shared_memory_limit_kb: 48,
            shared_memory_sm_limit_kb: 96,
            active_block_limit: 32,
            active_warp_limit: 64,
            stack_factor: 0.95,
        }
    }
}

#[bon]
impl GpuParams {
    /// Create GPU parameters with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = 80)] parallelism: i64,
        #[builder(default = 48)] shared_memory_limit_kb: i64,
        #[builder(default = 96)] shared_memory_sm_limit_kb: i64,
        #[builder(default = 32)] active_block_limit: i64,
        #[builder(default = 64)] active_warp_limit: i64,
        #[builder(default = 0.95)] stack_factor: f64,
    ) -> Self {
        Self {
            parallelism,
            shared_memory_limit_kb,
            shared_memory_sm_limit_kb,
            active_block_limit,
            active_warp_limit,
            stack_factor,
        }
    }
}

// ============================================================================
// SEARCH SPACE
// ============================================================================

/// Which compute locations the search may consider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchSpaceOptions {
    pub compute_root: bool,
    pub compute_inline: bool,
    pub compute_at_block: bool,
    pub compute_at_thread: bool,
}

impl SearchSpaceOptions {
    /// Only compute-root and inline schedules.
    pub const ROOT_AND_INLINE_ONLY: Self =
        Self { compute_root: true, compute_inline: true, compute_at_block: false, compute_at_thread: false };

    pub fn compute_root_and_inline_only(&self) -> bool {
        *self == Self::ROOT_AND_INLINE_ONLY
    }

    /// Read `ARBOR_SEARCH_SPACE_OPTIONS`, falling back to the full space.
    pub fn from_env() -> Self {
        env_or("ARBOR_SEARCH_SPACE_OPTIONS", Self::default())
    }
}

impl Default for SearchSpaceOptions {
    fn default() -> Self {
        Self { compute_root: true, compute_inline: true, compute_at_block: true, compute_at_thread: true }
    }
}

/// Parse a 4-character bit string: compute root, inline, at block, at thread.
impl FromStr for SearchSpaceOptions {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bits: Vec<bool> = s
            .trim()
            .chars()
            .map(|c| match c {
                '1' => Ok(true),
                '0' => Ok(false),
                _ => Err(()),
            })
            .collect::<std::result::Result<_, _>>()?;
        let [compute_root, compute_inline, compute_at_block, compute_at_thread] = bits[..] else {
            return Err(());
        };
        Ok(Self { compute_root, compute_inline, compute_at_block, compute_at_thread })
    }
}

impl std::fmt::Display for SearchSpaceOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for bit in [self.compute_root, self.compute_inline, self.compute_at_block, self.compute_at_thread] {
            write!(f, "{}", bit as u8)?;
        }
        Ok(())
    }
}

// ============================================================================
// FEATURIZATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureOptions {
    /// Reuse features of root-level loop nests whose producers did not change.
    pub enable_memoized_features: bool,
    /// Recompute memoized features from scratch and panic on mismatch.
    /// Expensive; regression testing only.
    pub verify_memoized_features: bool,
}

impl Default for FeatureOptions {
    fn default() -> Self {
        Self { enable_memoized_features: true, verify_memoized_features: false }
    }
}

#[bon]
impl FeatureOptions {
    #[builder]
    pub fn builder(
        #[builder(default = true)] enable_memoized_features: bool,
        #[builder(default = false)] verify_memoized_features: bool,
    ) -> Self {
        Self { enable_memoized_features, verify_memoized_features }
    }

    /// # Environment Variables
    ///
    /// * `ARBOR_ENABLE_MEMOIZED_FEATURES` - default: 1
    /// * `ARBOR_VERIFY_MEMOIZED_FEATURES` - default: 0
    pub fn from_env() -> Self {
        Self {
            enable_memoized_features: env_flag_or("ARBOR_ENABLE_MEMOIZED_FEATURES", true),
            verify_memoized_features: env_flag_or("ARBOR_VERIFY_MEMOIZED_FEATURES", false),
        }
    }
}

// ============================================================================
// SEARCH DRIVER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    /// Number of states kept after each decision.
    pub beam_size: usize,
    /// Let parallel tilings round inner extents to balance tiles.
    pub experimental_adjusted_tilings: bool,
    /// Cap on children accepted when expanding one state.
    pub max_children_per_decision: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self { beam_size: 32, experimental_adjusted_tilings: false, max_children_per_decision: 64 }
    }
}

#[bon]
impl SearchOptions {
    #[builder]
    pub fn builder(
        #[builder(default = 32)] beam_size: usize,
        #[builder(default = false)] experimental_adjusted_tilings: bool,
        #[builder(default = 64)] max_children_per_decision: usize,
    ) -> Self {
        Self { beam_size, experimental_adjusted_tilings, max_children_per_decision }
    }

    /// # Environment Variables
    ///
    /// * `ARBOR_BEAM_SIZE` - default: 32
    /// * `ARBOR_ADJUSTED_TILINGS` - default: 0
    pub fn from_env() -> Self {
        Self {
            beam_size: env_or("ARBOR_BEAM_SIZE", 32),
            experimental_adjusted_tilings: env_flag_or("ARBOR_ADJUSTED_TILINGS", false),
            ..Default::default()
        }
    }
}

// ============================================================================
// TOP-LEVEL CONFIGURATION
// ============================================================================

/// Top-level autoscheduler configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoschedulerConfig {
    pub gpu: GpuParams,
    pub search_space: SearchSpaceOptions,
    pub features: FeatureOptions,
    pub search: SearchOptions,
}

#[bon]
impl AutoschedulerConfig {
    #[builder]
    pub fn builder(
        #[builder(default)] gpu: GpuParams,
        #[builder(default)] search_space: SearchSpaceOptions,
        #[builder(default)] features: FeatureOptions,
        #[builder(default)] search: SearchOptions,
    ) -> Self {
        Self { gpu, search_space, features, search }
    }

    /// Create configuration from environment variables, ignoring bad values.
    pub fn from_env() -> Self {
        Self {
            gpu: GpuParams::from_env(),
            search_space: SearchSpaceOptions::from_env(),
            features: FeatureOptions::from_env(),
            search: SearchOptions::from_env(),
        }
    }

    /// Create configuration from environment variables, failing on the
    /// first value that does not parse.
    pub fn try_from_env() -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            gpu: GpuParams::try_from_env()?,
            search_space: env_var("ARBOR_SEARCH_SPACE_OPTIONS")?.unwrap_or(d.search_space),
            features: FeatureOptions {
                enable_memoized_features: try_env_flag("ARBOR_ENABLE_MEMOIZED_FEATURES", true)?,
                verify_memoized_features: try_env_flag("ARBOR_VERIFY_MEMOIZED_FEATURES", false)?,
            },
            search: SearchOptions {
                beam_size: env_var("ARBOR_BEAM_SIZE")?.unwrap_or(d.search.beam_size),
                experimental_adjusted_tilings: try_env_flag("ARBOR_ADJUSTED_TILINGS", false)?,
                ..d.search
            },
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_gpu_params_default() {
        let p = GpuParams::default();
        assert_eq!(p.parallelism, 80);
        assert_eq!(p.shared_memory_limit(), 48 * 1024);
        assert_eq!(p.shared_memory_sm_limit(), 96 * 1024);
        assert_eq!(p.stack_factor, 0.95);
    }

    #[test]
    fn test_gpu_params_builder_matches_default() {
        assert_eq!(GpuParams::builder().build(), GpuParams::default());
        let p = GpuParams::builder().parallelism(16).shared_memory_limit_kb(0).build();
        assert_eq!(p.parallelism, 16);
        assert_eq!(p.shared_memory_limit(), 0);
        assert_eq!(p.active_warp_limit, 64);
    }

    #[test_case("1111", SearchSpaceOptions::default() ; "full space")]
    #[test_case("1100", SearchSpaceOptions::ROOT_AND_INLINE_ONLY ; "root and inline")]
    #[test_case(" 1010 ", SearchSpaceOptions { compute_root: true, compute_inline: false, compute_at_block: true, compute_at_thread: false } ; "padded")]
    fn test_search_space_parse(s: &str, expected: SearchSpaceOptions) {
        assert_eq!(s.parse::<SearchSpaceOptions>(), Ok(expected));
    }

    #[test_case("111" ; "too short")]
    #[test_case("11111" ; "too long")]
    #[test_case("11x1" ; "bad digit")]
    fn test_search_space_parse_rejects(s: &str) {
        assert!(s.parse::<SearchSpaceOptions>().is_err());
    }

    #[test]
    fn test_search_space_display_round_trips() {
        let o = SearchSpaceOptions::ROOT_AND_INLINE_ONLY;
        assert_eq!(o.to_string(), "1100");
        assert!(o.compute_root_and_inline_only());
        assert!(!SearchSpaceOptions::default().compute_root_and_inline_only());
    }

    #[test_case("1", true)]
    #[test_case("TRUE", true)]
    #[test_case("off", false)]
    #[test_case("0", false)]
    fn test_env_flag_parse(s: &str, expected: bool) {
        assert_eq!(s.parse::<EnvFlag>(), Ok(EnvFlag(expected)));
    }

    #[test]
    fn test_top_level_builder() {
        let config = AutoschedulerConfig::builder()
            .search(SearchOptions::builder().beam_size(4).build())
            .search_space(SearchSpaceOptions::ROOT_AND_INLINE_ONLY)
            .build();
        assert_eq!(config.search.beam_size, 4);
        assert_eq!(config.gpu, GpuParams::default());
        assert!(config.features.enable_memoized_features);
        assert!(!config.features.verify_memoized_features);
    }
}
