//! Compiler parameters of a kernel call.
//!
//! Built with bon builders; [`CompilerParams::from_env`] fills unset fields
//! from environment variables.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bon::bon;

use crate::check::CheckFailure;

// ============================================================================
// COST ESTIMATE
// ============================================================================

/// Scheduling hints handed through to the lowered program unchanged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CostEstimate {
    pub flops: u64,
    pub transcendentals: u64,
    pub bytes_accessed: u64,
}

#[bon]
impl CostEstimate {
    #[builder]
    pub fn new(
        #[builder(default)] flops: u64,
        #[builder(default)] transcendentals: u64,
        #[builder(default)] bytes_accessed: u64,
    ) -> Self {
        Self { flops, transcendentals, bytes_accessed }
    }
}

// ============================================================================
// DIMENSION SEMANTICS
// ============================================================================

/// Whether iterations along a grid axis are independent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
pub enum DimensionSemantics {
    /// Iterations may run on different cores.
    #[default]
    Parallel,

    /// Iterations carry state (e.g. an accumulator) and must stay on one core.
    Arbitrary,
}

// ============================================================================
// COMPILER PARAMETERS
// ============================================================================

/// Callback invoked for every check failure as it is recorded.
pub type CheckHook = Arc<dyn Fn(&CheckFailure) + Send + Sync>;

#[derive(Clone)]
pub struct CompilerParams {
    /// VMEM budget per core; defaults to [`MemorySpace::DEFAULT_VMEM_LIMIT`](tessel_device::MemorySpace).
    pub vmem_limit_bytes: Option<usize>,
    pub smem_limit_bytes: Option<usize>,
    /// Extra VMEM reserved for the lowered program.
    pub internal_scratch_in_bytes: Option<usize>,
    pub cost_estimate: Option<CostEstimate>,
    /// Namespace of barrier semaphores.
    pub collective_id: Option<u32>,
    /// One entry per grid axis; all axes are parallel when unset.
    pub dimension_semantics: Option<Vec<DimensionSemantics>>,
    pub num_cores: usize,
    /// Axis to split across cores; the first parallel axis when unset.
    pub megacore_axis: Option<usize>,
    /// Bound on semaphore waits and remote slot lookups. Unbounded when unset.
    pub deadlock_timeout: Option<Duration>,
    pub elide_redundant_copies: bool,
    pub check_hook: Option<CheckHook>,
}

impl fmt::Debug for CompilerParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilerParams")
            .field("vmem_limit_bytes", &self.vmem_limit_bytes)
            .field("smem_limit_bytes", &self.smem_limit_bytes)
            .field("internal_scratch_in_bytes", &self.internal_scratch_in_bytes)
            .field("cost_estimate", &self.cost_estimate)
            .field("collective_id", &self.collective_id)
            .field("dimension_semantics", &self.dimension_semantics)
            .field("num_cores", &self.num_cores)
            .field("megacore_axis", &self.megacore_axis)
            .field("deadlock_timeout", &self.deadlock_timeout)
            .field("elide_redundant_copies", &self.elide_redundant_copies)
            .field("check_hook", &self.check_hook.is_some())
            .finish()
    }
}

impl Default for CompilerParams {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon]
impl CompilerParams {
    #[builder]
    pub fn new(
        vmem_limit_bytes: Option<usize>,
        smem_limit_bytes: Option<usize>,
        internal_scratch_in_bytes: Option<usize>,
        cost_estimate: Option<CostEstimate>,
        collective_id: Option<u32>,
        dimension_semantics: Option<Vec<DimensionSemantics>>,
        #[builder(default = 1)] num_cores: usize,
        megacore_axis: Option<usize>,
        deadlock_timeout: Option<Duration>,
        #[builder(default = true)] elide_redundant_copies: bool,
        check_hook: Option<CheckHook>,
    ) -> Self {
        Self {
            vmem_limit_bytes,
            smem_limit_bytes,
            internal_scratch_in_bytes,
            cost_estimate,
            collective_id,
            dimension_semantics,
            num_cores,
            megacore_axis,
            deadlock_timeout,
            elide_redundant_copies,
            check_hook,
        }
    }

    /// Create parameters from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `TESSEL_VMEM_LIMIT_BYTES=N` - VMEM budget per core
    /// * `TESSEL_DEADLOCK_TIMEOUT_MS=N` - Enable the deadlock detector
    /// * `TESSEL_NUM_CORES=N` - Megacore split width
    /// * `TESSEL_NO_ELIDE=1` - Re-stage input windows even when unchanged
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Fill fields left at their defaults from environment variables.
    pub fn with_env(mut self) -> Self {
        fn parse<T: std::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.parse().ok()
        }

        if self.vmem_limit_bytes.is_none() {
            self.vmem_limit_bytes = parse("TESSEL_VMEM_LIMIT_BYTES");
        }
        if self.deadlock_timeout.is_none() {
            self.deadlock_timeout = parse::<u64>("TESSEL_DEADLOCK_TIMEOUT_MS").map(Duration::from_millis);
        }
        if self.num_cores == 1
            && let Some(cores) = parse::<usize>("TESSEL_NUM_CORES")
            && cores > 0
        {
            self.num_cores = cores;
        }
        if std::env::var("TESSEL_NO_ELIDE").is_ok() {
            self.elide_redundant_copies = false;
        }
        self
    }

    pub fn vmem_limit(&self) -> usize {
        self.vmem_limit_bytes.unwrap_or(tessel_device::MemorySpace::DEFAULT_VMEM_LIMIT)
    }

    pub fn smem_limit(&self) -> usize {
        self.smem_limit_bytes.unwrap_or(tessel_device::MemorySpace::DEFAULT_SMEM_LIMIT)
    }

    /// Semantics of `axis`, parallel unless declared otherwise.
    pub fn semantics(&self, axis: usize) -> DimensionSemantics {
        self.dimension_semantics.as_ref().and_then(|s| s.get(axis).copied()).unwrap_or_default()
    }
}
