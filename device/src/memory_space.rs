//! Physical memory tiers.

/// Tier a buffer lives in.
///
/// The set is closed: allocation, staging and copy validation all match on it
/// exhaustively.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(strum::Display, strum::EnumIter, strum::EnumCount)]
pub enum MemorySpace {
    /// Unspecified placement. Treated as bulk memory that is never staged.
    #[default]
    #[strum(to_string = "ANY")]
    Any,

    /// Bulk device memory.
    #[strum(to_string = "HBM")]
    Hbm,

    /// On-chip vector memory.
    #[strum(to_string = "VMEM")]
    Vmem,

    /// On-chip scalar memory.
    #[strum(to_string = "SMEM")]
    Smem,
}

impl MemorySpace {
    /// Default on-chip budget when no explicit limit is configured.
    pub const DEFAULT_VMEM_LIMIT: usize = 16 * 1024 * 1024;
    pub const DEFAULT_SMEM_LIMIT: usize = 1024 * 1024;

    pub const fn is_on_chip(&self) -> bool {
        matches!(self, Self::Vmem | Self::Smem)
    }

    /// Windowed operands in this space are copied in and out by the driver.
    pub const fn requires_staging(&self) -> bool {
        self.is_on_chip()
    }

    /// Whether a kernel body may load or store elements of a ref in this space.
    pub const fn body_accessible(&self) -> bool {
        self.is_on_chip()
    }

    pub const fn default_limit(&self) -> Option<usize> {
        match self {
            Self::Vmem => Some(Self::DEFAULT_VMEM_LIMIT),
            Self::Smem => Some(Self::DEFAULT_SMEM_LIMIT),
            Self::Any | Self::Hbm => None,
        }
    }

    pub(crate) const fn index(&self) -> usize {
        match self {
            Self::Any => 0,
            Self::Hbm => 1,
            Self::Vmem => 2,
            Self::Smem => 3,
        }
    }
}
