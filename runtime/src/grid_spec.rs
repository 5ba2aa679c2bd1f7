//! Grid spec: the grid plus one block spec per operand.

use bon::bon;
use snafu::ensure;

use crate::block_spec::{BlockSpec, ResolvedBlock, ShapeDtype};
use crate::error::*;
use crate::grid::Grid;
use crate::scope::Allocation;

/// Iteration space, operand windows and grid-level scratch of a kernel call.
///
/// The first `num_scalar_prefetch` call inputs are scalar-prefetch operands:
/// they are copied to SMEM before step 0, passed to every index map and never
/// windowed. `in_specs` cover the remaining inputs. Empty spec lists mean
/// "whole operand in VMEM" for every operand.
#[derive(Debug, Clone, Default)]
pub struct GridSpec {
    pub grid: Grid,
    pub num_scalar_prefetch: usize,
    pub in_specs: Vec<BlockSpec>,
    pub out_specs: Vec<BlockSpec>,
    /// Allocated once per core, live across every step.
    pub scratch_shapes: Vec<Allocation>,
}

#[bon]
impl GridSpec {
    #[builder]
    pub fn new(
        #[builder(default)] grid: Grid,
        #[builder(default)] num_scalar_prefetch: usize,
        #[builder(default)] in_specs: Vec<BlockSpec>,
        #[builder(default)] out_specs: Vec<BlockSpec>,
        #[builder(default)] scratch_shapes: Vec<Allocation>,
    ) -> Self {
        Self { grid, num_scalar_prefetch, in_specs, out_specs, scratch_shapes }
    }

    /// Arguments every index map takes.
    pub fn index_map_arity(&self) -> usize {
        self.grid.rank() + self.num_scalar_prefetch
    }

    /// Check the specs against operand shapes.
    ///
    /// `inputs` includes the scalar-prefetch operands.
    pub(crate) fn resolve(&self, inputs: &[ShapeDtype], outputs: &[ShapeDtype]) -> Result<Resolved> {
        ensure!(
            inputs.len() >= self.num_scalar_prefetch,
            OperandCountSnafu { kind: "scalar prefetch operands", expected: self.num_scalar_prefetch, actual: inputs.len() }
        );
        let windowed = &inputs[self.num_scalar_prefetch..];
        let arity = self.index_map_arity();

        let resolve_all = |specs: &[BlockSpec], arrays: &[ShapeDtype], kind: &'static str| -> Result<Vec<ResolvedBlock>> {
            if specs.is_empty() {
                return arrays
                    .iter()
                    .enumerate()
                    .map(|(i, array)| ResolvedBlock::resolve(&BlockSpec::default(), format!("{kind} {i}"), array, arity))
                    .collect();
            }
            ensure!(specs.len() == arrays.len(), OperandCountSnafu { kind, expected: specs.len(), actual: arrays.len() });
            specs
                .iter()
                .zip(arrays)
                .enumerate()
                .map(|(i, (spec, array))| ResolvedBlock::resolve(spec, format!("{kind} {i}"), array, arity))
                .collect()
        };

        Ok(Resolved { inputs: resolve_all(&self.in_specs, windowed, "inputs")?, outputs: resolve_all(&self.out_specs, outputs, "outputs")? })
    }
}

/// Block specs of every windowed operand, checked.
#[derive(Debug, Clone)]
pub(crate) struct Resolved {
    pub inputs: Vec<ResolvedBlock>,
    pub outputs: Vec<ResolvedBlock>,
}
