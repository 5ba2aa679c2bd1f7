//! Kernel calls: validation, lowering and dispatch.
//!
//! ```ignore
//! let call = KernelCall::builder()
//!     .body(kernel(|_ctx, refs| {
//!         let x = refs.input(0).read_all::<f32>()?;
//!         refs.output(0).write_all(&x.iter().map(|v| v + 1.0).collect::<Vec<_>>())?;
//!         Ok(())
//!     }))
//!     .out_shape(vec![ShapeDtype::new(&[8, 128], ScalarDType::Float32)])
//!     .build();
//! let out = call.call(&device, &[x])?.throw()?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use bon::bon;
use snafu::ensure;
use tessel_device::{AccessCounts, Buffer, Device, MemorySpace, Mesh};

use crate::block_spec::ShapeDtype;
use crate::check::CheckFailure;
use crate::config::{CompilerParams, CostEstimate};
use crate::driver::{self, DeviceRun};
use crate::error::*;
use crate::grid_spec::{GridSpec, Resolved};
use crate::kernel::KernelBody;
use crate::pipeline::window_slots;
use crate::scope::{Allocation, Effect, EffectSet};

/// Smallest internal scratch reservation the lowered program accepts.
pub const MIN_INTERNAL_SCRATCH_BYTES: usize = 4096;

/// A kernel body bound to its grid spec, output shapes and parameters.
#[derive(Clone)]
pub struct KernelCall {
    body: Arc<dyn KernelBody>,
    out_shape: Vec<ShapeDtype>,
    grid_spec: GridSpec,
    input_output_aliases: BTreeMap<usize, usize>,
    compiler_params: CompilerParams,
    name: String,
}

impl std::fmt::Debug for KernelCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelCall")
            .field("name", &self.name)
            .field("out_shape", &self.out_shape)
            .field("grid_spec", &self.grid_spec)
            .field("input_output_aliases", &self.input_output_aliases)
            .field("compiler_params", &self.compiler_params)
            .finish_non_exhaustive()
    }
}

#[bon]
impl KernelCall {
    /// `input_output_aliases` maps an input index (counting scalar-prefetch
    /// operands) to the output that reuses its buffer.
    #[builder]
    pub fn new(
        body: Arc<dyn KernelBody>,
        out_shape: Vec<ShapeDtype>,
        #[builder(default)] grid_spec: GridSpec,
        #[builder(default)] input_output_aliases: BTreeMap<usize, usize>,
        #[builder(default)] compiler_params: CompilerParams,
        #[builder(default = "kernel".to_string(), into)] name: String,
    ) -> Self {
        Self { body, out_shape, grid_spec, input_output_aliases, compiler_params, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid_spec(&self) -> &GridSpec {
        &self.grid_spec
    }

    pub fn compiler_params(&self) -> &CompilerParams {
        &self.compiler_params
    }

    /// Validate the call for `inputs` and compute its on-chip footprint.
    ///
    /// Every construction and resource-limit error surfaces here, before any
    /// step runs or any buffer is allocated.
    #[tracing::instrument(skip_all, fields(kernel = %self.name))]
    pub fn lower(&self, inputs: &[ShapeDtype]) -> Result<Lowered> {
        let spec = &self.grid_spec;
        let params = &self.compiler_params;
        let rank = spec.grid.rank();

        if let Some(semantics) = &params.dimension_semantics {
            ensure!(semantics.len() == rank, DimensionSemanticsRankSnafu { expected: rank, actual: semantics.len() });
        }
        if !spec.in_specs.is_empty() {
            let expected = spec.num_scalar_prefetch + spec.in_specs.len();
            ensure!(inputs.len() == expected, OperandCountSnafu { kind: "inputs", expected, actual: inputs.len() });
        }
        let resolved = spec.resolve(inputs, &self.out_shape)?;
        self.check_aliases(inputs)?;

        if let Some(requested) = params.internal_scratch_in_bytes {
            ensure!(
                requested >= MIN_INTERNAL_SCRATCH_BYTES,
                InsufficientInternalScratchSnafu { requested, minimum: MIN_INTERNAL_SCRATCH_BYTES }
            );
        }
        if params.num_cores > 1 {
            driver::megacore_axis(params, rank)?;
        }

        let slots = window_slots(spec.grid.padded_volume());
        let memory = MemoryAnalysis::compute(
            &resolved,
            &inputs[..spec.num_scalar_prefetch],
            &spec.scratch_shapes,
            slots,
            params.internal_scratch_in_bytes,
            self.alias_bytes(inputs),
        );
        for (space, requested, limit) in [
            (MemorySpace::Vmem, memory.vmem_bytes, params.vmem_limit()),
            (MemorySpace::Smem, memory.smem_bytes, params.smem_limit()),
        ] {
            ensure!(requested <= limit, MemoryLimitExceededSnafu { space, requested, limit });
        }
        tracing::debug!(vmem = memory.vmem_bytes, smem = memory.smem_bytes, slots, "lowered");

        Ok(Lowered {
            name: self.name.clone(),
            params: params.clone(),
            resolved,
            num_scalar_prefetch: spec.num_scalar_prefetch,
            scratch_shapes: spec.scratch_shapes.clone(),
            window_slots: slots,
            aliases: self.input_output_aliases.clone(),
            memory,
        })
    }

    fn check_aliases(&self, inputs: &[ShapeDtype]) -> Result<()> {
        let mut claimed = BTreeMap::new();
        for (&input, &output) in &self.input_output_aliases {
            let invalid = |reason| InvalidAliasSnafu { input, output, reason };
            ensure!(input < inputs.len(), invalid("input index out of range"));
            ensure!(output < self.out_shape.len(), invalid("output index out of range"));
            ensure!(input >= self.grid_spec.num_scalar_prefetch, invalid("scalar prefetch operands cannot be aliased"));
            ensure!(claimed.insert(output, input).is_none(), invalid("output is already aliased"));

            let (src, dst) = (&inputs[input], &self.out_shape[output]);
            ensure!(
                src.bytes() == dst.bytes(),
                AliasSizeMismatchSnafu { input, output, input_bytes: src.bytes(), output_bytes: dst.bytes() }
            );
            ensure!(src.dtype == dst.dtype, invalid("element types differ"));
        }
        Ok(())
    }

    fn alias_bytes(&self, inputs: &[ShapeDtype]) -> usize {
        self.input_output_aliases.keys().filter_map(|&input| inputs.get(input)).map(ShapeDtype::bytes).sum()
    }

    /// Run on `device` with a grid that has no dynamic axes.
    pub fn call(&self, device: &Device, inputs: &[Buffer]) -> Result<CallOutput> {
        self.call_with(device, inputs, &[])
    }

    /// Run on `device`, binding the grid's dynamic axes to `dynamic` in axis order.
    pub fn call_with(&self, device: &Device, inputs: &[Buffer], dynamic: &[u64]) -> Result<CallOutput> {
        let mesh = Mesh::single(device.clone());
        let mut outputs = self.call_on_mesh(&mesh, &[inputs.to_vec()], dynamic)?;
        Ok(outputs.remove(0))
    }

    /// Run the call on every device of `mesh` concurrently; `inputs[d]` are device `d`'s operands.
    #[tracing::instrument(skip_all, fields(kernel = %self.name, devices = mesh.num_devices()))]
    pub fn call_on_mesh(&self, mesh: &Mesh, inputs: &[Vec<Buffer>], dynamic: &[u64]) -> Result<Vec<CallOutput>> {
        ensure!(
            inputs.len() == mesh.num_devices(),
            OperandCountSnafu { kind: "per-device input lists", expected: mesh.num_devices(), actual: inputs.len() }
        );
        let grid = self.grid_spec.grid.bind(dynamic)?;

        let mut lowerings = inputs
            .iter()
            .map(|operands| self.lower(&operands.iter().map(ShapeDtype::of).collect::<Vec<_>>()))
            .collect::<Result<Vec<_>>>()?;
        if lowerings.is_empty() {
            return Ok(Vec::new());
        }
        let lowered = lowerings.swap_remove(0);
        let prepared = mesh
            .devices()
            .iter()
            .zip(inputs)
            .map(|(device, operands)| Ok((operands.clone(), self.allocate_outputs(device, operands)?)))
            .collect::<Result<Vec<_>>>()?;

        let before: Vec<Vec<_>> =
            prepared.iter().map(|(ins, outs)| ins.iter().chain(outs).map(Buffer::access_counts).collect()).collect();

        mesh.clear();
        let runs: Vec<Result<DeviceRun>> = if grid.num_steps() == 0 {
            tracing::debug!("empty grid, outputs left untouched");
            prepared.iter().map(|_| Ok(DeviceRun::default())).collect()
        } else if prepared.len() == 1 {
            let (ins, outs) = &prepared[0];
            vec![driver::run_device(&lowered, &*self.body, mesh, 0, &grid, ins, outs)]
        } else {
            std::thread::scope(|s| {
                let lowered = &lowered;
                let grid = &grid;
                let handles: Vec<_> = prepared
                    .iter()
                    .enumerate()
                    .map(|(device, (ins, outs))| {
                        s.spawn(move || driver::run_device(lowered, &*self.body, mesh, device, grid, ins, outs))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                    .collect()
            })
        };
        mesh.clear();

        let mut results = Vec::with_capacity(runs.len());
        for ((run, (ins, outs)), before) in runs.into_iter().zip(prepared).zip(before) {
            let run = run?;
            let (input_before, output_before) = before.split_at(ins.len());
            let effects = |buffers: &[Buffer], before: &[AccessCounts]| {
                EffectSet::new(
                    buffers.iter().zip(before).map(|(b, before)| Effect::from_counts(b.access_counts().since(before))).collect(),
                )
            };
            results.push(CallOutput {
                input_effects: effects(&ins, input_before),
                output_effects: effects(&outs, output_before),
                outputs: outs,
                failures: run.failures,
                steps: run.steps,
            });
        }
        Ok(results)
    }

    /// Output buffers in HBM; aliased outputs reuse their input's buffer.
    fn allocate_outputs(&self, device: &Device, inputs: &[Buffer]) -> Result<Vec<Buffer>> {
        let aliased: BTreeMap<usize, usize> = self.input_output_aliases.iter().map(|(&i, &o)| (o, i)).collect();
        self.out_shape
            .iter()
            .enumerate()
            .map(|(j, out)| match aliased.get(&j) {
                Some(&input) => Ok(inputs[input].clone()),
                None => Ok(device.alloc(MemorySpace::Hbm, out.dtype, &out.shape)?),
            })
            .collect()
    }
}

// ============================================================================
// LOWERED PROGRAM
// ============================================================================

/// On-chip footprint of a lowered call, per core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryAnalysis {
    /// Window slots, VMEM scratch and the internal scratch reservation.
    pub vmem_bytes: usize,
    /// Scalar-prefetch copies, SMEM windows and SMEM scratch.
    pub smem_bytes: usize,
    /// Bytes of outputs that reuse an input buffer instead of allocating.
    pub alias_bytes: usize,
    pub internal_scratch_bytes: usize,
}

impl MemoryAnalysis {
    fn compute(
        resolved: &Resolved,
        prefetch: &[ShapeDtype],
        scratch: &[Allocation],
        slots: usize,
        internal_scratch: Option<usize>,
        alias_bytes: usize,
    ) -> Self {
        let mut analysis =
            Self { alias_bytes, internal_scratch_bytes: internal_scratch.unwrap_or(0), ..Self::default() };
        analysis.vmem_bytes += analysis.internal_scratch_bytes;
        analysis.smem_bytes += prefetch.iter().map(ShapeDtype::bytes).sum::<usize>();

        let mut charge = |space: MemorySpace, bytes: usize| match space {
            MemorySpace::Vmem => analysis.vmem_bytes += bytes,
            MemorySpace::Smem => analysis.smem_bytes += bytes,
            MemorySpace::Any | MemorySpace::Hbm => {}
        };
        for block in resolved.inputs.iter().chain(&resolved.outputs) {
            charge(block.space, block.window_bytes() * slots);
        }
        for allocation in scratch {
            if let Some(space) = allocation.space() {
                charge(space, allocation.bytes());
            }
        }
        analysis
    }
}

/// A validated call, ready to run.
#[derive(Debug, Clone)]
pub struct Lowered {
    pub(crate) name: String,
    pub(crate) params: CompilerParams,
    pub(crate) resolved: Resolved,
    pub(crate) num_scalar_prefetch: usize,
    pub(crate) scratch_shapes: Vec<Allocation>,
    pub(crate) window_slots: usize,
    pub(crate) aliases: BTreeMap<usize, usize>,
    memory: MemoryAnalysis,
}

impl Lowered {
    /// Cost hints as given, for the scheduler.
    pub fn cost_analysis(&self) -> Option<CostEstimate> {
        self.params.cost_estimate
    }

    pub fn memory_analysis(&self) -> MemoryAnalysis {
        self.memory
    }

    pub(crate) fn is_aliased_input(&self, input: usize) -> bool {
        self.aliases.contains_key(&input)
    }

    pub(crate) fn is_aliased_output(&self, output: usize) -> bool {
        self.aliases.values().any(|&o| o == output)
    }
}

// ============================================================================
// CALL OUTPUT
// ============================================================================

/// Outputs of a call on one device, with the check failures of its steps.
#[derive(Debug, Clone)]
pub struct CallOutput {
    pub outputs: Vec<Buffer>,
    /// In step order.
    pub failures: Vec<CheckFailure>,
    /// How the call accessed each input buffer, including DMA traffic.
    pub input_effects: EffectSet,
    pub output_effects: EffectSet,
    /// Body invocations.
    pub steps: u64,
}

impl CallOutput {
    pub fn first_failure(&self) -> Option<&CheckFailure> {
        self.failures.first()
    }

    /// The outputs, or the first check failure as an error.
    pub fn throw(self) -> Result<Vec<Buffer>> {
        match self.failures.into_iter().next() {
            Some(failure) => CheckFailedSnafu { failure }.fail(),
            None => Ok(self.outputs),
        }
    }
}
