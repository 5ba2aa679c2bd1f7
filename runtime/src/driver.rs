//! Execution driver.
//!
//! Runs a lowered call over its grid on one device: per core it stages the
//! scalar-prefetch operands, allocates grid-level scratch and window slots,
//! then walks its share of the grid, staging windows in, invoking the body and
//! flushing finished output windows.

use std::sync::Arc;

use snafu::{OptionExt, ensure};
use tessel_device::{Allocator, BudgetAllocator, Buffer, CpuAllocator, MemorySpace, Mesh, Resource, SlotId};

use crate::block_spec::{IndexArgs, ResolvedBlock, Window};
use crate::call::Lowered;
use crate::check::{CheckFailure, CheckKind};
use crate::config::{CompilerParams, DimensionSemantics};
use crate::error::*;
use crate::grid::{BoundGrid, CoreRange, GridContext};
use crate::kernel::{CoreEnv, KernelBody, KernelContext, KernelRefs};
use crate::pipeline::{InputPipeline, OutputPipeline};
use crate::{prefetch, scope};

/// Outcome of running the grid on one device.
#[derive(Debug, Default)]
pub(crate) struct DeviceRun {
    pub failures: Vec<CheckFailure>,
    /// Body invocations across all cores.
    pub steps: u64,
}

/// Grid axis split across cores.
pub(crate) fn megacore_axis(params: &CompilerParams, rank: usize) -> Result<usize> {
    match params.megacore_axis {
        Some(axis) => {
            ensure!(axis < rank, InvalidMegacoreAxisSnafu { axis: Some(axis), reason: "axis is out of range" });
            ensure!(
                params.semantics(axis) == DimensionSemantics::Parallel,
                InvalidMegacoreAxisSnafu { axis: Some(axis), reason: "axis is marked arbitrary" }
            );
            Ok(axis)
        }
        None => (0..rank)
            .find(|&axis| params.semantics(axis) == DimensionSemantics::Parallel)
            .context(InvalidMegacoreAxisSnafu { axis: None, reason: "grid has no parallel axis" }),
    }
}

fn core_ranges(params: &CompilerParams, grid: &BoundGrid) -> Result<Vec<Option<CoreRange>>> {
    if params.num_cores <= 1 {
        return Ok(vec![None]);
    }
    let axis = megacore_axis(params, grid.rank())?;
    Ok(grid.split(axis, params.num_cores).into_iter().map(Some).collect())
}

/// On-chip budget of one core; the internal scratch reservation comes out of VMEM.
fn core_allocator(params: &CompilerParams) -> Arc<dyn Allocator> {
    let vmem = params.vmem_limit().saturating_sub(params.internal_scratch_in_bytes.unwrap_or(0));
    Arc::new(
        BudgetAllocator::new(Box::new(CpuAllocator))
            .with_limit(MemorySpace::Vmem, Some(vmem))
            .with_limit(MemorySpace::Smem, Some(params.smem_limit())),
    )
}

/// Run every core of `device` and merge their failures in step order.
#[tracing::instrument(skip_all, fields(kernel = %lowered.name, device = device, steps = grid.num_steps()))]
pub(crate) fn run_device(
    lowered: &Lowered,
    body: &dyn KernelBody,
    mesh: &Mesh,
    device: usize,
    grid: &BoundGrid,
    inputs: &[Buffer],
    outputs: &[Buffer],
) -> Result<DeviceRun> {
    let ranges = core_ranges(&lowered.params, grid)?;
    let num_cores = ranges.len();
    let run = |core: usize, range: Option<CoreRange>| {
        let core = CoreRunner { lowered, body, mesh, device, core, num_cores, grid, inputs, outputs };
        core.run(range)
    };

    let runs: Vec<Result<DeviceRun>> = if num_cores == 1 {
        vec![run(0, ranges[0])]
    } else {
        std::thread::scope(|s| {
            let handles: Vec<_> = ranges
                .iter()
                .enumerate()
                .map(|(core, range)| {
                    let range = *range;
                    s.spawn(move || run(core, range))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        })
    };

    let mut merged = DeviceRun::default();
    for run in runs {
        let run = run?;
        merged.steps += run.steps;
        merged.failures.extend(run.failures);
    }
    merged.failures.sort_by_key(|failure| failure.step);
    tracing::debug!(device, steps = merged.steps, failures = merged.failures.len(), "device finished");
    Ok(merged)
}

/// Windows of every windowed input and output at one coordinate.
struct StepWindows {
    inputs: Vec<Window>,
    outputs: Vec<Window>,
}

struct CoreRunner<'a> {
    lowered: &'a Lowered,
    body: &'a dyn KernelBody,
    mesh: &'a Mesh,
    device: usize,
    core: usize,
    num_cores: usize,
    grid: &'a BoundGrid,
    inputs: &'a [Buffer],
    outputs: &'a [Buffer],
}

impl CoreRunner<'_> {
    fn run(&self, range: Option<CoreRange>) -> Result<DeviceRun> {
        let lowered = self.lowered;
        let params = &lowered.params;
        let timeout = params.deadlock_timeout;
        let env = CoreEnv {
            mesh: self.mesh,
            device: self.device,
            core: self.core,
            num_cores: self.num_cores,
            params,
            allocator: core_allocator(params),
        };

        let mut coords = self.grid.iter(range).peekable();
        let Some(first) = coords.peek().cloned() else {
            tracing::debug!(core = self.core, "no steps assigned");
            return Ok(DeviceRun::default());
        };

        let num_prefetch = lowered.num_scalar_prefetch;
        let prefetch = prefetch::stage(&env, &self.inputs[..num_prefetch])?;

        let scratch = scope::allocate(&env.allocator, &lowered.scratch_shapes, timeout)?;
        for (i, handle) in scratch.iter().enumerate() {
            self.mesh.register(self.device, self.core, SlotId::Scratch(i), handle.resource())?;
        }

        let windows_at = |coord: &[u64]| -> Result<StepWindows> {
            let args = IndexArgs::new(coord, &prefetch);
            let of = |blocks: &[ResolvedBlock]| blocks.iter().map(|block| block.window(&args)).collect::<Result<Vec<_>>>();
            Ok(StepWindows { inputs: of(&lowered.resolved.inputs)?, outputs: of(&lowered.resolved.outputs)? })
        };

        // Probe the index maps at the first coordinate before any slot is allocated.
        let mut current = windows_at(&first)?;

        let mut ins = lowered
            .resolved
            .inputs
            .iter()
            .zip(&self.inputs[num_prefetch..])
            .enumerate()
            .map(|(i, (block, operand))| {
                let aliased = lowered.is_aliased_input(num_prefetch + i);
                let elide = params.elide_redundant_copies;
                InputPipeline::new(block, operand.clone(), lowered.window_slots, aliased, elide, &env.allocator, timeout)
            })
            .collect::<Result<Vec<_>>>()?;
        let mut outs = lowered
            .resolved
            .outputs
            .iter()
            .zip(self.outputs)
            .enumerate()
            .map(|(j, (block, operand))| {
                let aliased = lowered.is_aliased_output(j);
                OutputPipeline::new(block, operand.clone(), lowered.window_slots, aliased, &env.allocator, timeout)
            })
            .collect::<Result<Vec<_>>>()?;

        let mut failures = Vec::new();
        let mut local = 0u64;
        while let Some(coord) = coords.next() {
            let grid_ctx = GridContext::new(self.grid, coord);
            let next = coords.peek().map(|coord| windows_at(coord)).transpose()?;

            let blocks = lowered.resolved.inputs.iter().chain(&lowered.resolved.outputs);
            for (block, window) in blocks.zip(current.inputs.iter().chain(&current.outputs)) {
                if !window.in_bounds {
                    let message = format!(
                        "{}: window at {:?} of shape {:?} lies outside array of shape {:?}",
                        block.operand, window.start, window.shape, block.array.shape
                    );
                    let failure = CheckFailure::at(CheckKind::OutOfBoundsWindow, &grid_ctx, self.device, self.core, message);
                    env.report(failure, &mut failures);
                }
            }

            let in_refs = ins
                .iter_mut()
                .zip(&current.inputs)
                .map(|(pipeline, window)| pipeline.acquire(window, local))
                .collect::<Result<Vec<_>>>()?;
            let out_refs = outs
                .iter_mut()
                .zip(&current.outputs)
                .map(|(pipeline, window)| pipeline.acquire(window, local))
                .collect::<Result<Vec<_>>>()?;
            self.register_windows(&ins, &outs)?;

            if let Some(next) = &next {
                for (pipeline, window) in ins.iter_mut().zip(&next.inputs) {
                    pipeline.prefetch(window, local + 1)?;
                }
            }

            let refs = KernelRefs { prefetch: prefetch.clone(), inputs: in_refs, outputs: out_refs, scratch: scratch.clone() };
            tracing::trace!(core = self.core, step = grid_ctx.step(), coord = ?grid_ctx.coord(), "running body");
            let mut ctx = KernelContext::new(&env, grid_ctx);
            self.body.run(&mut ctx, &refs)?;
            failures.extend(ctx.into_failures());

            for (j, pipeline) in outs.iter_mut().enumerate() {
                pipeline.finish_step(next.as_ref().map(|next| &next.outputs[j]))?;
            }
            if let Some(next) = next {
                current = next;
            }
            local += 1;
        }

        ins.iter_mut().try_for_each(InputPipeline::finish)?;
        outs.iter_mut().try_for_each(OutputPipeline::finish)?;
        scope::drain(&scratch);
        scope::check_balance(&scratch)?;
        tracing::debug!(core = self.core, steps = local, "core finished");
        Ok(DeviceRun { failures, steps: local })
    }

    /// Publish this step's window buffers under their operand slots.
    fn register_windows(&self, ins: &[InputPipeline], outs: &[OutputPipeline]) -> Result<()> {
        let num_prefetch = self.lowered.num_scalar_prefetch;
        for (i, pipeline) in ins.iter().enumerate() {
            let resource = Resource::Buffer(pipeline.current_buffer().clone());
            self.mesh.register(self.device, self.core, SlotId::Input(num_prefetch + i), resource)?;
        }
        for (j, pipeline) in outs.iter().enumerate() {
            let resource = Resource::Buffer(pipeline.current_buffer().clone());
            self.mesh.register(self.device, self.core, SlotId::Output(j), resource)?;
        }
        Ok(())
    }
}
