use std::sync::Arc;
use std::time::Duration;

use smallvec::smallvec;
use tessel_device::{Buffer, DeviceId, Mesh, Semaphore};
use tessel_dtype::SemaphoreKind;

use crate::test::helpers::{f32s, filled, recorder};
use crate::{Allocation, BlockSpec, CallOutput, CompilerParams, Error, GridSpec, KernelBody, KernelCall, Result, kernel};

fn params() -> CompilerParams {
    CompilerParams::builder().deadlock_timeout(Duration::from_secs(5)).collective_id(0).build()
}

/// A call that hands its `ANY`-space operand to `body` along with two DMA semaphores of grid scratch.
fn exchange_call(body: Arc<dyn KernelBody>) -> KernelCall {
    KernelCall::builder()
        .body(body)
        .out_shape(vec![f32s(&[8, 128])])
        .grid_spec(
            GridSpec::builder()
                .in_specs(vec![BlockSpec::any()])
                .out_specs(vec![BlockSpec::any()])
                .scratch_shapes(vec![Allocation::dma_semaphore(), Allocation::dma_semaphore()])
                .build(),
        )
        .compiler_params(params())
        .build()
}

/// Device `d` gets an `8x128` input filled with `d`.
fn run_on_mesh(mesh: &Mesh, call: &KernelCall) -> Result<Vec<CallOutput>> {
    let inputs: Vec<Vec<Buffer>> =
        mesh.devices().iter().enumerate().map(|(d, device)| vec![filled(device, &[8, 128], d as f32)]).collect();
    call.call_on_mesh(mesh, &inputs, &[])
}

fn first_value(output: &CallOutput) -> f32 {
    let values = output.outputs[0].to_vec::<f32>().unwrap();
    assert!(values.iter().all(|&v| v == values[0]));
    values[0]
}

#[test]
fn test_ring_permute() {
    let mesh = Mesh::new(&[4]);
    let call = exchange_call(kernel(|ctx, refs| {
        let right = (ctx.device_id() + 1) % ctx.num_devices();
        let (send, recv) = (refs.scratch.semaphore(0)?, refs.scratch.semaphore(1)?);
        ctx.async_remote_copy(refs.input(0), refs.output(0), send, recv, right)?.wait()?;
        Ok(())
    }));

    let outputs = run_on_mesh(&mesh, &call).unwrap();
    let received: Vec<f32> = outputs.iter().map(first_value).collect();
    assert_eq!(received, [3.0, 0.0, 1.0, 2.0]);
    assert!(outputs.iter().all(|out| out.failures.is_empty()));
}

#[test]
fn test_exchange_by_mesh_coordinates() {
    let mesh = Mesh::new(&[2, 2]);
    let call = exchange_call(kernel(|ctx, refs| {
        let coords = ctx.device_coords();
        let peer = DeviceId::Mesh(smallvec![coords[0], 1 - coords[1]]);
        let (send, recv) = (refs.scratch.semaphore(0)?, refs.scratch.semaphore(1)?);
        let mut copy = ctx.make_async_remote_copy(refs.input(0), refs.output(0), send, recv, peer)?;
        copy.start()?;
        copy.wait_send()?;
        copy.wait_recv()?;
        Ok(())
    }));

    let outputs = run_on_mesh(&mesh, &call).unwrap();
    let received: Vec<f32> = outputs.iter().map(first_value).collect();
    assert_eq!(received, [1.0, 0.0, 3.0, 2.0]);
}

#[test]
fn test_barrier_orders_devices() {
    let mesh = Mesh::new(&[2]);
    let (log, sink) = recorder();
    let call = KernelCall::builder()
        .body(kernel(move |ctx, _refs| {
            let me = ctx.device_id();
            if me == 0 {
                sink.lock().push("before barrier");
            }
            let barrier = ctx.barrier_semaphore()?;
            ctx.signal_remote(&barrier, 1, 1 - me)?;
            barrier.wait(1)?;
            if me == 1 {
                sink.lock().push("after barrier");
            }
            Ok(())
        }))
        .out_shape(vec![])
        .compiler_params(params())
        .build();

    let outputs = call.call_on_mesh(&mesh, &[vec![], vec![]], &[]).unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(*log.lock(), vec!["before barrier", "after barrier"]);
}

#[test]
fn test_barrier_needs_collective_id() {
    let mesh = Mesh::new(&[2]);
    let call = KernelCall::builder()
        .body(kernel(|ctx, _refs| ctx.barrier_semaphore().map(|_| ())))
        .out_shape(vec![])
        .build();

    let result = call.call_on_mesh(&mesh, &[vec![], vec![]], &[]);
    assert!(matches!(result, Err(Error::Device { source: tessel_device::Error::MissingCollectiveId })));
}

#[test]
fn test_invalid_device() {
    let mesh = Mesh::new(&[2]);
    let call = KernelCall::builder()
        .body(kernel(|ctx, _refs| {
            let barrier = ctx.barrier_semaphore()?;
            ctx.signal_remote(&barrier, 1, 7usize)
        }))
        .out_shape(vec![])
        .compiler_params(params())
        .build();

    let result = call.call_on_mesh(&mesh, &[vec![], vec![]], &[]);
    assert!(matches!(result, Err(Error::Device { source: tessel_device::Error::InvalidDevice { .. } })));
}

#[test]
fn test_unregistered_semaphore_is_not_symmetric() {
    let device = tessel_device::Device::cpu();
    let call = KernelCall::builder()
        .body(kernel(|ctx, _refs| {
            let local = Semaphore::scalar(SemaphoreKind::Regular).view();
            ctx.signal_remote(&local, 1, 0usize)
        }))
        .out_shape(vec![])
        .build();

    let result = call.call(&device, &[]);
    assert!(matches!(result, Err(Error::NotSymmetric { .. })));
}

#[test]
fn test_mesh_inputs_per_device() {
    let mesh = Mesh::new(&[2]);
    let call = exchange_call(kernel(|_ctx, _refs| Ok(())));
    let input = filled(&mesh.devices()[0], &[8, 128], 1.0);
    let result = call.call_on_mesh(&mesh, &[vec![input]], &[]);

    assert!(matches!(result, Err(Error::OperandCount { kind: "per-device input lists", expected: 2, actual: 1 })));
}
