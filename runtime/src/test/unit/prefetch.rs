use tessel_device::{Device, MemorySpace};

use crate::test::helpers::{arange, f32s, recorder, row_blocks};
use crate::{BlockSpec, CheckKind, Error, Grid, GridSpec, IndexMap, KernelCall, kernel};

/// Row-block gather: output block `i` is input block `order[i]`.
fn gather_call(steps: u64) -> KernelCall {
    KernelCall::builder()
        .body(kernel(|_ctx, refs| Ok(refs.output(0).write_all(&refs.input(0).read_all::<f32>()?)?)))
        .out_shape(vec![f32s(&[steps as usize * 8, 128])])
        .grid_spec(
            GridSpec::builder()
                .grid(Grid::new([steps]))
                .num_scalar_prefetch(1)
                .in_specs(vec![BlockSpec::blocked(
                    [8usize, 128],
                    IndexMap::new(2, |args| Ok(vec![args.scalar(0, &[args.program_id(0)? as usize])?, 0])),
                )])
                .out_specs(vec![row_blocks(8, 128, 2)])
                .build(),
        )
        .build()
}

#[test]
fn test_gather_by_prefetched_indices() {
    let device = Device::cpu();
    let order: [i32; 8] = [4, 3, 2, 5, 3, 5, 2, 7];
    let indices = device.buffer_from(MemorySpace::Hbm, &[8], &order).unwrap();
    let x = arange(&device, &[64, 128]);

    let out = gather_call(8).call(&device, &[indices, x.clone()]).unwrap();
    assert!(out.failures.is_empty());

    let source = x.to_vec::<f32>().unwrap();
    let expected: Vec<f32> = order.iter().flat_map(|&block| source[block as usize * 1024..][..1024].to_vec()).collect();
    assert_eq!(out.outputs[0].to_vec::<f32>().unwrap(), expected);
}

#[test]
fn test_out_of_range_prefetched_indices_are_reported() {
    let device = Device::cpu();
    let order: [i64; 4] = [0, i64::MAX / 4, -1, 1];
    let indices = device.buffer_from(MemorySpace::Hbm, &[4], &order).unwrap();
    let x = arange(&device, &[16, 128]);

    let out = gather_call(4).call(&device, &[indices, x.clone()]).unwrap();
    assert_eq!(out.steps, 4);
    let failed: Vec<_> = out.failures.iter().map(|failure| (failure.kind, failure.step)).collect();
    assert_eq!(failed, vec![(CheckKind::OutOfBoundsWindow, 1), (CheckKind::OutOfBoundsWindow, 2)]);

    // Stray windows read zeros; the steps around them still gather.
    let source = x.to_vec::<f32>().unwrap();
    let result = out.outputs[0].to_vec::<f32>().unwrap();
    assert_eq!(result[..1024], source[..1024]);
    assert!(result[1024..3072].iter().all(|&v| v == 0.0));
    assert_eq!(result[3072..], source[1024..]);
}

#[test]
fn test_huge_unsigned_index_is_out_of_bounds() {
    let device = Device::cpu();
    let indices = device.buffer_from(MemorySpace::Hbm, &[2], &[u64::MAX, 0]).unwrap();
    let x = arange(&device, &[16, 128]);

    let out = gather_call(2).call(&device, &[indices, x]).unwrap();
    assert_eq!(out.failures.len(), 1);
    assert_eq!(out.failures[0].kind, CheckKind::OutOfBoundsWindow);
    assert_eq!(out.failures[0].step, 0);
}

#[test]
fn test_call_from_busy_rayon_pool() {
    let device = Device::cpu();
    let indices = device.buffer_from(MemorySpace::Hbm, &[2], &[1i32, 0]).unwrap();
    let x = arange(&device, &[16, 128]);
    let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();

    let out = pool.install(|| gather_call(2).call(&device, &[indices, x.clone()])).unwrap();
    let source = x.to_vec::<f32>().unwrap();
    let expected: Vec<f32> = source[1024..].iter().chain(&source[..1024]).copied().collect();
    assert_eq!(out.outputs[0].to_vec::<f32>().unwrap(), expected);
}

#[test]
fn test_prefetch_visible_to_body() {
    let device = Device::cpu();
    let table = device.buffer_from(MemorySpace::Hbm, &[3], &[7i64, -1, 42]).unwrap();
    let (seen, sink) = recorder();
    let call = KernelCall::builder()
        .body(kernel(move |ctx, refs| {
            let pid = ctx.program_id(0)? as usize;
            assert_eq!(refs.prefetch(0).space(), MemorySpace::Smem);
            sink.lock().push(refs.prefetch(0).load::<i64>(&[pid])?);
            Ok(())
        }))
        .out_shape(vec![])
        .grid_spec(GridSpec::builder().grid(Grid::new([3u64])).num_scalar_prefetch(1).build())
        .build();

    call.call(&device, &[table]).unwrap();
    assert_eq!(*seen.lock(), vec![7, -1, 42]);
}

#[test]
fn test_float_prefetch_cannot_index() {
    let device = Device::cpu();
    let indices = device.buffer_from(MemorySpace::Hbm, &[2], &[0.0f32, 1.0]).unwrap();
    let x = arange(&device, &[16, 128]);

    let result = gather_call(2).call(&device, &[indices, x]);
    assert!(matches!(result, Err(Error::Device { source: tessel_device::Error::NotAnIndex { .. } })));
}

#[test]
fn test_missing_prefetch_operand() {
    let call = KernelCall::builder()
        .body(kernel(|_ctx, _refs| Ok(())))
        .out_shape(vec![])
        .grid_spec(GridSpec::builder().num_scalar_prefetch(2).build())
        .build();

    assert!(matches!(
        call.lower(&[f32s(&[4])]),
        Err(Error::OperandCount { kind: "scalar prefetch operands", expected: 2, actual: 1 })
    ));
}
