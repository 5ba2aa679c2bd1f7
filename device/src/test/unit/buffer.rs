use std::sync::Arc;

use tessel_dtype::ScalarDType;

use crate::{Buffer, CpuAllocator, Error, Index, MemorySpace};

fn arange(space: MemorySpace, shape: &[usize]) -> Buffer {
    let values: Vec<f32> = (0..shape.iter().product::<usize>()).map(|i| i as f32).collect();
    Buffer::from_slice(Arc::new(CpuAllocator), space, shape, &values).unwrap()
}

#[test]
fn test_from_slice_round_trip() {
    let buffer = arange(MemorySpace::Hbm, &[2, 3]);
    assert_eq!(buffer.size(), 24);
    assert_eq!(buffer.dtype(), ScalarDType::Float32);
    assert_eq!(buffer.to_vec::<f32>().unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
}

#[test]
fn test_to_vec_wrong_element() {
    let buffer = arange(MemorySpace::Hbm, &[4]);
    assert!(matches!(buffer.to_vec::<i32>(), Err(Error::ElementMismatch { .. })));
}

#[test]
fn test_copyin_size_mismatch() {
    let buffer = arange(MemorySpace::Hbm, &[4]);
    let result = buffer.copyin(&[0u8; 3]);
    assert!(matches!(result, Err(Error::SizeMismatch { expected: 16, actual: 3 })));
}

#[test]
fn test_at_slices_and_squeezes() {
    let buffer = arange(MemorySpace::Vmem, &[2, 8, 128]);
    let view = buffer.view();

    let row = view.at(&[Index::At(1), Index::ds(2, 3)]).unwrap();
    assert_eq!(row.shape(), &[3, 128]);
    assert_eq!(row.load::<f32>(&[0, 5]).unwrap(), (8 * 128 + 2 * 128 + 5) as f32);

    let chained = view.at(&[Index::ds(1, 1)]).unwrap().at(&[Index::At(0), Index::At(1)]).unwrap();
    assert_eq!(chained.shape(), &[128]);
    assert_eq!(chained.load::<f32>(&[0]).unwrap(), (8 * 128 + 128) as f32);
    assert!(!chained.squeezes_tiled_axes());
}

#[test]
fn test_squeezed_tiled_axes() {
    let buffer = arange(MemorySpace::Vmem, &[2, 8, 128]);
    let lane = buffer.view().at(&[Index::Full, Index::Full, Index::At(0)]).unwrap();
    assert!(!lane.squeezes_tiled_axes());

    let both = buffer.view().at(&[Index::Full, Index::At(0), Index::At(0)]).unwrap();
    assert_eq!(both.shape(), &[2]);
    assert!(both.squeezes_tiled_axes());
}

#[test]
fn test_at_out_of_bounds() {
    let buffer = arange(MemorySpace::Vmem, &[4, 4]);
    assert!(matches!(buffer.view().at(&[Index::ds(3, 2)]), Err(Error::IndexOutOfBounds { axis: 0, .. })));
    assert!(matches!(buffer.view().at(&[Index::At(4)]), Err(Error::IndexOutOfBounds { .. })));
    assert!(matches!(buffer.view().at(&[Index::Full; 3]), Err(Error::TooManyIndices { given: 3, rank: 2 })));
}

#[test]
fn test_hbm_refs_are_not_body_accessible() {
    let buffer = arange(MemorySpace::Hbm, &[4]);
    let result = buffer.view().load::<f32>(&[0]);
    assert!(matches!(result, Err(Error::MemorySpaceViolation { space: MemorySpace::Hbm })));

    let any = arange(MemorySpace::Any, &[4]);
    assert!(matches!(any.view().fill(1.0f32), Err(Error::MemorySpaceViolation { .. })));
}

#[test]
fn test_store_and_update() {
    let buffer = arange(MemorySpace::Vmem, &[2, 2]);
    let view = buffer.view();
    view.store(&[1, 1], 10.0f32).unwrap();
    view.update(|x: f32| x + 1.0).unwrap();
    assert_eq!(buffer.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 11.0]);
}

#[test]
fn test_access_counts() {
    let buffer = arange(MemorySpace::Smem, &[4]);
    let before = buffer.access_counts();
    let view = buffer.view();
    view.load::<f32>(&[0]).unwrap();
    view.load::<f32>(&[1]).unwrap();
    view.store(&[2], 0.0f32).unwrap();

    let delta = buffer.access_counts().since(&before);
    assert_eq!(delta.reads, 2);
    assert_eq!(delta.writes, 1);
}

#[test]
fn test_zero_dim_ref() {
    let buffer = Buffer::from_slice(Arc::new(CpuAllocator), MemorySpace::Smem, &[], &[7i32]).unwrap();
    assert_eq!(buffer.view().load::<i32>(&[]).unwrap(), 7);
}
