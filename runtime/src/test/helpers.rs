use std::sync::Arc;

use parking_lot::Mutex;
use tessel_device::{Buffer, Device, MemorySpace};
use tessel_dtype::ScalarDType;

use crate::{BlockDim, BlockSpec, IndexMap, ShapeDtype};

pub fn f32s(shape: &[usize]) -> ShapeDtype {
    ShapeDtype::new(shape, ScalarDType::Float32)
}

/// `0, 1, 2, ...` in HBM.
pub fn arange(device: &Device, shape: &[usize]) -> Buffer {
    let values: Vec<f32> = (0..shape.iter().product::<usize>()).map(|i| i as f32).collect();
    device.buffer_from(MemorySpace::Hbm, shape, &values).unwrap()
}

pub fn filled(device: &Device, shape: &[usize], value: f32) -> Buffer {
    device.buffer_from(MemorySpace::Hbm, shape, &vec![value; shape.iter().product()]).unwrap()
}

/// Row blocks of a 2-D operand: block `i` of `rows` rows at grid step `i`.
pub fn row_blocks(rows: usize, cols: usize, arity: usize) -> BlockSpec {
    BlockSpec::blocked([BlockDim::Blocked(rows), BlockDim::Blocked(cols)], IndexMap::from_coords(arity, |c| vec![c[0], 0]))
}

/// Shared log a body can append to.
pub fn recorder<T>() -> (Arc<Mutex<Vec<T>>>, Arc<Mutex<Vec<T>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Arc::clone(&log), log)
}
