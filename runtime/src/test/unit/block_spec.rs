use tessel_device::{Index, MemorySpace};
use tessel_dtype::ScalarDType;
use test_case::test_case;

use crate::block_spec::ResolvedBlock;
use crate::test::helpers::f32s;
use crate::{BlockDim, BlockSpec, Error, IndexArgs, IndexMap, IndexingMode, ShapeDtype};

fn resolve(spec: &BlockSpec, array: &ShapeDtype, arity: usize) -> crate::Result<ResolvedBlock> {
    ResolvedBlock::resolve(spec, "input 0".to_string(), array, arity)
}

fn window_at(block: &ResolvedBlock, coord: &[u64]) -> crate::Window {
    block.window(&IndexArgs::new(coord, &[])).unwrap()
}

#[test_case(&[0], &[0, 0], true; "first")]
#[test_case(&[2], &[16, 0], true; "last_partial")]
#[test_case(&[3], &[24, 0], false; "past_end")]
fn test_blocked_window(coord: &[u64], start: &[i64], in_bounds: bool) {
    let spec = BlockSpec::blocked([8usize, 128], IndexMap::from_coords(1, |c| vec![c[0], 0]));
    let block = resolve(&spec, &f32s(&[20, 128]), 1).unwrap();

    let window = window_at(&block, coord);
    assert_eq!(window.start.as_slice(), start);
    assert_eq!(window.shape.as_slice(), &[8, 128]);
    assert_eq!(window.in_bounds, in_bounds);
}

#[test]
fn test_partial_window_clips_to_array() {
    let spec = BlockSpec::blocked([8usize, 128], IndexMap::from_coords(1, |c| vec![c[0], 0]));
    let block = resolve(&spec, &f32s(&[20, 128]), 1).unwrap();
    let window = window_at(&block, &[2]);

    assert!(window.is_partial(&[20, 128]));
    let (src, dst) = window.clip(&[20, 128]).unwrap();
    assert_eq!(src, vec![Index::ds(16, 4), Index::ds(0, 128)]);
    assert_eq!(dst, vec![Index::ds(0, 4), Index::ds(0, 128)]);

    assert!(window_at(&block, &[3]).clip(&[20, 128]).is_none());
}

#[test]
fn test_full_and_squeezed_dims() {
    let spec = BlockSpec::blocked(
        [BlockDim::Squeezed, BlockDim::Full, BlockDim::Blocked(64)],
        IndexMap::from_coords(2, |c| vec![c[0], 99, c[1]]),
    );
    let block = resolve(&spec, &f32s(&[4, 8, 128]), 2).unwrap();

    let window = window_at(&block, &[3, 1]);
    assert_eq!(window.start.as_slice(), &[3, 0, 64]);
    assert_eq!(window.shape.as_slice(), &[1, 8, 64]);
    assert!(window.in_bounds);
    assert_eq!(block.kernel_indices(), vec![Index::At(0), Index::Full, Index::Full]);
    assert_eq!(block.window_bytes(), 8 * 64 * 4);
}

#[test]
fn test_unblocked_window_with_padding() {
    let spec = BlockSpec::builder()
        .block_shape(vec![BlockDim::Blocked(4), BlockDim::Full])
        .index_map(IndexMap::from_coords(1, |c| vec![c[0] * 4 - 2, 0]))
        .indexing_mode(IndexingMode::Unblocked { padding: Some(vec![(2, 2), (0, 0)]) })
        .build();
    let block = resolve(&spec, &f32s(&[8, 128]), 1).unwrap();

    let first = window_at(&block, &[0]);
    assert_eq!(first.start.as_slice(), &[-2, 0]);
    assert!(first.in_bounds);
    let (src, dst) = first.clip(&[8, 128]).unwrap();
    assert_eq!(src[0], Index::ds(0, 2));
    assert_eq!(dst[0], Index::ds(2, 2));

    assert!(window_at(&block, &[2]).in_bounds);
    assert!(!window_at(&block, &[3]).in_bounds);
}

#[test]
fn test_missing_block_shape_covers_array() {
    let block = resolve(&BlockSpec::default(), &f32s(&[3, 5]), 0).unwrap();
    let window = window_at(&block, &[]);
    assert_eq!(window.shape.as_slice(), &[3, 5]);
    assert_eq!(window.start.as_slice(), &[0, 0]);
    assert_eq!(block.space, MemorySpace::Vmem);
}

#[test]
fn test_index_map_reads_prefetch() {
    let device = tessel_device::Device::cpu();
    let table = device.buffer_from(MemorySpace::Smem, &[4], &[3i32, 1, 0, 2]).unwrap();
    let map = IndexMap::new(2, |args| Ok(vec![args.scalar(0, &[args.program_id(0)? as usize])?, 0]));

    let prefetch = [table.view()];
    assert_eq!(map.eval(&IndexArgs::new(&[0], &prefetch)).unwrap(), vec![3, 0]);
    assert_eq!(map.eval(&IndexArgs::new(&[3], &prefetch)).unwrap(), vec![2, 0]);
}

#[test]
fn test_resolve_errors() {
    let array = f32s(&[16, 128]);

    let spec = BlockSpec::blocked([8usize], IndexMap::from_coords(1, |c| vec![c[0]]));
    assert!(matches!(resolve(&spec, &array, 1), Err(Error::BlockRankMismatch { block_rank: 1, array_rank: 2, .. })));

    let spec = BlockSpec::blocked([8usize, 128], IndexMap::from_coords(2, |c| vec![c[0], 0]));
    assert!(matches!(resolve(&spec, &array, 1), Err(Error::IndexMapArity { expected: 1, actual: 2, .. })));

    let spec = BlockSpec::blocked([0usize, 128], IndexMap::from_coords(1, |c| vec![c[0], 0]));
    assert!(matches!(resolve(&spec, &array, 1), Err(Error::EmptyBlock { .. })));

    let spec = BlockSpec::builder().indexing_mode(IndexingMode::Unblocked { padding: Some(vec![(1, 1)]) }).build();
    assert!(matches!(resolve(&spec, &array, 0), Err(Error::PaddingRankMismatch { padding_rank: 1, .. })));

    let spec = BlockSpec::blocked([8usize, 128], IndexMap::from_coords(1, |c| vec![c[0]]));
    let block = resolve(&spec, &array, 1).unwrap();
    assert!(matches!(
        block.window(&IndexArgs::new(&[0], &[])),
        Err(Error::IndexMapResultArity { expected: 2, actual: 1, .. })
    ));
}

#[test]
fn test_shape_dtype_bytes() {
    assert_eq!(ShapeDtype::new(&[8, 128], ScalarDType::BFloat16).bytes(), 8 * 128 * 2);
    assert_eq!(ShapeDtype::new(&[], ScalarDType::Int64).bytes(), 8);
}

#[test_case(IndexingMode::Blocked, i64::MAX / 4; "blocked_overflow")]
#[test_case(IndexingMode::Blocked, i64::MIN; "blocked_min")]
#[test_case(IndexingMode::Unblocked { padding: None }, i64::MAX; "unblocked_max")]
fn test_huge_offset_is_out_of_bounds(mode: IndexingMode, row: i64) {
    let spec = BlockSpec::builder()
        .block_shape(vec![BlockDim::Blocked(8), BlockDim::Blocked(128)])
        .index_map(IndexMap::new(1, move |_| Ok(vec![row, 0])))
        .indexing_mode(mode)
        .build();
    let array = f32s(&[16, 128]);
    let block = resolve(&spec, &array, 1).unwrap();

    let window = window_at(&block, &[0]);
    assert!(!window.in_bounds);
    assert!(window.is_partial(&array.shape));
    assert_eq!(window.clip(&array.shape), None);
}

#[test]
fn test_index_args_out_of_range() {
    let args = IndexArgs::new(&[2], &[]);
    assert_eq!(args.program_id(0).unwrap(), 2);
    assert!(matches!(args.program_id(1), Err(Error::InvalidGridAxis { axis: 1, rank: 1 })));
    assert!(matches!(args.prefetch(0), Err(Error::InvalidPrefetchOperand { operand: 0, count: 0 })));
    assert!(matches!(args.scalar(0, &[0]), Err(Error::InvalidPrefetchOperand { operand: 0, count: 0 })));
}
