use std::thread;
use std::time::Duration;

use smallvec::smallvec;
use tessel_dtype::{ScalarDType, SemaphoreKind};

use crate::{DeviceId, Error, MemorySpace, Mesh, RemoteAsyncCopy, Resource, Semaphore, SlotId};

#[test]
fn test_resolve_device_ids() {
    let mesh = Mesh::new(&[2, 4]);
    assert_eq!(mesh.num_devices(), 8);
    assert_eq!(mesh.resolve(&DeviceId::Logical(5)).unwrap(), 5);
    assert_eq!(mesh.resolve(&DeviceId::Mesh(smallvec![1, 2])).unwrap(), 6);
    assert_eq!(mesh.coords(6).as_slice(), &[1, 2]);

    assert!(matches!(mesh.resolve(&DeviceId::Logical(8)), Err(Error::InvalidDevice { .. })));
    assert!(matches!(mesh.resolve(&DeviceId::Mesh(smallvec![2, 0])), Err(Error::InvalidDevice { .. })));
    assert!(matches!(mesh.resolve(&DeviceId::Mesh(smallvec![0])), Err(Error::InvalidDevice { .. })));
}

#[test]
fn test_lookup_blocks_until_registered() {
    let mesh = Mesh::new(&[2]);
    let buffer = mesh.devices()[1].alloc(MemorySpace::Vmem, ScalarDType::Float32, &[4]).unwrap();

    thread::scope(|scope| {
        let waiter = scope.spawn(|| mesh.lookup_buffer(1, 0, SlotId::Output(0), None));
        thread::sleep(Duration::from_millis(10));
        mesh.register(1, 0, SlotId::Output(0), Resource::Buffer(buffer.clone())).unwrap();
        assert!(waiter.join().unwrap().unwrap().is_same(&buffer));
    });

    assert_eq!(mesh.slot_of_buffer(1, 0, &buffer), Some(SlotId::Output(0)));
    assert_eq!(mesh.slot_of_buffer(0, 0, &buffer), None);
}

#[test]
fn test_lookup_timeout_and_kind() {
    let mesh = Mesh::new(&[2]);
    let result = mesh.lookup(0, 0, SlotId::Scratch(0), Some(Duration::from_millis(10)));
    assert!(matches!(result, Err(Error::SlotTimeout { device: 0, .. })));

    let sem = Semaphore::scalar(SemaphoreKind::Regular);
    mesh.register(0, 0, SlotId::Scratch(0), Resource::Semaphore(sem)).unwrap();
    let result = mesh.lookup_buffer(0, 0, SlotId::Scratch(0), None);
    assert!(matches!(result, Err(Error::SlotKind { found: "semaphore", .. })));

    mesh.unregister(0, 0, SlotId::Scratch(0));
    mesh.clear();
    assert!(mesh.lookup(0, 0, SlotId::Scratch(0), Some(Duration::from_millis(1))).is_err());
}

#[test]
fn test_barrier_semaphores() {
    let mesh = Mesh::new(&[2]);
    assert!(matches!(mesh.barrier(0, 0, None, None), Err(Error::MissingCollectiveId)));

    let first = mesh.barrier(0, 0, Some(7), None).unwrap();
    let again = mesh.barrier(0, 0, Some(7), None).unwrap();
    let other = mesh.barrier(0, 0, Some(8), None).unwrap();
    assert!(first.is_same(&again));
    assert!(!first.is_same(&other));
    assert_eq!(first.kind(), SemaphoreKind::Barrier);
    assert_eq!(mesh.slot_of_semaphore(0, 0, &first), Some(SlotId::Barrier(7)));
}

#[test]
fn test_remote_copy_ring() {
    let mesh = Mesh::new(&[2]);
    let inputs: Vec<_> = (0..2)
        .map(|d| mesh.devices()[d].buffer_from(MemorySpace::Vmem, &[4], &[d as f32; 4]).unwrap())
        .collect();
    let outputs: Vec<_> =
        (0..2).map(|d| mesh.devices()[d].alloc(MemorySpace::Vmem, ScalarDType::Float32, &[4]).unwrap()).collect();
    let send: Vec<_> = (0..2).map(|_| Semaphore::scalar(SemaphoreKind::Dma)).collect();
    let recv: Vec<_> = (0..2).map(|_| Semaphore::scalar(SemaphoreKind::Dma)).collect();

    let mut copies: Vec<_> = (0..2)
        .map(|d| {
            let peer = (d + 1) % 2;
            RemoteAsyncCopy::new(
                &inputs[d].view(),
                &outputs[d].view().on(&outputs[peer]),
                &send[d].view(),
                &recv[peer].view(),
                &recv[d].view(),
                peer,
            )
            .unwrap()
        })
        .collect();
    for copy in &mut copies {
        copy.start().unwrap();
    }
    for copy in &mut copies {
        copy.wait_send().unwrap();
        copy.wait_recv().unwrap();
    }

    assert_eq!(outputs[0].to_vec::<f32>().unwrap(), vec![1.0; 4]);
    assert_eq!(outputs[1].to_vec::<f32>().unwrap(), vec![0.0; 4]);
    for sem in send.iter().chain(&recv) {
        assert_eq!(sem.balance().value, 0);
    }
}
