use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tessel_dtype::SemaphoreKind;

use crate::{Error, Semaphore};

#[test]
fn test_signal_then_wait() {
    let sem = Semaphore::scalar(SemaphoreKind::Regular).view();
    sem.signal(3).unwrap();
    assert_eq!(sem.read().unwrap(), 3);
    sem.wait(2).unwrap();
    assert_eq!(sem.read().unwrap(), 1);
    sem.wait(1).unwrap();
    assert!(sem.semaphore().balance().is_settled());
}

#[test]
fn test_wait_blocks_until_signalled() {
    let sem = Arc::new(Semaphore::scalar(SemaphoreKind::Regular));
    let waiter = {
        let sem = Arc::clone(&sem);
        thread::spawn(move || sem.view().wait(2))
    };

    thread::sleep(Duration::from_millis(10));
    sem.view().signal(1).unwrap();
    sem.view().signal(1).unwrap();

    waiter.join().unwrap().unwrap();
    assert_eq!(sem.view().read().unwrap(), 0);
}

#[test]
fn test_over_wait_times_out_with_detector() {
    let sem = Semaphore::new(SemaphoreKind::Regular, &[], Some(Duration::from_millis(20))).view();
    sem.signal(1).unwrap();
    let result = sem.wait(2);
    assert!(matches!(result, Err(Error::SemaphoreTimeout { amount: 2, value: 1, .. })));
    // A failed wait leaves the counter untouched.
    assert_eq!(sem.read().unwrap(), 1);
}

#[test]
fn test_array_semaphore_indexing() {
    let sem = Semaphore::new(SemaphoreKind::Dma, &[2, 3], None);
    let view = sem.view();

    assert!(matches!(view.signal(1), Err(Error::NonScalarSemaphore { op: "signal", .. })));
    assert!(matches!(view.at(&[1]).unwrap().wait(1), Err(Error::NonScalarSemaphore { op: "wait", .. })));

    let index = 2;
    view.at(&[1, index]).unwrap().signal(4).unwrap();
    assert_eq!(view.at(&[1, 2]).unwrap().read().unwrap(), 4);
    assert_eq!(view.at(&[0, 2]).unwrap().read().unwrap(), 0);
    assert_eq!(sem.balance().value, 4);
    assert!(matches!(view.at(&[2, 0]), Err(Error::IndexOutOfBounds { .. })));
}

#[test]
fn test_on_peer_keeps_index() {
    let local = Semaphore::new(SemaphoreKind::Regular, &[4], None);
    let peer = Semaphore::new(SemaphoreKind::Regular, &[4], None);
    local.view().at(&[3]).unwrap().on(&peer).signal(1).unwrap();
    assert_eq!(peer.view().at(&[3]).unwrap().read().unwrap(), 1);
    assert_eq!(local.balance().value, 0);
}
