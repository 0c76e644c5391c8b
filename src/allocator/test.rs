use pretty_assertions::assert_eq;
use tokio::sync::oneshot;

use super::ConnectionAllocator;
use crate::{
    launcher::requester::PendingSpawn,
    options::SpawnData,
    test_util::{sandboxed_descriptor, FakeBinder},
};

fn allocator(count: usize) -> ConnectionAllocator {
    ConnectionAllocator::new(sandboxed_descriptor(count), FakeBinder::new() as _).unwrap()
}

fn pending(tag: u8) -> PendingSpawn {
    let (fulfiller, _) = oneshot::channel();
    PendingSpawn {
        spawn: SpawnData::builder()
            .sandboxed(true)
            .service_bundle(crate::options::Bundle::new(vec![tag]))
            .build(),
        fulfiller,
        retried: false,
    }
}

#[test]
fn rejects_class_with_no_instances() {
    let error = ConnectionAllocator::new(sandboxed_descriptor(0), FakeBinder::new() as _)
        .map(|_| ())
        .unwrap_err();
    assert!(format!("{error}").contains("configuration"));
}

#[test]
fn allocates_lowest_free_slot_first() {
    let mut alloc = allocator(3);
    let first = alloc.allocate().unwrap().service().clone();
    let second = alloc.allocate().unwrap().service().clone();
    assert_eq!(first.index(), 0);
    assert_eq!(second.index(), 1);

    alloc.free(0);
    let reused = alloc.allocate().unwrap().service().clone();
    assert_eq!(reused.index(), 0);
}

#[test]
fn slot_conservation_holds_under_churn() {
    let mut alloc = allocator(4);
    for _ in 0..4 {
        alloc.allocate().unwrap();
    }
    assert!(alloc.allocate().is_none());
    assert_eq!(alloc.free_slot_indices().len(), 0);

    alloc.free(2);
    alloc.free(0);
    assert_eq!(alloc.free_slot_indices(), vec![0, 2]);
    assert_eq!(
        alloc.free_slot_indices().len() + alloc.connections().count(),
        alloc.number_of_services()
    );
}

#[test]
fn queue_is_fifo() {
    let mut alloc = allocator(1);
    alloc.allocate().unwrap();

    alloc.enqueue(pending(1));
    alloc.enqueue(pending(2));
    alloc.enqueue(pending(3));
    assert_eq!(alloc.pending_len(), 3);

    let (_, next) = alloc.free(0).unwrap();
    assert_eq!(next.unwrap().spawn.service_bundle.as_bytes(), &[1]);

    alloc.allocate().unwrap();
    let (_, next) = alloc.free(0).unwrap();
    assert_eq!(next.unwrap().spawn.service_bundle.as_bytes(), &[2]);
    assert_eq!(alloc.pending_len(), 1);
}

#[test]
fn free_of_empty_slot_is_none() {
    let mut alloc = allocator(2);
    assert!(alloc.free(0).is_none());
    assert!(alloc.free(7).is_none());
}

#[test]
fn observers_reflect_occupancy() {
    let mut alloc = allocator(2);
    assert!(alloc.is_free_connection_available());
    assert!(!alloc.any_connection_allocated());
    assert_eq!(alloc.number_of_services(), 2);

    alloc.allocate().unwrap();
    assert!(alloc.is_free_connection_available());
    assert!(alloc.any_connection_allocated());

    alloc.allocate().unwrap();
    assert!(!alloc.is_free_connection_available());
}
