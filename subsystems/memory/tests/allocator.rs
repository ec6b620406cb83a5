//! Page allocator scenarios on a hosted multi-core topology.

use kestrel_hal::hosted::ThreadCpus;
use kestrel_hal::{PhysAddr, PAGE_SIZE};
use kestrel_memory::physical::{AllocatorBackend, AllocatorConfig, FramePool, PageAllocator};
use kestrel_memory::Frame;
use std::sync::{Arc, Barrier};
use std::thread;

fn allocator(frames: usize, cpus: usize, config: AllocatorConfig) -> Arc<PageAllocator> {
    let memory = Box::leak(vec![0u8; frames * PAGE_SIZE as usize].into_boxed_slice());
    let pool = FramePool::from_static(PhysAddr::new(0x8000_0000), memory).unwrap();
    Arc::new(PageAllocator::new(pool, &config, Arc::new(ThreadCpus::new(cpus))))
}

#[test]
fn test_round_trip_both_strategies() {
    for config in [AllocatorConfig::single(), AllocatorConfig::per_cpu()] {
        let allocator = allocator(16, 4, config);
        let frames: Vec<Frame> = std::iter::from_fn(|| allocator.allocate()).collect();
        assert_eq!(frames.len(), 16);
        assert_eq!(allocator.free_frames(), 0);

        frames.into_iter().for_each(|frame| allocator.free(frame));
        assert_eq!(allocator.free_frames(), 16);
        assert_eq!(allocator.audit(0), Ok(()));
    }
}

#[test]
fn test_exhaust_free_one_alloc_one() {
    let allocator = allocator(8, 1, AllocatorConfig::single());
    let frames: Vec<Frame> = std::iter::from_fn(|| allocator.allocate()).collect();
    assert!(allocator.allocate().is_none());

    allocator.free(frames[3]);
    assert_eq!(allocator.allocate(), Some(frames[3]));
    assert!(allocator.allocate().is_none());
}

#[test]
fn test_stealing_drains_every_core() {
    let allocator = allocator(8, 4, AllocatorConfig::per_cpu());
    ThreadCpus::bind(2);

    let frames: Vec<Frame> = std::iter::from_fn(|| allocator.allocate()).collect();
    assert_eq!(frames.len(), 8);
    // Two came from cpu 2's own list, the rest were taken from its neighbours.
    assert_eq!(allocator.stats().steals, 6);
    assert!(allocator.allocate().is_none());
}

#[test]
fn test_per_core_accounting_under_threads() {
    const CPUS: usize = 4;
    let allocator = allocator(64, CPUS, AllocatorConfig::per_cpu());
    let barrier = Arc::new(Barrier::new(CPUS));

    let workers: Vec<_> = (0..CPUS)
        .map(|cpu| {
            let allocator = Arc::clone(&allocator);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                ThreadCpus::bind(cpu);
                barrier.wait();
                let mut held = Vec::new();
                for round in 0..200 {
                    if round % 3 == 2 {
                        if let Some(frame) = held.pop() {
                            allocator.free(frame);
                        }
                    } else if let Some(frame) = allocator.allocate() {
                        held.push(frame);
                    }
                }
                held
            })
        })
        .collect();

    let held: Vec<Frame> = workers
        .into_iter()
        .flat_map(|worker| worker.join().unwrap())
        .collect();

    let lengths = allocator.backend().list_lengths();
    assert_eq!(lengths.len(), CPUS);
    assert_eq!(lengths.iter().sum::<usize>() + held.len(), 64);
    assert_eq!(allocator.audit(held.len()), Ok(()));

    let mut unique = held.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), held.len());
}
