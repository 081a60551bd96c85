use criterion::{criterion_group, criterion_main, Criterion};
use nix::{
    libc,
    sys::wait::waitpid,
    unistd::{fork, ForkResult},
};
use shmring::SharedRingQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

const ITEMS_PER_PROCESS_TARGET: usize = 100_000;
const PROCESS_COUNTS_TO_TEST: &[(usize, usize)] = &[(1, 1), (2, 2)];
const CAPACITY: usize = 1024;

// go flag + consumed counter live ahead of the queue region.
const SYNC_SIZE: usize = 64;

unsafe fn map_shared(bytes: usize) -> *mut u8 {
    let ptr = libc::mmap(
        std::ptr::null_mut(),
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if ptr == libc::MAP_FAILED {
        panic!("mmap failed: {}", std::io::Error::last_os_error());
    }
    ptr.cast()
}

unsafe fn unmap_shared(ptr: *mut u8, len: usize) {
    if libc::munmap(ptr.cast(), len) == -1 {
        panic!("munmap failed: {}", std::io::Error::last_os_error());
    }
}

fn run_process_benchmark(num_producers: usize, num_consumers: usize, items_per_producer: usize) {
    let queue_size = SharedRingQueue::<usize>::required_size(CAPACITY);
    let total_size = SYNC_SIZE + queue_size;
    let shm_ptr = unsafe { map_shared(total_size) };

    let go = unsafe { &*(shm_ptr as *const AtomicBool) };
    // Counter sits one word past the flag to keep it naturally aligned.
    let consumed = unsafe { &*(shm_ptr.add(8) as *const AtomicUsize) };
    let queue_ptr = unsafe { shm_ptr.add(SYNC_SIZE) };

    go.store(false, Ordering::SeqCst);
    consumed.store(0, Ordering::SeqCst);

    let total_items = num_producers * items_per_producer;
    let mut children = Vec::new();

    for p in 0..num_producers {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let queue =
                    unsafe { SharedRingQueue::<usize>::attach(queue_ptr, queue_size) }.unwrap();
                while !go.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                for i in 0..items_per_producer {
                    let mut item = p * items_per_producer + i;
                    loop {
                        match queue.push(item, false) {
                            Ok(_) => break,
                            Err(rejected) => {
                                item = rejected;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
                unsafe { libc::_exit(0) };
            }
            Ok(ForkResult::Parent { child }) => children.push(child),
            Err(e) => panic!("Fork failed: {}", e),
        }
    }

    for _ in 0..num_consumers {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let queue =
                    unsafe { SharedRingQueue::<usize>::attach(queue_ptr, queue_size) }.unwrap();
                while !go.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                loop {
                    if consumed.load(Ordering::Acquire) >= total_items {
                        break;
                    }
                    match queue.pop() {
                        Ok(_) => {
                            consumed.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(_) => std::hint::spin_loop(),
                    }
                }
                unsafe { libc::_exit(0) };
            }
            Ok(ForkResult::Parent { child }) => children.push(child),
            Err(e) => panic!("Fork failed: {}", e),
        }
    }

    go.store(true, Ordering::Release);

    for child in children {
        waitpid(child, None).expect("waitpid failed");
    }

    assert_eq!(consumed.load(Ordering::SeqCst), total_items);
    unsafe { unmap_shared(shm_ptr, total_size) };
}

fn bench_shared_ring_processes(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_ring_processes");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(20));

    for &(num_producers, num_consumers) in PROCESS_COUNTS_TO_TEST {
        let items_per_producer = ITEMS_PER_PROCESS_TARGET / num_producers;
        group.bench_function(
            format!("{}p_{}c", num_producers, num_consumers),
            |b| b.iter(|| run_process_benchmark(num_producers, num_consumers, items_per_producer)),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_shared_ring_processes);
criterion_main!(benches);
