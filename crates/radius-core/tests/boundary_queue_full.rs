// Boundary behavior from spec §8: max_queue_size=2 rejects a third distinct
// request, exercised through the pool's public enqueue surface rather than
// RequestQueue directly (the pool's single idle worker is kept busy so the
// two enqueues actually reach the heap instead of the fast path).

use std::sync::{Arc, Barrier};
use std::time::Duration;

use radius_core::config::PoolConfig;
use radius_core::pool::{ProcessFn, WorkerPool};
use radius_core::types::{PacketCode, Rcode, Request};

#[test]
fn third_distinct_request_is_rejected_at_max_queue_size_two() {
    let blocker = Arc::new(Barrier::new(2));
    let blocker_worker = Arc::clone(&blocker);
    let process: ProcessFn = Arc::new(move |_req| {
        blocker_worker.wait();
        Rcode::Ok
    });

    let config = PoolConfig {
        start_servers: 1,
        min_spare_servers: 0,
        max_spare_servers: 1,
        max_servers: 1,
        max_queue_size: 2,
        ..PoolConfig::default()
    };
    let pool = WorkerPool::new(config, process);
    std::thread::sleep(Duration::from_millis(50));

    assert!(pool.enqueue(Request::new(1, "default", PacketCode::AccessRequest)), "occupies the only worker");
    assert!(pool.enqueue(Request::new(2, "default", PacketCode::AccessRequest)), "fills the 2-slot queue");
    let rejected = pool.enqueue(Request::new(3, "default", PacketCode::AccessRequest));
    assert!(!rejected, "a third distinct request must be rejected once the heap is at max_queue_size");

    blocker.wait();
    pool.shutdown();
}
