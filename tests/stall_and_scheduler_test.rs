use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sluice::error::SluiceError;
use sluice::index::StallControl;
use sluice::info_stream::{InfoStream, RecordingInfoStream};
use sluice::merge::ConcurrentMergeScheduler;
use sluice::merge::concurrent::AUTO_DETECT_MERGES_AND_THREADS;

fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_unstall_releases_every_waiter() {
    let info_stream = Arc::new(RecordingInfoStream::new());
    let stall = Arc::new(StallControl::new(info_stream.clone() as Arc<dyn InfoStream>));
    stall.update_stalled(true);
    assert!(stall.any_stalled_threads());

    let waiters: Vec<_> = (0..8)
        .map(|_| {
            let stall = Arc::clone(&stall);
            thread::spawn(move || stall.wait_if_stalled())
        })
        .collect();
    wait_until(|| stall.num_waiting() == 8);
    assert!(stall.has_blocked());

    stall.update_stalled(false);
    for waiter in waiters {
        waiter.join().unwrap();
    }
    assert_eq!(stall.num_waiting(), 0);
    assert!(!stall.has_blocked());
    assert!(stall.was_stalled());
    assert!(info_stream.contains("DWSC", "now stalled"));
}

#[test]
fn test_closing_stall_control_releases_waiters() {
    let stall = Arc::new(StallControl::default());
    stall.update_stalled(true);
    let waiter = {
        let stall = Arc::clone(&stall);
        thread::spawn(move || stall.wait_if_stalled())
    };
    wait_until(|| stall.num_waiting() == 1);
    stall.close();
    waiter.join().unwrap();
}

#[test]
fn test_max_merges_and_threads_sentinel() {
    let scheduler = ConcurrentMergeScheduler::new();
    assert_eq!(scheduler.max_merge_count(), AUTO_DETECT_MERGES_AND_THREADS);

    assert!(matches!(
        scheduler.set_max_merges_and_threads(AUTO_DETECT_MERGES_AND_THREADS, 2),
        Err(SluiceError::InvalidArgument(_))
    ));
    assert!(matches!(
        scheduler.set_max_merges_and_threads(4, AUTO_DETECT_MERGES_AND_THREADS),
        Err(SluiceError::InvalidArgument(_))
    ));
    assert!(matches!(
        scheduler.set_max_merges_and_threads(2, 3),
        Err(SluiceError::InvalidArgument(_))
    ));

    scheduler.set_max_merges_and_threads(6, 2).unwrap();
    assert_eq!((scheduler.max_merge_count(), scheduler.max_thread_count()), (6, 2));

    scheduler
        .set_max_merges_and_threads(AUTO_DETECT_MERGES_AND_THREADS, AUTO_DETECT_MERGES_AND_THREADS)
        .unwrap();
    assert_eq!(scheduler.max_thread_count(), AUTO_DETECT_MERGES_AND_THREADS);

    scheduler.set_default_max_merges_and_threads(true);
    assert_eq!((scheduler.max_merge_count(), scheduler.max_thread_count()), (6, 1));
}
