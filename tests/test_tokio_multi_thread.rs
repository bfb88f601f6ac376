// test_tokio_multi_thread
// Integration test for XCP in a tokio application, measurement signals live in async tasks
// Uses the test XCP client in xcp_client

// cargo test -- --test-threads=1 --nocapture --test test_tokio_multi_thread

use std::sync::Arc;

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use tokio::time::Duration;

use xcp_core::*;

mod test_executor;
use test_executor::*;

const TEST_TASK_COUNT: usize = 4;
const TEST_DURATION_MS: u64 = 1000;

//-----------------------------------------------------------------------------
// Async test task

async fn task(xcp: Arc<Xcp>, cal: Arc<CalPages>, event: XcpEvent) {
    let mut signals = TaskSignals::default();
    while cal.run() {
        tokio::time::sleep(Duration::from_micros(cal.cycle_time_us())).await;
        signals.step(&cal);

        if xcp.is_daq_event_running(event.get_id()) {
            // @@@@ UNSAFE - No await point while the window is alive
            let window = unsafe { signals.window() };
            event.trigger_ext(&xcp, &window);
        }
    }
    debug!("Task with event {} terminated, loop_counter={}", event.get_id(), signals.loop_counter);
}

//-----------------------------------------------------------------------------
// Integration test tokio tasks measurement and calibration

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tokio_multi_thread() {
    test_setup();

    let cal = CalPages::new();
    let xcp = Arc::new(
        XcpBuilder::new("test_tokio_multi_thread")
            .set_appl(Box::new(TestAppl::new(Arc::clone(&cal))))
            .build()
            .unwrap(),
    );
    xcp.start();

    let mut tasks = Vec::new();
    for i in 0..TEST_TASK_COUNT {
        let event = xcp.create_event(&format!("task_{}", i), 1000000, XcpEventPriority::Queued, 1, 0);
        tasks.push(tokio::spawn(task(Arc::clone(&xcp), Arc::clone(&cal), event)));
    }

    test_executor(Arc::clone(&xcp), Arc::clone(&cal), TestMode::CalDaq, TEST_TASK_COUNT, TEST_DURATION_MS).await;

    cal.stop();
    for t in tasks {
        t.await.unwrap();
    }
    xcp.stop().unwrap();
}

//-----------------------------------------------------------------------------
// Calibration only, without any task running

#[tokio::test(flavor = "current_thread")]
async fn test_tokio_single_thread_cal() {
    test_setup();

    let cal = CalPages::new();
    let xcp = Arc::new(
        XcpBuilder::new("test_tokio_single_thread")
            .set_appl(Box::new(TestAppl::new(Arc::clone(&cal))))
            .build()
            .unwrap(),
    );
    xcp.start();

    test_executor(Arc::clone(&xcp), Arc::clone(&cal), TestMode::Cal, 0, 0).await;
    assert_eq!(cal.counter_max(), 15);
    assert_eq!(cal.cycle_time_us(), 250);

    test_executor(Arc::clone(&xcp), Arc::clone(&cal), TestMode::ConnectOnly, 0, 0).await;
    xcp.stop().unwrap();
}
