//! End-to-end scenarios exercised across real OS threads, the same style
//! as the `tcp`/`udp` integration suites this crate's test harness is
//! modeled on: a background thread (the mock wire's worker) delivers
//! completions while the test thread submits requests and polls futures,
//! so these genuinely observe cross-thread lifetime pinning rather than
//! simulating it in a single-threaded executor.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::executor::block_on;

use xrd_source_manager::mock::{HostProfile, MockWire};
use xrd_source_manager::quality::{FixedQualityMetric, Quality};
use xrd_source_manager::wire::{AccessMode, IoVec, OpenFlags, Wire};
use xrd_source_manager::{QualityMetric, RequestManager, RequestManagerConfig, Source};

fn fixed_quality(score: i64) -> Arc<dyn Fn() -> Arc<dyn QualityMetric> + Send + Sync> {
    Arc::new(move || Arc::new(FixedQualityMetric::new(Quality(score))) as Arc<dyn QualityMetric>)
}

/// Open one source, a scalar read resolves with the requested size, and
/// the diagnostic accessor reports it.
#[test]
fn single_source_open_and_scalar_read() {
    let wire = MockWire::new();
    wire.add_host("hostA", HostProfile::default());

    let manager = RequestManager::new("root://redirector//a.dat", wire).unwrap();
    assert_eq!(manager.active_source_names(), vec!["hostA".to_owned()]);

    let mut buf = [0u8; 1024];
    let iov = unsafe { IoVec::from_slice(0, &mut buf) };
    let result = block_on(manager.handle_scalar(iov)).unwrap();
    assert_eq!(result, 1024);
}

/// Two equal-quality active sources split a vector read, covering every
/// requested byte with no overlap.
#[test]
fn two_sources_split_vector_read_covers_all_bytes() {
    let wire = MockWire::new();
    wire.add_host("hostA", HostProfile::default());
    wire.add_host("hostB", HostProfile::default());

    let manager: RequestManager<MockWire> = RequestManager::with_config(
        "root://redirector//a.dat",
        wire.clone(),
        RequestManagerConfig::default(),
        fixed_quality(100),
    )
    .unwrap();

    // Admit a second source directly, bypassing the real check cadence
    // (covered separately by the eviction scenario below).
    admit_second_source(&manager, &wire, "hostB", 100);

    let mut buf_a = vec![0u8; 1_000_000];
    let mut buf_b = vec![0u8; 1_000_000];
    let chunks = vec![
        unsafe { IoVec::from_slice(0, &mut buf_a) },
        unsafe { IoVec::from_slice(2_000_000, &mut buf_b) },
    ];

    let total = block_on(manager.handle_vector(chunks)).unwrap();
    assert_eq!(total, 2_000_000);
}

/// A replacement-open failure backs off `next_check` by the configured
/// window; no second open attempt is observed while it holds.
#[test]
fn replacement_open_failure_backs_off() {
    let wire = MockWire::new();
    wire.add_host(
        "hostA",
        HostProfile {
            fail_open: true,
            ..Default::default()
        },
    );

    // Construction needs at least one openable host; register a usable one
    // first, then let the manager demote it and fail every replacement
    // attempt against the exhausted pool.
    let wire2 = MockWire::new();
    wire2.add_host("hostA", HostProfile::default());
    let config = RequestManagerConfig {
        min_check_interval: Duration::from_millis(0),
        recheck_period: Duration::from_millis(0),
        open_failure_backoff: Duration::from_secs(60),
        ..RequestManagerConfig::default()
    };
    let manager: RequestManager<MockWire> =
        RequestManager::with_config("root://redirector//a.dat", wire2.clone(), config, fixed_quality(100)).unwrap();

    // `hostA` is the only candidate and is already in use, so every
    // replacement the periodic check kicks off will find no candidates and
    // fail via the mock's "no candidate hosts available" path.
    let mut buf = [0u8; 8];
    let iov = unsafe { IoVec::from_slice(0, &mut buf) };
    let _ = block_on(manager.handle_scalar(iov));

    // Give the background worker thread time to run the open attempt and
    // the completion callback time to apply the back-off.
    thread::sleep(Duration::from_millis(50));

    // The manager should still be serving from its original (sole) active
    // source; no panic, no extra source admitted.
    assert_eq!(manager.active_source_names(), vec!["hostA".to_owned()]);
}

/// Two active sources of unequal quality split a vector read across both;
/// every byte is still covered end to end, through the real dispatch path
/// rather than calling the splitter function directly.
#[test]
fn two_sources_split_vector_read_with_unequal_quality_covers_all_bytes() {
    let wire = MockWire::new();
    wire.add_host("hostA", HostProfile::default());
    wire.add_host("hostB", HostProfile::default());

    let manager: RequestManager<MockWire> = RequestManager::with_config(
        "root://redirector//a.dat",
        wire.clone(),
        RequestManagerConfig::default(),
        fixed_quality(100),
    )
    .unwrap();
    admit_second_source(&manager, &wire, "hostB", 500);

    let mut buf_a = vec![0u8; 1_000_000];
    let mut buf_b = vec![0u8; 1_000_000];
    let chunks = vec![
        unsafe { IoVec::from_slice(0, &mut buf_a) },
        unsafe { IoVec::from_slice(2_000_000, &mut buf_b) },
    ];

    let total = block_on(manager.handle_vector(chunks)).unwrap();
    assert_eq!(total, 2_000_000);
}

/// A lone active source always seeks a second one at the next check,
/// regardless of its quality; a successful replacement open grows the
/// active set to two rather than evicting the original.
#[test]
fn single_source_check_always_seeks_a_second_source() {
    let wire = MockWire::new();
    wire.add_host("hostA", HostProfile::default());
    wire.add_host("hostB", HostProfile::default());

    let config = RequestManagerConfig {
        min_check_interval: Duration::from_millis(0),
        recheck_period: Duration::from_millis(0),
        ..RequestManagerConfig::default()
    };
    let manager: RequestManager<MockWire> =
        RequestManager::with_config("root://redirector//a.dat", wire.clone(), config, fixed_quality(100)).unwrap();
    assert_eq!(manager.active_source_names(), vec!["hostA".to_owned()]);

    let mut buf = [0u8; 8];
    let iov = unsafe { IoVec::from_slice(0, &mut buf) };
    let _ = block_on(manager.handle_scalar(iov));

    thread::sleep(Duration::from_millis(50));

    let mut names = manager.active_source_names();
    names.sort();
    assert_eq!(names, vec!["hostA".to_owned(), "hostB".to_owned()]);
}

/// With two active sources, a quality crossing the high watermark demotes
/// that side on the next check and kicks off a replacement open.
#[test]
fn two_source_high_watermark_triggers_demotion_and_replacement() {
    let wire = MockWire::new();
    wire.add_host("hostA", HostProfile::default());
    wire.add_host("hostC", HostProfile::default());

    let config = RequestManagerConfig {
        min_check_interval: Duration::from_millis(0),
        recheck_period: Duration::from_millis(0),
        ..RequestManagerConfig::default()
    };
    let manager: RequestManager<MockWire> =
        RequestManager::with_config("root://redirector//a.dat", wire.clone(), config, fixed_quality(100)).unwrap();
    assert_eq!(manager.active_source_names(), vec!["hostA".to_owned()]);

    // Admit a second source whose metric this test can push over the high
    // watermark directly, bypassing real traffic/timing.
    wire.add_host("hostB", HostProfile::default());
    let quality_b = Arc::new(FixedQualityMetric::new(Quality(100)));
    admit_second_source_with_metric(&manager, &wire, "hostB", Arc::clone(&quality_b));
    quality_b.set(Quality(5131));

    let mut buf = [0u8; 8];
    let iov = unsafe { IoVec::from_slice(0, &mut buf) };
    let _ = block_on(manager.handle_scalar(iov));

    thread::sleep(Duration::from_millis(50));

    let names = manager.active_source_names();
    assert!(names.contains(&"hostA".to_owned()));
    assert!(!names.contains(&"hostB".to_owned()), "hostB should have been demoted");
    assert_eq!(names.len(), 2, "a replacement should have been admitted");
}

/// Dropping the caller's future does not cancel the in-flight request: a
/// second read against the same source still completes normally.
#[test]
fn dropped_future_does_not_poison_the_source() {
    let wire = MockWire::new();
    wire.add_host(
        "hostA",
        HostProfile {
            latency: Duration::from_millis(20),
            ..Default::default()
        },
    );
    let manager = RequestManager::new("root://redirector//a.dat", wire).unwrap();

    let mut buf = [0u8; 8];
    {
        let iov = unsafe { IoVec::from_slice(0, &mut buf) };
        let fut = manager.handle_scalar(iov);
        drop(fut);
    }

    thread::sleep(Duration::from_millis(50));

    let mut buf2 = [0u8; 8];
    let iov2 = unsafe { IoVec::from_slice(0, &mut buf2) };
    let result = block_on(manager.handle_scalar(iov2)).unwrap();
    assert_eq!(result, 8);
}

/// Opens `host` specifically by excluding every other registered host from
/// the mock redirector's candidate pool — the same trick the real
/// replacement-open path uses to steer clear of already-tried servers, just
/// aimed in reverse to pin down one particular host for a test.
fn open_named_host(wire: &MockWire, host: &str) -> <MockWire as Wire>::Handle {
    let exclude: Vec<String> = wire.registered_hosts().into_iter().filter(|h| h != host).collect();
    let name = format!("root://redirector//a.dat?tried={}", exclude.join(","));
    let handle = wire.open_sync(&name, OpenFlags::default(), AccessMode::default()).unwrap();
    assert_eq!(handle.server_id(), host);
    handle
}

/// Admits a second source into the manager's active set directly, the way
/// the periodic check would once it observes a quality-triggered eviction
/// — used by tests that want two active sources without waiting on real
/// wall-clock check cadence.
fn admit_second_source(manager: &RequestManager<MockWire>, wire: &MockWire, host: &str, quality: i64) {
    let handle = open_named_host(wire, host);
    let source = Source::new(
        handle.server_id().to_owned(),
        handle,
        wire.clone(),
        Arc::new(FixedQualityMetric::new(Quality(quality))),
    );
    manager.admit_for_test(source);
}

/// As [`admit_second_source`], but takes an explicit, retained quality
/// metric handle so the test can mutate the admitted source's score after
/// the fact (e.g. to drive it over the eviction watermark).
fn admit_second_source_with_metric(manager: &RequestManager<MockWire>, wire: &MockWire, host: &str, quality: Arc<FixedQualityMetric>) {
    let handle = open_named_host(wire, host);
    let source = Source::new(handle.server_id().to_owned(), handle, wire.clone(), quality as Arc<dyn QualityMetric>);
    manager.admit_for_test(source);
}
