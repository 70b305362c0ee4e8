//! Threaded integration: the VM thread, call_sync and call_async

use super::harness::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use vessel_engine::HostValue;
use vessel_runtime::{
    EngineStatus, IntegrationMode, LifecycleState, Vessel, VesselConfig, VesselError,
};

fn threaded(config: VesselConfig) -> Vessel {
    let vm = loaded_with(config, &game_module(1, false));
    vm.set_mode(IntegrationMode::Threaded).unwrap();
    vm.start().unwrap();
    vm
}

fn bump(vm: &Vessel) -> i32 {
    let remote = vm.clone();
    let value = vm
        .call_sync(move || remote.call_static("Game", "bump", &[]))
        .unwrap()
        .unwrap();
    value.as_int().unwrap()
}

#[test]
fn test_call_sync_runs_on_vm_thread() {
    let vm = threaded(VesselConfig::default());
    assert!(vm.is_running());
    assert!(!vm.is_vm_thread());

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    let remote = vm.clone();
    let on_vm_thread = vm
        .call_sync(move || {
            seen.fetch_add(1, Ordering::SeqCst);
            remote.is_vm_thread()
        })
        .unwrap();
    assert!(on_vm_thread);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // The VM thread ran the entry point before serving calls
    let remote = vm.clone();
    let state = vm.call_sync(move || remote.state()).unwrap();
    assert_eq!(state, LifecycleState::EntryRan);

    vm.stop().unwrap();
    assert!(!vm.is_running());
    assert_eq!(vm.engine_status(), EngineStatus::Stopped);
    vm.destroy().unwrap();
}

#[test]
fn test_call_sync_preserves_per_thread_order() {
    let vm = threaded(VesselConfig::default());
    for expected in 1..=20 {
        assert_eq!(bump(&vm), expected);
    }

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let vm = vm.clone();
            thread::spawn(move || {
                let mut last = 0;
                for _ in 0..25 {
                    let value = bump(&vm);
                    assert!(value > last, "{value} after {last}");
                    last = value;
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(bump(&vm), 121);
    vm.destroy().unwrap();
}

#[test]
fn test_call_sync_from_vm_thread_fails_without_deadlock() {
    let vm = threaded(VesselConfig::default());
    let remote = vm.clone();
    let nested = vm
        .call_sync(move || remote.call_sync(|| 1))
        .unwrap();
    assert!(matches!(nested, Err(VesselError::WrongThread(_))));

    // The VM thread is still serving
    assert_eq!(bump(&vm), 1);
    vm.destroy().unwrap();
}

#[test]
fn test_panicking_call_is_reported() {
    let vm = threaded(VesselConfig::default());
    let result: Result<(), _> = vm.call_sync(|| panic!("host bug"));
    match result {
        Err(VesselError::CallFailed(message)) => assert!(message.contains("host bug")),
        other => panic!("expected CallFailed, got {other:?}"),
    }
    assert!(vm.is_running());
    assert_eq!(bump(&vm), 1);
    vm.destroy().unwrap();
}

#[test]
fn test_call_async_runs_in_order_with_completion() {
    let vm = threaded(VesselConfig::default());
    let (tx, rx) = mpsc::channel();
    for _ in 0..5 {
        let remote = vm.clone();
        let tx = tx.clone();
        vm.call_async_with(
            move || remote.call_static("Game", "bump", &[]),
            move |outcome| {
                let value = outcome.ok().and_then(Result::ok);
                tx.send(value).unwrap();
            },
        )
        .unwrap();
    }
    let results: Vec<_> = (0..5)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    let expected: Vec<_> = (1..=5).map(|i| Some(HostValue::Int(i))).collect();
    assert_eq!(results, expected);

    let counter = Arc::new(AtomicUsize::new(0));
    let seen = counter.clone();
    vm.call_async(move || seen.fetch_add(1, Ordering::SeqCst)).unwrap();
    // stop() drains queued work
    vm.stop().unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    vm.destroy().unwrap();
}

#[test]
fn test_host_thread_is_locked_out_while_running() {
    let vm = threaded(VesselConfig::default());
    assert!(matches!(
        vm.get_static_int("Game", "score"),
        Err(VesselError::WrongThread(_))
    ));
    // Either the VM thread is still inside the entry point or it already ran
    assert!(matches!(
        vm.call_entry(),
        Err(VesselError::WrongThread(_)) | Err(VesselError::AlreadyInitialized(_))
    ));

    vm.stop().unwrap();
    // Stopped: the init thread owns the VM again
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 0);
    vm.destroy().unwrap();
}

#[test]
fn test_engine_state_errors() {
    let vm = running_game(VesselConfig::default());
    assert!(matches!(vm.start(), Err(VesselError::InvalidArgument(_))));
    assert!(matches!(vm.call_sync(|| ()), Err(VesselError::ThreadNotStarted)));
    assert!(matches!(vm.call_async(|| ()), Err(VesselError::ThreadNotStarted)));
    // Stopping a stopped engine is a no-op
    vm.stop().unwrap();

    let vm = loaded_with(VesselConfig::default(), &game_module(1, false));
    vm.set_mode(IntegrationMode::Threaded).unwrap();
    vm.start().unwrap();
    assert!(matches!(vm.start(), Err(VesselError::ThreadAlreadyRunning)));
    assert!(matches!(
        vm.set_mode(IntegrationMode::NonThreaded),
        Err(VesselError::InvalidArgument(_))
    ));
    assert_eq!(vm.mode(), IntegrationMode::Threaded);
    vm.destroy().unwrap();
    assert_eq!(vm.engine_status(), EngineStatus::Stopped);
}

#[test]
fn test_start_requires_a_module() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    vm.set_mode(IntegrationMode::Threaded).unwrap();
    assert!(matches!(vm.start(), Err(VesselError::NotInitialized(_))));
}

#[test]
fn test_vm_thread_pumps_events() {
    let mut config = VesselConfig::default();
    config.threading.tick_interval_ms = 1;
    let vm = loaded_with(config, &ticker_module());
    vm.set_mode(IntegrationMode::Threaded).unwrap();
    vm.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remote = vm.clone();
        let frames = vm
            .call_sync(move || remote.get_static_int("Ticker", "frames"))
            .unwrap()
            .unwrap();
        if frames >= 3 {
            break;
        }
        assert!(Instant::now() < deadline, "VM thread never pumped events");
        thread::sleep(Duration::from_millis(5));
    }
    vm.destroy().unwrap();
}

#[test]
fn test_call_sync_timeout() {
    let mut config = VesselConfig::default();
    config.threading.call_timeout_ms = 20;
    let vm = threaded(config);

    let result = vm.call_sync(|| thread::sleep(Duration::from_millis(300)));
    assert!(matches!(result, Err(VesselError::Timeout(_))));
    // Later calls queue behind the slow one, which still runs
    assert!(matches!(vm.call_sync(|| 7), Err(VesselError::Timeout(_))));
    vm.destroy().unwrap();
}

#[test]
fn test_stop_timeout_detaches() {
    let mut config = VesselConfig::default();
    config.threading.stop_timeout_ms = 20;
    let vm = threaded(config);

    vm.call_async(|| thread::sleep(Duration::from_millis(300))).unwrap();
    assert!(matches!(vm.stop(), Err(VesselError::ThreadStopFailed(_))));
    assert_eq!(vm.engine_status(), EngineStatus::Stopping);
    assert!(matches!(vm.call_sync(|| ()), Err(VesselError::ThreadNotStarted)));
}
