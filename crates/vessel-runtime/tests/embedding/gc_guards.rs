//! Worker registration, blocking brackets and collector pauses

use super::harness::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use vessel_runtime::{ErrorCode, IntegrationMode, VesselConfig, VesselError};

#[test]
fn test_guard_balance() {
    let vm = running_game(VesselConfig::default());
    vm.blocking_begin().unwrap();
    vm.blocking_begin().unwrap();
    vm.blocking_end().unwrap();
    vm.blocking_end().unwrap();
    assert_eq!(vm.outstanding_blocking(), 0);

    vm.blocking_begin().unwrap();
    vm.blocking_end().unwrap();
    assert!(matches!(vm.blocking_end(), Err(VesselError::UnbalancedGuard(_))));
    assert_eq!(vm.error_code(), ErrorCode::UnbalancedGuard);
    assert_eq!(vm.outstanding_blocking(), 0);
}

#[test]
fn test_guard_released_on_early_return() {
    let vm = running_game(VesselConfig::default());

    let early = |fail: bool| -> Result<(), VesselError> {
        let _bracket = vm.blocking_guard()?;
        if fail {
            return Err(VesselError::InvalidArgument("bail".to_string()));
        }
        Ok(())
    };
    assert!(early(true).is_err());
    assert!(early(false).is_ok());
    assert_eq!(vm.outstanding_blocking(), 0);
}

#[test]
fn test_collection_waits_for_registered_worker_at_safepoint() {
    let vm = running_game(VesselConfig::default());
    let stop = Arc::new(AtomicBool::new(false));

    let worker = {
        let vm = vm.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            let _guard = vm.worker_guard().unwrap();
            while !stop.load(Ordering::SeqCst) {
                vm.safepoint();
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    thread::sleep(Duration::from_millis(20));

    let stats = vm.collect_garbage().unwrap();
    assert_eq!(stats.stalled_pauses, 0);

    stop.store(true, Ordering::SeqCst);
    worker.join().unwrap();
}

#[test]
fn test_unresponsive_worker_stalls_instead_of_hanging() {
    let mut config = VesselConfig::default();
    config.gc.pause_timeout_ms = 30;
    let vm = running_game(config);
    let release = Arc::new(AtomicBool::new(false));

    let (registered_tx, registered_rx) = std::sync::mpsc::channel();
    let worker = {
        let vm = vm.clone();
        let release = release.clone();
        thread::spawn(move || {
            let _guard = vm.worker_guard().unwrap();
            registered_tx.send(()).unwrap();
            // Never polls
            while !release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    registered_rx.recv().unwrap();

    assert!(matches!(vm.collect_garbage(), Err(VesselError::Timeout(_))));
    assert_eq!(vm.gc_stats().unwrap().stalled_pauses, 1);

    release.store(true, Ordering::SeqCst);
    worker.join().unwrap();
    vm.collect_garbage().unwrap();
}

#[test]
fn test_blocking_worker_does_not_hold_up_collection() {
    let mut config = VesselConfig::default();
    config.gc.pause_timeout_ms = 30;
    let vm = running_game(config);
    let release = Arc::new(AtomicBool::new(false));

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();
    let worker = {
        let vm = vm.clone();
        let release = release.clone();
        thread::spawn(move || {
            let _guard = vm.worker_guard().unwrap();
            let _bracket = vm.blocking_guard().unwrap();
            ready_tx.send(()).unwrap();
            while !release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    ready_rx.recv().unwrap();

    assert_eq!(vm.outstanding_blocking(), 1);
    let stats = vm.collect_garbage().unwrap();
    assert_eq!(stats.stalled_pauses, 0);

    release.store(true, Ordering::SeqCst);
    worker.join().unwrap();
    assert_eq!(vm.outstanding_blocking(), 0);
}

#[test]
fn test_host_brackets_stay_balanced_while_vm_thread_runs() {
    let mut config = VesselConfig::default();
    config.gc.pause_timeout_ms = 200;
    let vm = loaded_with(config, &game_module(1, false));
    vm.set_mode(IntegrationMode::Threaded).unwrap();
    vm.start().unwrap();

    assert!(matches!(vm.blocking_end(), Err(VesselError::UnbalancedGuard(_))));
    assert_eq!(vm.outstanding_blocking(), 0);

    // The idle host thread must not hold up a collection on the VM thread
    let (tx, rx) = mpsc::channel();
    let remote = vm.clone();
    vm.call_async_with(
        move || remote.collect_garbage(),
        move |outcome| tx.send(outcome).unwrap(),
    )
    .unwrap();
    let stats = rx
        .recv_timeout(Duration::from_secs(5))
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(stats.stalled_pauses, 0);

    vm.stop().unwrap();
    assert!(matches!(vm.blocking_end(), Err(VesselError::UnbalancedGuard(_))));
    vm.blocking_begin().unwrap();
    vm.blocking_end().unwrap();
    assert_eq!(vm.outstanding_blocking(), 0);
    vm.destroy().unwrap();
}

#[test]
fn test_registered_worker_reads_statics() {
    let vm = running_game(VesselConfig::default());
    vm.set_static_int("Game", "score", 9).unwrap();

    let worker = vm.clone();
    let score = thread::spawn(move || {
        let _guard = worker.worker_guard().unwrap();
        worker.get_static_int("Game", "score")
    })
    .join()
    .unwrap();
    assert_eq!(score.unwrap(), 9);

    // Without registration the init thread keeps the VM to itself
    let stranger = vm.clone();
    let result = thread::spawn(move || stranger.get_static_int("Game", "score"))
        .join()
        .unwrap();
    assert!(matches!(result, Err(VesselError::WrongThread(_))));
}

#[test]
fn test_registered_worker_waits_for_the_vm_instead_of_failing() {
    let vm = running_game(VesselConfig::default());
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let vm = vm.clone();
            thread::spawn(move || {
                let _guard = vm.worker_guard().unwrap();
                for _ in 0..50 {
                    vm.call_static("Game", "bump", &[]).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 200);
}

#[test]
fn test_guards_after_destroy() {
    let vm = running_game(VesselConfig::default());
    vm.destroy().unwrap();
    assert!(matches!(vm.worker_register(), Err(VesselError::NotInitialized(_))));
    assert!(matches!(vm.blocking_begin(), Err(VesselError::NotInitialized(_))));
}
