//! Lifecycle state machine and error state

use super::harness::*;
use vessel_runtime::{
    ErrorCode, IntegrationMode, LifecycleState, ProcessRegistry, Vessel, VesselConfig, VesselError,
};

#[test]
fn test_file_load_and_frames() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(dir.path(), "game.vbc", &ticker_module());

    let vm = create(VesselConfig::default());
    assert_eq!(vm.state(), LifecycleState::Uninitialized);
    vm.init(&[]).unwrap();
    assert_eq!(vm.state(), LifecycleState::Created);
    vm.load_file(&path).unwrap();
    assert_eq!(vm.state(), LifecycleState::ModuleLoaded);
    assert_eq!(vm.module_name().as_deref(), Some("ticker"));
    vm.call_entry().unwrap();
    assert_eq!(vm.state(), LifecycleState::EntryRan);

    for _ in 0..60 {
        vm.update(0.016).unwrap();
    }
    assert_eq!(vm.get_static_int("Ticker", "frames").unwrap(), 60);
    // 60 frames of 16 ms = 960 ms; a 50 ms timer fires 19 times
    assert_eq!(vm.get_static_int("Ticker", "timer_hits").unwrap(), 19);

    vm.destroy().unwrap();
    assert_eq!(vm.state(), LifecycleState::Destroyed);
    assert_eq!(vm.error_code(), ErrorCode::Ok);
}

#[test]
fn test_second_create_in_same_registry_fails() {
    let registry = ProcessRegistry::new();
    let first = Vessel::create_in(&registry, VesselConfig::default()).unwrap();
    first.init(&[]).unwrap();

    match Vessel::create_in(&registry, VesselConfig::default()) {
        Err(VesselError::AlreadyInitialized(_)) => {}
        other => panic!("expected AlreadyInitialized, got {other:?}"),
    }
    // The original is untouched
    assert_eq!(first.state(), LifecycleState::Created);

    first.destroy().unwrap();
    assert!(matches!(
        Vessel::create_in(&registry, VesselConfig::default()),
        Err(VesselError::AlreadyInitialized(_))
    ));
}

#[test]
fn test_operations_before_init_fail() {
    let vm = create(VesselConfig::default());
    assert!(matches!(
        vm.load_memory(&game_module(1, false).encode()),
        Err(VesselError::NotInitialized(_))
    ));
    assert!(matches!(vm.call_entry(), Err(VesselError::NotInitialized(_))));
    assert_eq!(vm.error_code(), ErrorCode::NotInitialized);
}

#[test]
fn test_init_twice_fails() {
    let vm = create(VesselConfig::default());
    vm.init(&["game".to_string(), "--fast".to_string()]).unwrap();
    assert!(matches!(vm.init(&[]), Err(VesselError::AlreadyInitialized(_))));
    assert_eq!(vm.args(), vec!["game".to_string(), "--fast".to_string()]);
}

#[test]
fn test_load_errors() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();

    match vm.load_file("/nonexistent/game.vbc") {
        Err(VesselError::FileNotFound { .. }) => {}
        other => panic!("expected FileNotFound, got {other:?}"),
    }
    assert_eq!(vm.error_code(), ErrorCode::FileNotFound);

    assert!(matches!(
        vm.load_memory(b"not bytecode"),
        Err(VesselError::InvalidBytecode(_))
    ));
    assert_eq!(vm.state(), LifecycleState::Created);

    // Unresolved native import
    assert!(matches!(
        vm.load_memory(&native_module().encode()),
        Err(VesselError::ModuleLoadFailed(_))
    ));

    vm.load_memory(&game_module(1, false).encode()).unwrap();
    assert!(matches!(
        vm.load_memory(&game_module(1, false).encode()),
        Err(VesselError::AlreadyInitialized(_))
    ));
}

#[test]
fn test_entry_runs_exactly_once() {
    let vm = running_game(VesselConfig::default());
    assert!(vm.get_static_bool("Game", "started").unwrap());
    assert!(matches!(vm.call_entry(), Err(VesselError::AlreadyInitialized(_))));
    assert_eq!(vm.state(), LifecycleState::EntryRan);
}

#[test]
fn test_faulting_entry_stays_loaded() {
    let vm = loaded_with(VesselConfig::default(), &faulty_module());
    match vm.call_entry() {
        Err(VesselError::ExceptionThrown { message, trace }) => {
            assert!(message.contains("boom"), "{message}");
            assert_eq!(trace, vec!["main".to_string()]);
        }
        other => panic!("expected ExceptionThrown, got {other:?}"),
    }
    assert_eq!(vm.state(), LifecycleState::ModuleLoaded);
    assert_eq!(vm.error_code(), ErrorCode::ExceptionThrown);
    assert!(vm.error_message().contains("boom"));
    // Still usable
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 0);
}

#[test]
fn test_destroy_is_final() {
    let vm = running_game(VesselConfig::default());
    vm.destroy().unwrap();

    assert!(matches!(vm.destroy(), Err(VesselError::NotInitialized(_))));
    assert!(matches!(
        vm.call_static("Game", "bump", &[]),
        Err(VesselError::NotInitialized(_))
    ));
    assert!(matches!(vm.update(0.016), Err(VesselError::NotInitialized(_))));
    assert!(matches!(
        vm.set_mode(IntegrationMode::Threaded),
        Err(VesselError::NotInitialized(_))
    ));
    assert!(matches!(vm.start(), Err(VesselError::NotInitialized(_))));
    assert!(!vm.has_pending_work());
}

#[test]
fn test_error_state_is_kept_until_cleared() {
    let vm = running_game(VesselConfig::default());
    assert_eq!(vm.last_error(), None);

    let _ = vm.call_static("Game", "missing", &[]);
    assert_eq!(vm.error_code(), ErrorCode::MethodNotFound);
    assert!(vm.error_message().contains("missing"));

    // Success does not clear it
    vm.call_static("Game", "bump", &[]).unwrap();
    assert_eq!(vm.error_code(), ErrorCode::MethodNotFound);

    vm.clear_error();
    assert_eq!(vm.error_code(), ErrorCode::Ok);
    assert_eq!(vm.error_message(), "");
}

#[test]
fn test_other_thread_is_rejected_in_non_threaded_mode() {
    let vm = running_game(VesselConfig::default());
    let remote = vm.clone();
    let result = std::thread::spawn(move || remote.call_static("Game", "bump", &[]))
        .join()
        .unwrap();
    assert!(matches!(result, Err(VesselError::WrongThread(_))));
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 0);
}

#[test]
fn test_versions() {
    assert!(!Vessel::version().is_empty());
    assert!(!Vessel::runtime_version().is_empty());
    let vm = create(VesselConfig::default());
    assert!(vm.is_jit_mode());
}
