//! Hot reload: enablement rules, state preservation and file polling

use super::harness::*;
use parking_lot::Mutex;
use std::sync::Arc;
use vessel_engine::bytecode::Constant;
use vessel_engine::HostValue;
use vessel_runtime::{ErrorCode, ExecutionSetting, Vessel, VesselConfig, VesselError};

fn version(vm: &Vessel) -> i32 {
    vm.call_static("Game", "version", &[])
        .unwrap()
        .as_int()
        .unwrap()
}

fn reloadable() -> Vessel {
    let vm = loaded_with(VesselConfig::default(), &game_module(1, false));
    vm.enable_hot_reload(true).unwrap();
    vm.call_entry().unwrap();
    vm
}

#[test]
fn test_disabled_reload_fails_and_module_stays_callable() {
    let vm = running_game(VesselConfig::default());
    assert!(!vm.is_hot_reload_enabled());
    vm.set_static_int("Game", "score", 9).unwrap();

    match vm.reload_from_memory(&game_module(2, false).encode()) {
        Err(VesselError::ReloadNotEnabled) => {}
        other => panic!("expected ReloadNotEnabled, got {other:?}"),
    }
    assert_eq!(vm.error_code(), ErrorCode::ReloadNotEnabled);
    assert_eq!(version(&vm), 1);
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 9);
    assert_eq!(vm.call_static("Game", "bump", &[]).unwrap(), HostValue::Int(10));
}

#[test]
fn test_reload_swaps_code_and_keeps_statics() {
    let vm = reloadable();
    vm.set_static_int("Game", "score", 99).unwrap();

    let report = vm.reload_from_memory(&game_module(2, true).encode()).unwrap();
    assert!(report.changed);
    assert_eq!(report.statics_preserved, 4);
    assert_eq!(report.statics_added, 1);

    assert_eq!(version(&vm), 2);
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 99);
    assert_eq!(vm.get_static_int("Game", "lives").unwrap(), 3);
    assert!(vm.get_static_bool("Game", "started").unwrap());
}

#[test]
fn test_identical_reload_reports_unchanged() {
    let vm = reloadable();
    let report = vm.reload_from_memory(&game_module(1, false).encode()).unwrap();
    assert!(!report.changed);
}

#[test]
fn test_incompatible_reload_is_all_or_nothing() {
    let vm = reloadable();
    vm.set_static_int("Game", "score", 7).unwrap();

    let changed_kind = game_module_with_score(2, true, Constant::Str("high".into()));
    assert!(matches!(
        vm.reload_from_memory(&changed_kind.encode()),
        Err(VesselError::ReloadFailed(_))
    ));
    assert!(matches!(
        vm.reload_from_memory(b"VSLB garbage"),
        Err(VesselError::ReloadFailed(_))
    ));
    assert_eq!(vm.error_code(), ErrorCode::ReloadFailed);

    assert_eq!(version(&vm), 1);
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 7);
    assert!(matches!(
        vm.get_static_int("Game", "lives"),
        Err(VesselError::FieldNotFound(_))
    ));
}

#[test]
fn test_enablement_must_precede_entry() {
    let vm = loaded_with(VesselConfig::default(), &game_module(1, false));
    vm.enable_hot_reload(true).unwrap();
    // Reload needs the entry point to have run
    assert!(matches!(
        vm.reload_from_memory(&game_module(2, false).encode()),
        Err(VesselError::RequiresPriorEntry(_))
    ));
    vm.call_entry().unwrap();

    assert!(matches!(
        vm.enable_hot_reload(false),
        Err(VesselError::RequiresPriorEntry(_))
    ));
    assert_eq!(vm.error_code(), ErrorCode::RequiresPriorEntry);
    assert!(vm.is_hot_reload_enabled());
}

#[test]
fn test_enabled_from_config() {
    let mut config = VesselConfig::default();
    config.hot_reload.enabled = true;
    let vm = running_game(config);
    assert!(vm.is_hot_reload_enabled());
    vm.reload_from_memory(&game_module(2, false).encode()).unwrap();
    assert_eq!(version(&vm), 2);
}

#[test]
fn test_static_execution_cannot_reload() {
    let mut config = VesselConfig::default();
    config.vm.execution = ExecutionSetting::Static;
    let vm = loaded_with(config, &game_module(1, false));
    assert!(!vm.is_jit_mode());
    vm.enable_hot_reload(true).unwrap();
    vm.call_entry().unwrap();

    assert!(matches!(
        vm.reload_from_memory(&game_module(2, false).encode()),
        Err(VesselError::ReloadNotSupported)
    ));
    assert_eq!(version(&vm), 1);
}

#[test]
fn test_callback_sees_every_attempt() {
    let vm = reloadable();
    let outcomes = Arc::new(Mutex::new(Vec::new()));
    let sink = outcomes.clone();
    vm.set_reload_callback(Some(move |ok: bool| sink.lock().push(ok)));

    vm.reload_from_memory(&game_module(2, false).encode()).unwrap();
    let _ = vm.reload_from_memory(b"nope");
    vm.reload_from_memory(&game_module(3, false).encode()).unwrap();
    assert_eq!(*outcomes.lock(), vec![true, false, true]);

    vm.set_reload_callback(None::<fn(bool)>);
    vm.reload_from_memory(&game_module(4, false).encode()).unwrap();
    assert_eq!(outcomes.lock().len(), 3);
}

#[test]
fn test_reload_from_file_and_check_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_module(dir.path(), "game.vbc", &game_module(1, false));

    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    vm.load_file(&path).unwrap();
    vm.enable_hot_reload(true).unwrap();
    vm.call_entry().unwrap();

    assert!(!vm.check_reload().unwrap());

    // Different length, so the signature changes even within one mtime tick
    write_module(dir.path(), "game.vbc", &game_module(2, true));
    assert!(vm.check_reload().unwrap());
    assert_eq!(version(&vm), 2);
    assert!(!vm.check_reload().unwrap());

    write_module(dir.path(), "game.vbc", &game_module(3, false));
    vm.reload_current().unwrap();
    assert_eq!(version(&vm), 3);

    let other = write_module(dir.path(), "other.vbc", &game_module(4, true));
    vm.reload_from_file(&other).unwrap();
    assert_eq!(version(&vm), 4);

    assert!(matches!(
        vm.reload_from_file(dir.path().join("missing.vbc")),
        Err(VesselError::FileNotFound { .. })
    ));
}

#[test]
fn test_reload_current_needs_a_file() {
    let vm = reloadable();
    assert!(matches!(
        vm.reload_current(),
        Err(VesselError::InvalidArgument(_))
    ));
    assert!(!vm.check_reload().unwrap());
}
