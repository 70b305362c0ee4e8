//! Static fields, static methods and reflection

use super::harness::*;
use vessel_engine::{HostValue, ValueKind};
use vessel_runtime::{ErrorCode, VesselConfig, VesselError};

#[test]
fn test_static_int_round_trip() {
    let vm = running_game(VesselConfig::default());
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 0);
    vm.set_static_int("Game", "score", 42).unwrap();
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 42);
    // Visible to bytecode too
    assert_eq!(vm.call_static("Game", "bump", &[]).unwrap(), HostValue::Int(43));
}

#[test]
fn test_typed_accessors() {
    let vm = running_game(VesselConfig::default());
    assert_eq!(vm.get_static_string("Game", "title").unwrap(), "vessel");
    assert_eq!(vm.get_static_float("Game", "speed").unwrap(), 1.5);

    vm.set_static_string("Game", "title", "renamed").unwrap();
    vm.set_static_float("Game", "speed", 2.25).unwrap();
    vm.set_static_bool("Game", "started", false).unwrap();
    assert_eq!(vm.get_static_string("Game", "title").unwrap(), "renamed");
    assert_eq!(vm.get_static_float("Game", "speed").unwrap(), 2.25);
    assert!(!vm.get_static_bool("Game", "started").unwrap());
}

#[test]
fn test_type_errors() {
    let vm = running_game(VesselConfig::default());

    match vm.get_static_string("Game", "score") {
        Err(VesselError::TypeMismatch { expected, found }) => {
            assert_eq!(expected, ValueKind::String);
            assert_eq!(found, ValueKind::Int);
        }
        other => panic!("expected TypeMismatch, got {other:?}"),
    }
    assert!(matches!(
        vm.set_static_string("Game", "score", "high"),
        Err(VesselError::TypeMismatch { .. })
    ));
    assert_eq!(vm.error_code(), ErrorCode::TypeMismatch);

    // Typed fields accept null, and typed getters report it
    vm.set_static("Game", "title", HostValue::Null).unwrap();
    assert!(matches!(
        vm.get_static_string("Game", "title"),
        Err(VesselError::NullValue(_))
    ));
    assert_eq!(vm.error_code(), ErrorCode::NullValue);
}

#[test]
fn test_lookup_errors() {
    let vm = running_game(VesselConfig::default());
    assert!(matches!(
        vm.get_static_int("Nope", "score"),
        Err(VesselError::TypeNotFound(_))
    ));
    assert!(matches!(
        vm.get_static_int("Game", "nope"),
        Err(VesselError::FieldNotFound(_))
    ));
    assert!(matches!(
        vm.call_static("Game", "nope", &[]),
        Err(VesselError::MethodNotFound(_))
    ));
    assert!(matches!(vm.find_type("Nope"), Err(VesselError::TypeNotFound(_))));
}

#[test]
fn test_call_function_by_name() {
    let vm = running_game(VesselConfig::default());
    let sum = vm
        .call_function("add", &[HostValue::Int(2), HostValue::Int(40)])
        .unwrap();
    assert_eq!(sum, HostValue::Int(42));
    assert!(matches!(
        vm.call_function("add", &[HostValue::Int(2)]),
        Err(VesselError::InvalidArgument(_))
    ));
}

#[test]
fn test_reflection() {
    let vm = running_game(VesselConfig::default());
    let game = vm.find_type("Game").unwrap();
    assert_eq!(game.name, "Game");
    let fields: Vec<_> = game.fields.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(fields, vec!["score", "started", "title", "speed"]);
    assert_eq!(game.fields[0].kind, Some(ValueKind::Int));
    assert_eq!(game.methods, vec!["bump".to_string(), "version".to_string()]);

    let types = vm.list_types().unwrap();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0], game);
}

#[test]
fn test_access_requires_a_module() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    assert!(matches!(
        vm.get_static_int("Game", "score"),
        Err(VesselError::NotInitialized(_))
    ));
    assert!(matches!(vm.list_types(), Err(VesselError::NotInitialized(_))));
}

#[test]
fn test_explicit_collection() {
    let vm = running_game(VesselConfig::default());
    for i in 0..50 {
        vm.set_static_string("Game", "title", &format!("title {i}")).unwrap();
    }
    let before = vm.gc_stats().unwrap();
    let after = vm.collect_garbage().unwrap();
    assert_eq!(after.collections, before.collections + 1);
    // Only the current title survives
    assert_eq!(after.live_objects, 1);
    assert_eq!(vm.get_static_string("Game", "title").unwrap(), "title 49");
}
