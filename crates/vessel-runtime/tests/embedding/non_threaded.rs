//! Host-driven integration: update(), process() and event sources

use super::harness::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vessel_engine::bytecode::{Constant, ModuleBuilder};
use vessel_engine::{HostValue, Vm, VmError};
use vessel_runtime::{EventLoopKind, EventSource, VesselConfig, VesselError};

#[test]
fn test_update_with_nothing_pending_changes_nothing() {
    let vm = running_game(VesselConfig::default());
    vm.set_static_int("Game", "score", 5).unwrap();

    assert!(!vm.has_pending_work());
    for _ in 0..100 {
        vm.update(0.016).unwrap();
    }
    assert_eq!(vm.get_static_int("Game", "score").unwrap(), 5);
    assert!(vm.get_static_bool("Game", "started").unwrap());
    assert_eq!(vm.process(EventLoopKind::All).unwrap(), 0);
    assert_eq!(vm.last_error(), None);
}

#[test]
fn test_update_before_load_is_a_no_op() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    vm.update(0.016).unwrap();
    assert!(!vm.has_pending_work());
}

#[test]
fn test_update_rejects_bad_delta() {
    let vm = running_game(VesselConfig::default());
    assert!(matches!(vm.update(-1.0), Err(VesselError::InvalidArgument(_))));
    assert!(matches!(vm.update(f64::NAN), Err(VesselError::InvalidArgument(_))));
}

#[test]
fn test_process_selects_sources_by_kind() {
    let vm = loaded_with(VesselConfig::default(), &ticker_module());
    vm.call_entry().unwrap();

    assert!(vm.has_pending(EventLoopKind::Cooperative));
    assert!(!vm.has_pending(EventLoopKind::AsyncIo));
    assert_eq!(vm.process(EventLoopKind::AsyncIo).unwrap(), 0);
    assert_eq!(vm.get_static_int("Ticker", "frames").unwrap(), 0);

    assert!(vm.process(EventLoopKind::Cooperative).unwrap() >= 1);
    assert_eq!(vm.get_static_int("Ticker", "frames").unwrap(), 1);
}

#[test]
fn test_async_read_completes_through_process() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("level.txt");
    std::fs::write(&data, "level one").unwrap();
    let path = data.to_string_lossy().into_owned();

    let mut m = ModuleBuilder::new("loader");
    let main = m.declare("main");
    let on_loaded = m.declare("on_loaded");
    let level = m.class("Level").static_field("text", Constant::Null).index();
    m.define(main, 0, 0, |f| {
        f.const_str(&path).async_read(on_loaded).ret_void();
    });
    m.define(on_loaded, 1, 1, |f| {
        f.load_local(0).store_static(level, 0).ret_void();
    });
    let vm = loaded_with(VesselConfig::default(), &m.build().unwrap());
    vm.call_entry().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !vm.has_pending(EventLoopKind::AsyncIo) {
        assert!(Instant::now() < deadline, "read never completed");
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(vm.process(EventLoopKind::AsyncIo).unwrap(), 1);
    assert_eq!(vm.get_static_string("Level", "text").unwrap(), "level one");
}

#[test]
fn test_faulting_callback_surfaces_as_exception() {
    let mut m = ModuleBuilder::new("faults");
    let main = m.declare("main");
    let bad = m.declare("bad");
    m.define(main, 0, 0, |f| {
        f.const_f64(0.0).timer_add(bad).pop().ret_void();
    });
    m.define(bad, 0, 0, |f| {
        f.throw_str("bad timer");
    });
    let vm = loaded_with(VesselConfig::default(), &m.build().unwrap());
    vm.call_entry().unwrap();

    match vm.update(0.016) {
        Err(VesselError::ExceptionThrown { message, .. }) => assert!(message.contains("bad timer")),
        other => panic!("expected ExceptionThrown, got {other:?}"),
    }
    // The one-shot timer is gone; the next frame is clean
    vm.update(0.016).unwrap();
}

struct CountingSource {
    pending: Arc<AtomicUsize>,
    drained: Arc<Mutex<Vec<Option<f64>>>>,
}

impl EventSource for CountingSource {
    fn name(&self) -> &str {
        "counting"
    }

    fn kind(&self) -> EventLoopKind {
        EventLoopKind::Cooperative
    }

    fn is_present(&self, _vm: &Vm) -> bool {
        true
    }

    fn has_pending(&self, _vm: &Vm, _hint: Option<f64>) -> bool {
        self.pending.load(Ordering::SeqCst) > 0
    }

    fn drain(&mut self, _vm: &mut Vm, hint: Option<f64>) -> Result<usize, VmError> {
        self.drained.lock().push(hint);
        Ok(self.pending.swap(0, Ordering::SeqCst))
    }
}

#[test]
fn test_host_event_source_is_multiplexed() {
    let vm = running_game(VesselConfig::default());
    let pending = Arc::new(AtomicUsize::new(0));
    let drained = Arc::new(Mutex::new(Vec::new()));
    vm.register_event_source(Box::new(CountingSource {
        pending: pending.clone(),
        drained: drained.clone(),
    }));

    assert!(!vm.has_pending_work());
    pending.store(2, Ordering::SeqCst);
    assert!(vm.has_pending_work());
    assert!(!vm.has_pending(EventLoopKind::AsyncIo));

    vm.update(0.25).unwrap();
    assert!(!vm.has_pending_work());
    assert_eq!(vm.process(EventLoopKind::All).unwrap(), 0);
    assert_eq!(*drained.lock(), vec![Some(0.25), None]);
}

#[test]
fn test_natives_are_called_from_bytecode() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    vm.register_native("host.log", move |args: &[HostValue]| -> Result<HostValue, String> {
        log.lock().push(args.to_vec());
        Ok(HostValue::from("ack"))
    })
    .unwrap();
    vm.load_memory(&native_module().encode()).unwrap();
    vm.call_entry().unwrap();

    assert_eq!(*seen.lock(), vec![vec![HostValue::from("hello")]]);
    assert_eq!(vm.get_static("Out", "reply").unwrap(), HostValue::from("ack"));
}

#[test]
fn test_native_error_raises_exception() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    vm.register_native("host.log", |_: &[HostValue]| -> Result<HostValue, String> {
        Err("disk full".to_string())
    })
    .unwrap();
    vm.load_memory(&native_module().encode()).unwrap();
    match vm.call_entry() {
        Err(VesselError::ExceptionThrown { message, .. }) => assert!(message.contains("disk full")),
        other => panic!("expected ExceptionThrown, got {other:?}"),
    }
}

#[test]
fn test_reentrant_native_is_refused() {
    let vm = create(VesselConfig::default());
    vm.init(&[]).unwrap();
    let inner = vm.clone();
    vm.register_native("host.log", move |_: &[HostValue]| -> Result<HostValue, String> {
        match inner.get_static("Out", "reply") {
            Err(VesselError::CallFailed(_)) => Ok(HostValue::from("refused")),
            other => Err(format!("unexpected {other:?}")),
        }
    })
    .unwrap();
    vm.load_memory(&native_module().encode()).unwrap();
    vm.call_entry().unwrap();
    assert_eq!(vm.get_static_string("Out", "reply").unwrap(), "refused");
}
