// End-to-end event lifecycle against the simulated bus
use bps_event::{
    BridgeConfig, BridgeError, CallbackFailure, CancellationToken, DuplicatePolicy, EventBridge,
    EventRequest, EventState, NativeBus, Payload, PayloadValue, SerializeMode, SimulatedBus,
    TrackingAllocator,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Harness {
    bridge: EventBridge,
    bus: Arc<SimulatedBus>,
    alloc: Arc<TrackingAllocator>,
    failures: Arc<Mutex<Vec<String>>>,
}

fn harness(config: BridgeConfig) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = Arc::new(SimulatedBus::new());
    let alloc = Arc::new(TrackingAllocator::new());
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink_failures = failures.clone();
    let bridge = EventBridge::builder(bus.clone())
        .with_allocator(alloc.clone())
        .with_config(config)
        .with_error_sink(Arc::new(move |failure: CallbackFailure| {
            sink_failures.lock().push(failure.to_string());
        }))
        .build();

    Harness {
        bridge,
        bus,
        alloc,
        failures,
    }
}

#[test]
fn payload_round_trips_through_native_event() {
    let h = harness(BridgeConfig::default());
    let payload = Payload::new()
        .with_data1(-17i32)
        .with_data2(std::f64::consts::PI)
        .with_data3(vec![0xDEu8, 0xAD, 0xBE, 0xEF]);

    let mut event = h
        .bridge
        .create_event_with_payload(0x0ABC, 0xBEEF, payload.clone())
        .unwrap();

    assert_eq!(event.domain().unwrap(), 0x0ABC);
    assert_eq!(event.code().unwrap(), 0xBEEF);
    assert_eq!(event.payload().unwrap(), payload);

    event.dispose().unwrap();
    assert_eq!(h.alloc.stats().live_blocks, 0);
    assert!(h.bridge.pointers().is_empty());
}

#[test]
fn round_trip_keeps_absent_slots_absent() {
    let h = harness(BridgeConfig::default());
    let payload = Payload::new().with_data2('x');

    let event = h.bridge.create_event_with_payload(1, 1, payload).unwrap();
    let recovered = event.payload().unwrap();
    assert!(recovered.data1.is_none());
    assert_eq!(recovered.data2, Some(PayloadValue::Char('x')));
    assert!(recovered.data3.is_none());
}

#[test]
fn pinned_payload_round_trips_opaque_values() {
    let h = harness(BridgeConfig::new().with_pinned_by_default(true));
    let shared = Arc::new(String::from("owned by the caller"));
    let payload = Payload::new()
        .with_data1(PayloadValue::Opaque(shared.clone()))
        .with_data2(9u64);

    let mut event = h.bridge.create_event_with_payload(2, 2, payload).unwrap();
    let recovered = event.payload().unwrap();
    let value = recovered.data1.as_ref().unwrap();
    assert_eq!(value.downcast_ref::<String>().unwrap(), "owned by the caller");
    // Pinned values never touch the native allocator; only the envelope does
    assert_eq!(h.alloc.stats().live_blocks, 1);

    drop(recovered);
    event.dispose().unwrap();
    assert_eq!(Arc::strong_count(&shared), 1);
    assert_eq!(h.alloc.stats().live_blocks, 0);
}

#[test]
fn per_payload_mode_overrides_default() {
    let h = harness(BridgeConfig::new().with_pinned_by_default(true));
    let payload = Payload::new().with_data1(5u32).with_mode(SerializeMode::Copied);

    let _event = h.bridge.create_event_with_payload(3, 3, payload).unwrap();
    // Copied token plus envelope
    assert_eq!(h.alloc.stats().live_blocks, 2);
}

#[test]
fn empty_payload_allocates_nothing() {
    let h = harness(BridgeConfig::default());
    let mut event = h.bridge.create_event(4, 4).unwrap();

    let handle = event.handle().unwrap();
    assert!(h.bus.payload(handle).is_null());
    assert!(event.payload().unwrap().is_empty());
    assert_eq!(h.alloc.stats().allocations, 0);

    event.dispose().unwrap();
    assert_eq!(h.alloc.stats().allocations, 0);
}

#[test]
fn teardown_is_idempotent() {
    let h = harness(BridgeConfig::default());
    let mut event = h
        .bridge
        .create_event_with_payload(5, 5, Payload::new().with_data1("once"))
        .unwrap();
    let handle = event.handle().unwrap();

    // Completion reclaims the payload, then disposal runs the completion again
    h.bus.deliver_completion(handle);
    h.bridge.complete(handle);
    event.dispose().unwrap();

    let stats = h.alloc.stats();
    assert_eq!(stats.allocations, stats.deallocations);
    assert_eq!(stats.live_blocks, 0);
}

#[test]
fn out_of_range_arguments_touch_nothing() {
    let h = harness(BridgeConfig::default());
    let payload = Payload::new().with_data1(1u8);

    for (domain, code) in [(0x1000, 0), (-1, 0), (0, 0x1_0000)] {
        let err = h
            .bridge
            .create(EventRequest::new(domain, code).with_payload(payload.clone()))
            .unwrap_err();
        assert!(matches!(err, BridgeError::ArgumentOutOfRange { .. }), "{:?}", err);
    }

    assert_eq!(h.alloc.stats().allocations, 0);
    assert_eq!(h.bus.stats().created, 0);
}

#[test]
fn boundary_arguments_are_accepted() {
    let h = harness(BridgeConfig::default());
    let event = h.bridge.create_event(0x0FFF, 0xFFFF).unwrap();
    assert_eq!(event.domain().unwrap(), 0x0FFF);
    assert_eq!(event.code().unwrap(), 0xFFFF);
}

#[test]
fn native_failure_releases_payload() {
    let h = harness(BridgeConfig::default());
    h.bus.fail_next_create(12);

    let called = Arc::new(AtomicUsize::new(0));
    let seen = called.clone();
    let err = h
        .bridge
        .create_event_with_completion(1, 1, Payload::new().with_data1(1i64), move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, BridgeError::NativeCallFailure { errno: 12, .. }));
    assert_eq!(h.alloc.stats().live_blocks, 0);
    assert!(h.bridge.completions().is_empty());
    assert_eq!(called.load(Ordering::SeqCst), 0);
}

#[test]
fn disposability_rules() {
    let h = harness(BridgeConfig::default());
    let mut event = h.bridge.create_event(6, 6).unwrap();
    assert!(event.is_disposable());

    event.dispose().unwrap();
    assert!(matches!(event.dispose(), Err(BridgeError::Disposed)));

    let wrapper_result = Arc::new(Mutex::new(None));
    let slot = wrapper_result.clone();
    let bridge = h.bridge.clone();
    let event = h
        .bridge
        .create_event_with_completion(6, 7, Payload::new(), move |wrapper| {
            assert!(!wrapper.is_disposable());
            let mut adopted = bridge.adopt(wrapper.handle()?, None)?;
            *slot.lock() = Some(adopted.dispose());
            Ok(())
        })
        .unwrap();
    h.bus.deliver_completion(event.handle().unwrap());

    let result = wrapper_result.lock().take().unwrap();
    assert!(matches!(result, Err(BridgeError::InvalidOperation(_))));
    assert!(h.bus.is_live(event.handle().unwrap()));
}

#[test]
fn completion_runs_once_and_survives_duplicates() {
    let h = harness(BridgeConfig::default());
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();

    let mut event = h
        .bridge
        .create_event_with_completion(0x21, 0x42, Payload::new().with_data1("bye"), move |wrapper| {
            assert!(!wrapper.is_disposable());
            seen.lock().push((wrapper.domain()?, wrapper.code()?));
            Ok(())
        })
        .unwrap();
    let handle = event.handle().unwrap();
    assert!(h.bridge.completions().is_registered(handle));

    assert!(h.bus.deliver_completion(handle));
    assert!(h.bus.deliver_completion(handle));
    h.bridge.complete(handle);

    assert_eq!(*calls.lock(), vec![(0x21, 0x42)]);
    assert!(h.bridge.completions().is_empty());
    assert_eq!(h.alloc.stats().live_blocks, 0);
    assert!(h.failures.lock().is_empty());

    event.dispose().unwrap();
    assert_eq!(calls.lock().len(), 1);
}

#[test]
fn repeated_completion_spares_the_next_event() {
    let h = harness(BridgeConfig::default());

    let first = h
        .bridge
        .create(
            EventRequest::new(1, 1)
                .with_payload(Payload::new().with_data1(1u8))
                .track_completion(),
        )
        .unwrap();
    let stale = first.handle().unwrap();
    assert!(h.bus.deliver_completion(stale));
    assert_eq!(h.alloc.stats().live_blocks, 0);

    // The freed blocks are free for the allocator to hand to this event
    let mut second = h
        .bridge
        .create_event_with_payload(1, 2, Payload::new().with_data1(7u8))
        .unwrap();
    let before = h.alloc.stats();

    h.bridge.complete(stale);
    assert!(h.bus.deliver_completion(stale));

    assert_eq!(h.alloc.stats(), before);
    assert_eq!(second.payload().unwrap().data1, Some(PayloadValue::U8(7)));
    assert!(matches!(first.payload(), Err(BridgeError::ForeignToken { .. })));

    second.dispose().unwrap();
    drop(first);
    let stats = h.alloc.stats();
    assert_eq!(stats.live_blocks, 0);
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(stats.allocations, stats.deallocations);
}

#[test]
fn completion_before_create_returns_is_handled() {
    let h = harness(BridgeConfig::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();

    h.bus.complete_next_create_early();
    let mut event = h
        .bridge
        .create_event_with_completion(3, 4, Payload::new().with_data1(-2i16), move |wrapper| {
            record.lock().push(wrapper.payload()?);
            Ok(())
        })
        .unwrap();

    assert_eq!(*seen.lock(), vec![Payload::new().with_data1(-2i16)]);
    assert!(h.bridge.completions().is_empty());
    assert_eq!(h.alloc.stats().live_blocks, 0);
    assert!(h.bridge.pointers().is_empty());
    assert!(h.failures.lock().is_empty());

    // Destroying still goes through the bus, without a second callback
    let handle = event.handle().unwrap();
    event.dispose().unwrap();
    assert!(!h.bus.is_live(handle));
    assert_eq!(seen.lock().len(), 1);
}

#[test]
fn dispose_delivers_pending_completion() {
    let h = harness(BridgeConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let mut event = h
        .bridge
        .create(
            EventRequest::new(1, 2)
                .with_payload(Payload::new().with_data1(3i16))
                .on_complete(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        )
        .unwrap();

    event.dispose().unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.alloc.stats().live_blocks, 0);
}

#[test]
fn cancellation_invalidates_without_destroying() {
    let h = harness(BridgeConfig::default());
    let token = CancellationToken::new();
    let mut event = h
        .bridge
        .create(
            EventRequest::new(8, 8)
                .with_payload(Payload::new().with_data1(1u32))
                .with_cancellation(token.clone()),
        )
        .unwrap();
    let handle = event.handle().unwrap();

    token.cancel();
    assert!(matches!(event.domain(), Err(BridgeError::Disposed)));
    assert!(matches!(event.code(), Err(BridgeError::Disposed)));
    assert!(matches!(event.payload(), Err(BridgeError::Disposed)));
    assert!(matches!(event.handle(), Err(BridgeError::Disposed)));
    assert_eq!(event.state(), EventState::Cancelled);
    assert!(h.bus.is_live(handle));

    event.dispose().unwrap();
    assert!(!h.bus.is_live(handle));
    assert_eq!(h.alloc.stats().live_blocks, 0);
}

#[test]
fn cancellation_from_another_thread() {
    let h = harness(BridgeConfig::default());
    let token = CancellationToken::new();
    let event = h
        .bridge
        .create(EventRequest::new(9, 9).with_cancellation(token.clone()))
        .unwrap();
    assert!(event.is_valid());

    std::thread::spawn(move || token.cancel()).join().unwrap();
    assert!(!event.is_valid());
    assert!(matches!(event.code(), Err(BridgeError::Disposed)));
}

#[test]
fn callback_errors_and_panics_are_contained() {
    let h = harness(BridgeConfig::default());

    let failing = h
        .bridge
        .create_event_with_completion(1, 1, Payload::new().with_data1(1u8), |_| {
            anyhow::bail!("callback failed on purpose")
        })
        .unwrap();
    let panicking = h
        .bridge
        .create_event_with_completion(1, 2, Payload::new().with_data1(2u8), |_| {
            panic!("callback panicked on purpose")
        })
        .unwrap();

    h.bus.deliver_completion(failing.handle().unwrap());
    h.bus.deliver_completion(panicking.handle().unwrap());

    let failures = h.failures.lock().clone();
    assert_eq!(failures.len(), 2);
    assert!(failures[0].contains("callback failed on purpose"));
    assert!(failures[1].contains("callback panicked on purpose"));
    // Payloads were still reclaimed
    assert_eq!(h.alloc.stats().live_blocks, 0);
}

#[test]
fn duplicate_registration_policy() {
    let h = harness(BridgeConfig::default());
    let event = h.bridge.create(EventRequest::new(1, 1).track_completion()).unwrap();
    let handle = event.handle().unwrap();

    let err = h
        .bridge
        .register_completion(handle, Box::new(|_| Ok(())))
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateCompletion(dup) if dup == handle));

    let h2 = harness(BridgeConfig::new().with_duplicate_completion(DuplicatePolicy::Overwrite));
    let event = h2.bridge.create(EventRequest::new(1, 1).track_completion()).unwrap();
    h2.bridge
        .register_completion(event.handle().unwrap(), Box::new(|_| Ok(())))
        .unwrap();
    assert_eq!(h2.bridge.completions().len(), 1);
}

#[test]
fn dropped_event_is_finalized() {
    let h = harness(BridgeConfig::default());
    let handle = {
        let event = h
            .bridge
            .create_event_with_payload(1, 1, Payload::new().with_data1("dropped"))
            .unwrap();
        event.handle().unwrap()
    };

    assert!(!h.bus.is_live(handle));
    assert_eq!(h.alloc.stats().live_blocks, 0);
}
