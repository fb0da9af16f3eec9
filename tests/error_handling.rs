//! Error handling and edge case tests.

use courier::{
    Backpressure, BusConfig, BusError, ErrorCause, ErrorHandler, Handlers, Listener, MessageBus,
    PublicationError, ShutdownPolicy, TypeDecl,
};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Error handler keeping a summary of every report.
#[derive(Default)]
struct Collected {
    reports: Mutex<Vec<Report>>,
}

#[derive(Debug, Clone)]
struct Report {
    handler: String,
    cause: String,
    panicked: bool,
    rejected: bool,
    message: Option<u32>,
    has_listener: bool,
}

impl ErrorHandler for Collected {
    fn handle(&self, error: &PublicationError) {
        self.reports.lock().push(Report {
            handler: error.handler().to_string(),
            cause: error.cause().to_string(),
            panicked: matches!(error.cause(), ErrorCause::Panicked(_)),
            rejected: matches!(error.cause(), ErrorCause::Rejected(_)),
            message: error.message::<u32>().copied(),
            has_listener: error.listener::<Faulty>().is_some(),
        });
    }
}

fn bus_with(errors: &Arc<Collected>, config: BusConfig) -> MessageBus {
    MessageBus::with_config(BusConfig {
        error_handler: Some(errors.clone()),
        ..config
    })
    .unwrap()
}

/// Fails on 13, panics on 666, and records everything its low-priority
/// handler sees.
#[derive(Default)]
struct Faulty {
    after: AtomicUsize,
}

impl Listener for Faulty {
    fn describe(&self, handlers: &mut Handlers<Self>) {
        handlers
            .on::<u32>(|_, n| match *n {
                13 => Err(format!("unlucky {}", n).into()),
                666 => panic!("cursed"),
                _ => Ok(()),
            })
            .priority(10)
            .named("superstitious");
        handlers
            .on::<u32>(|me, _| {
                me.after.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .priority(1);
    }
}

// --- Handler Failures ---

#[test]
fn test_failure_reported_once_and_siblings_run() {
    let errors = Arc::new(Collected::default());
    let bus = bus_with(&errors, BusConfig::default());
    let faulty = Arc::new(Faulty::default());
    bus.subscribe(&faulty).unwrap();

    bus.publish(13u32);

    assert_eq!(faulty.after.load(Ordering::SeqCst), 1);
    let reports = errors.reports.lock();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].handler, "superstitious");
    assert_eq!(reports[0].message, Some(13));
    assert!(reports[0].has_listener);
    assert!(!reports[0].panicked);
    assert!(reports[0].cause.contains("unlucky 13"));
}

#[test]
fn test_panic_is_contained() {
    let errors = Arc::new(Collected::default());
    let bus = bus_with(&errors, BusConfig::default());
    let faulty = Arc::new(Faulty::default());
    bus.subscribe(&faulty).unwrap();

    bus.publish(666u32);
    bus.publish(1u32);

    assert_eq!(faulty.after.load(Ordering::SeqCst), 2);
    let reports = errors.reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].panicked);
    assert!(reports[0].cause.contains("cursed"));
}

#[test]
fn test_async_failures_are_reported() {
    let errors = Arc::new(Collected::default());
    let bus = bus_with(&errors, BusConfig::default());
    let faulty = Arc::new(Faulty::default());
    bus.subscribe(&faulty).unwrap();

    bus.publish_async(13u32).unwrap();
    bus.publish_async(666u32).unwrap();
    assert!(bus.shutdown(Duration::from_secs(5)));

    assert_eq!(faulty.after.load(Ordering::SeqCst), 2);
    assert_eq!(errors.reports.lock().len(), 2);
}

#[test]
fn test_panicking_error_handler_is_contained() {
    let bus = MessageBus::with_config(BusConfig {
        error_handler: Some(Arc::new(|_: &PublicationError| panic!("sink is broken"))),
        ..Default::default()
    })
    .unwrap();
    let faulty = Arc::new(Faulty::default());
    bus.subscribe(&faulty).unwrap();

    bus.publish(13u32);
    bus.publish(2u32);
    assert_eq!(faulty.after.load(Ordering::SeqCst), 2);
}

#[test]
fn test_default_error_handler_logs() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let bus = MessageBus::new().unwrap();
    let faulty = Arc::new(Faulty::default());
    bus.subscribe(&faulty).unwrap();

    bus.publish(13u32);
    assert_eq!(faulty.after.load(Ordering::SeqCst), 1);
}

#[test]
fn test_publication_error_display() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let bus = MessageBus::with_config(BusConfig {
        error_handler: Some(Arc::new(move |e: &PublicationError| {
            sink.lock().push(e.to_string())
        })),
        ..Default::default()
    })
    .unwrap();
    let faulty = Arc::new(Faulty::default());
    bus.subscribe(&faulty).unwrap();

    bus.publish(13u32);
    let seen = seen.lock();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("superstitious failed on u32"));
}

// --- Backpressure ---

/// Blocks every handler invocation until released.
struct Gated {
    started: Sender<()>,
    gate: Receiver<()>,
    done: AtomicUsize,
}

impl Listener for Gated {
    fn describe(&self, handlers: &mut Handlers<Self>) {
        handlers.on::<u64>(|me, _| {
            let _ = me.started.send(());
            let _ = me.gate.recv();
            me.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }
}

/// Returns the listener, a receiver for "handler started" and the release side.
fn gated() -> (Arc<Gated>, Receiver<()>, Sender<()>) {
    let (started, started_rx) = bounded(16);
    let (release, gate) = bounded(16);
    let listener = Arc::new(Gated {
        started,
        gate,
        done: AtomicUsize::new(0),
    });
    (listener, started_rx, release)
}

#[test]
fn test_fail_policy_reports_backpressure() {
    let errors = Arc::new(Collected::default());
    let bus = bus_with(
        &errors,
        BusConfig {
            worker_threads: 1,
            queue_capacity: 1,
            backpressure: Backpressure::Fail,
            ..Default::default()
        },
    );
    let (listener, started, release) = gated();
    bus.subscribe(&listener).unwrap();

    bus.publish_async(1u64).unwrap();
    started.recv().unwrap();

    let second = bus.publish_async(2u64);
    assert!(matches!(
        second,
        Err(BusError::DeliveryBackpressure { capacity: 1 })
    ));
    assert!(bus.has_pending_messages());

    release.send(()).unwrap();
    assert!(bus.shutdown(Duration::from_secs(5)));
    assert_eq!(listener.done.load(Ordering::SeqCst), 1);
    assert!(!bus.has_pending_messages());
}

#[test]
fn test_block_policy_waits_for_room() {
    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 1,
        queue_capacity: 1,
        backpressure: Backpressure::Block,
        ..Default::default()
    })
    .unwrap();
    let (listener, started, release) = gated();
    bus.subscribe(&listener).unwrap();

    bus.publish_async(1u64).unwrap();
    started.recv().unwrap();

    std::thread::scope(|scope| {
        let producer = scope.spawn(|| bus.publish_async(2u64));

        // The producer is stuck until the first delivery finishes.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!producer.is_finished());

        release.send(()).unwrap();
        release.send(()).unwrap();
        assert!(producer.join().unwrap().is_ok());
    });

    assert!(bus.shutdown(Duration::from_secs(5)));
    assert_eq!(listener.done.load(Ordering::SeqCst), 2);
}

#[test]
fn test_rejected_async_binding_is_reported() {
    struct Deferred;

    impl Listener for Deferred {
        fn describe(&self, handlers: &mut Handlers<Self>) {
            handlers.on::<u32>(|_, _| Ok(())).asynchronous();
        }
    }

    let errors = Arc::new(Collected::default());
    let bus = bus_with(&errors, BusConfig::default());
    let deferred = Arc::new(Deferred);
    bus.subscribe(&deferred).unwrap();
    assert!(bus.shutdown(Duration::from_secs(5)));

    bus.publish(5u32);

    let reports = errors.reports.lock();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].rejected);
    assert_eq!(reports[0].message, Some(5));
}

// --- Invalid Descriptors and Declarations ---

#[test]
fn test_listener_without_handlers_is_rejected() {
    struct Silent;

    impl Listener for Silent {
        fn describe(&self, _handlers: &mut Handlers<Self>) {}
    }

    let bus = MessageBus::new().unwrap();
    let result = bus.subscribe(&Arc::new(Silent));
    assert!(matches!(
        result,
        Err(BusError::InvalidHandlerDescriptor { .. })
    ));
    assert_eq!(bus.subscription_count(), 0);
}

#[test]
fn test_ambiguous_handler_names_are_rejected() {
    struct Ambiguous;

    impl Listener for Ambiguous {
        fn describe(&self, handlers: &mut Handlers<Self>) {
            handlers.on::<u32>(|_, _| Ok(())).named("twice");
            handlers.on::<u64>(|_, _| Ok(())).named("twice");
        }
    }

    let bus = MessageBus::new().unwrap();
    match bus.subscribe(&Arc::new(Ambiguous)) {
        Err(BusError::InvalidHandlerDescriptor { listener, reason }) => {
            assert!(listener.contains("Ambiguous"));
            assert!(reason.contains("twice"));
        }
        other => panic!("Expected InvalidHandlerDescriptor, got {:?}", other),
    }
}

#[test]
fn test_invalid_declarations() {
    struct Base;
    struct Other;
    struct Derived {
        base: Base,
    }
    static OTHER: Other = Other;

    let bus = MessageBus::new().unwrap();

    let twice = TypeDecl::<Derived>::new()
        .extends::<Base>(|d| &d.base)
        .extends::<Other>(|_| &OTHER);
    assert!(matches!(
        bus.declare(twice),
        Err(BusError::InvalidTypeDeclaration { .. })
    ));

    bus.declare(TypeDecl::<Derived>::new().extends::<Base>(|d| &d.base))
        .unwrap();
    let again = bus.declare(TypeDecl::<Derived>::new());
    assert!(matches!(
        again,
        Err(BusError::InvalidTypeDeclaration { .. })
    ));
}

// --- Shutdown ---

#[test]
fn test_shutdown_timeout_is_reported() {
    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 1,
        ..Default::default()
    })
    .unwrap();
    let (listener, started, release) = gated();
    bus.subscribe(&listener).unwrap();

    bus.publish_async(1u64).unwrap();
    started.recv().unwrap();

    assert!(!bus.shutdown(Duration::from_millis(20)));
    assert!(matches!(
        bus.try_shutdown(Duration::from_millis(20)),
        Err(BusError::ShutdownTimeout(_))
    ));
    assert!(bus.is_shut_down());

    release.send(()).unwrap();
    assert!(bus.try_shutdown(Duration::from_secs(5)).is_ok());
    assert_eq!(listener.done.load(Ordering::SeqCst), 1);
}

#[test]
fn test_discard_policy_drops_queued_messages() {
    let bus = MessageBus::with_config(BusConfig {
        worker_threads: 1,
        shutdown_policy: ShutdownPolicy::Discard,
        ..Default::default()
    })
    .unwrap();
    let (listener, started, release) = gated();
    bus.subscribe(&listener).unwrap();

    for n in 0..5u64 {
        bus.publish_async(n).unwrap();
    }
    started.recv().unwrap();

    // Let the running delivery finish once the discard is in effect.
    let releaser = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        for _ in 0..5 {
            let _ = release.send(());
        }
    });
    assert!(bus.shutdown(Duration::from_secs(5)));
    releaser.join().unwrap();

    assert_eq!(listener.done.load(Ordering::SeqCst), 1);
    assert!(!bus.has_pending_messages());
}

#[test]
fn test_publish_async_after_shutdown() {
    let bus = MessageBus::new().unwrap();
    assert!(bus.shutdown(Duration::from_secs(5)));
    assert!(matches!(bus.publish_async(1u8), Err(BusError::ShutDown)));
}
