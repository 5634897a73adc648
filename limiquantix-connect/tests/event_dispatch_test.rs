//! Integration tests for domain event registration and delivery.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use limiquantix_connect::{
    callback_fn, CallbackFailure, CallbackId, CallbackTarget, Connection, ErrorKind, EventId,
    LifecycleEvent, MockHost, MockHostConfig, Opaque, StartedDetail,
};

async fn open_qemu(host: &MockHost) -> Connection {
    Connection::open_with(host, "qemu:///system")
        .await
        .expect("Failed to open connection")
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let handle = count.clone();
    (count, move || {
        handle.fetch_add(1, Ordering::SeqCst);
    })
}

/// Test that ids are handed out and can only be deregistered once.
#[tokio::test]
async fn test_register_and_deregister_any() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;

    let id = conn
        .register_any(EventId::Lifecycle, callback_fn(|_, _, _, _, _| Ok(())), None, Opaque::none())
        .unwrap();
    assert_eq!(id, CallbackId(1));
    assert_eq!(host.subscription_count(), 1);

    conn.deregister_any(id).unwrap();
    assert_eq!(host.subscription_count(), 0);

    let err = conn.deregister_any(id).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(err.to_string(), "invalid callback ID 1");

    let next = conn
        .register_any(EventId::Lifecycle, callback_fn(|_, _, _, _, _| Ok(())), None, Opaque::none())
        .unwrap();
    assert_eq!(next, CallbackId(2));
}

/// Test that unknown numeric and textual event ids are rejected.
#[test]
fn test_invalid_event_ids() {
    let err = EventId::try_from(456789).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);

    let err = "hello".parse::<EventId>().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Type);
}

/// Test that lifecycle events reach the callback with their codes.
#[tokio::test]
async fn test_lifecycle_delivery() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, domain, event, detail, _| {
            sink.lock().unwrap().push((domain.name.clone(), event, detail));
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();

    host.define_domain("web").unwrap();
    host.start_domain("web").unwrap();
    host.destroy_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert_eq!(
        seen[1],
        ("web".to_string(), LifecycleEvent::Started.code(), StartedDetail::Booted.code())
    );
    assert_eq!(seen[2].1, LifecycleEvent::Stopped.code());
}

/// Test that two callbacks both run, in order, even when the first fails.
#[tokio::test]
async fn test_callbacks_isolated_and_ordered() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let failures = Arc::new(Mutex::new(Vec::<CallbackFailure>::new()));

    let hook_failures = failures.clone();
    conn.set_callback_error_hook(Some(Arc::new(move |failure: &CallbackFailure| {
        hook_failures.lock().unwrap().push(failure.clone());
    })));

    let first_order = order.clone();
    let first = conn
        .register_any(
            EventId::Lifecycle,
            callback_fn(move |_, _, _, _, _| {
                first_order.lock().unwrap().push("first");
                Err(anyhow!("first callback failed"))
            }),
            None,
            Opaque::none(),
        )
        .unwrap();

    let second_order = order.clone();
    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, _, _, _, _| {
            second_order.lock().unwrap().push("second");
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();

    host.define_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].target, CallbackTarget::Registered(first));
    assert!(!failures[0].panicked);
    assert!(failures[0].message.contains("first callback failed"));

    let stats = conn.dispatch_stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.callback_failures, 1);
    assert!(!conn.is_closed());
}

/// Test that a panicking callback does not stop delivery.
#[tokio::test]
async fn test_panicking_callback_contained() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let (count, bump) = counter();

    conn.register_any(
        EventId::Lifecycle,
        callback_fn(|_, _, _, _, _| panic!("callback exploded")),
        None,
        Opaque::none(),
    )
    .unwrap();
    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, _, _, _, _| {
            bump();
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();

    host.define_domain("web").unwrap();
    host.start_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(conn.dispatch_stats().callback_failures, 2);
    assert_eq!(conn.hypervisor_type().await.unwrap(), "QEMU");
}

/// Test that opaque data is handed back unchanged.
#[tokio::test]
async fn test_opaque_passthrough() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let opaque = Opaque::new("opaque user data");
    let matched = Arc::new(AtomicBool::new(false));

    let original = opaque.clone();
    let flag = matched.clone();
    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, _, _, _, opaque| {
            let same = opaque.ptr_eq(&original)
                && opaque.downcast_ref::<&str>() == Some(&"opaque user data");
            flag.store(same, Ordering::SeqCst);
            Ok(())
        }),
        None,
        opaque,
    )
    .unwrap();

    host.define_domain("web").unwrap();
    conn.flush_events().await.unwrap();
    assert!(matched.load(Ordering::SeqCst));
}

/// Test that a domain filter only passes that domain's events.
#[tokio::test]
async fn test_domain_filter() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let web = host.define_domain("web").unwrap();
    host.define_domain("db").unwrap();
    let (count, bump) = counter();

    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, domain, _, _, _| {
            assert_eq!(domain.name, "web");
            bump();
            Ok(())
        }),
        Some(&web),
        Opaque::none(),
    )
    .unwrap();

    host.start_domain("db").unwrap();
    host.start_domain("web").unwrap();
    host.suspend_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(conn.dispatch_stats().callback_failures, 0);
}

/// Test that callbacks only see their own event id.
#[tokio::test]
async fn test_event_id_filter() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let (reboots, bump) = counter();

    conn.register_any(
        EventId::Reboot,
        callback_fn(move |_, _, _, _, _| {
            bump();
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();

    host.define_domain("web").unwrap();
    host.start_domain("web").unwrap();
    host.reboot_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(reboots.load(Ordering::SeqCst), 1);
}

/// Test that events never cross between connections.
#[tokio::test]
async fn test_connections_isolated() {
    let host = MockHost::new();
    let first = open_qemu(&host).await;
    let second = open_qemu(&host).await;
    let (first_count, first_bump) = counter();
    let (second_count, second_bump) = counter();

    first
        .register_any(
            EventId::Lifecycle,
            callback_fn(move |_, _, _, _, _| {
                first_bump();
                Ok(())
            }),
            None,
            Opaque::none(),
        )
        .unwrap();
    let second_id = second
        .register_any(
            EventId::Lifecycle,
            callback_fn(move |_, _, _, _, _| {
                second_bump();
                Ok(())
            }),
            None,
            Opaque::none(),
        )
        .unwrap();

    host.define_domain("web").unwrap();
    first.flush_events().await.unwrap();
    second.flush_events().await.unwrap();
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);

    second.deregister_any(second_id).unwrap();
    host.start_domain("web").unwrap();
    first.flush_events().await.unwrap();
    second.flush_events().await.unwrap();
    assert_eq!(first_count.load(Ordering::SeqCst), 2);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
    assert_eq!(second.dispatch_stats().received, 1);
}

/// Test that the legacy slot accepts a single callback.
#[tokio::test]
async fn test_legacy_register_twice_fails() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;

    conn.register(callback_fn(|_, _, _, _, _| Ok(())), Opaque::new("opaque user data"))
        .unwrap();
    let err = conn
        .register(callback_fn(|_, _, _, _, _| Ok(())), Opaque::none())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Argument);
    assert_eq!(host.subscription_count(), 1);

    conn.deregister().unwrap();
    conn.deregister().unwrap();
    assert!(!conn.has_legacy_callback().unwrap());
    assert_eq!(host.subscription_count(), 0);

    conn.register(callback_fn(|_, _, _, _, _| Ok(())), Opaque::none())
        .unwrap();
    assert!(conn.has_legacy_callback().unwrap());
}

/// Test that the legacy callback runs after registered ones, for lifecycle only.
#[tokio::test]
async fn test_legacy_runs_last() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let order = Arc::new(Mutex::new(Vec::new()));

    let legacy_order = order.clone();
    conn.register(
        callback_fn(move |_, _, _, _, _| {
            legacy_order.lock().unwrap().push("legacy");
            Ok(())
        }),
        Opaque::none(),
    )
    .unwrap();

    let any_order = order.clone();
    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, _, _, _, _| {
            any_order.lock().unwrap().push("any");
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();
    conn.register_any(EventId::Reboot, callback_fn(|_, _, _, _, _| Ok(())), None, Opaque::none())
        .unwrap();

    host.define_domain("web").unwrap();
    host.start_domain("web").unwrap();
    host.reboot_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["any", "legacy", "any", "legacy"]);
}

/// Test that a callback can deregister itself and a later callback mid-delivery.
#[tokio::test]
async fn test_deregister_from_inside_callback() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let ids: Arc<Mutex<Vec<CallbackId>>> = Arc::new(Mutex::new(Vec::new()));
    let (first_count, first_bump) = counter();
    let (second_count, second_bump) = counter();

    let registered = ids.clone();
    let first = conn
        .register_any(
            EventId::Lifecycle,
            callback_fn(move |conn, _, _, _, _| {
                first_bump();
                for id in registered.lock().unwrap().drain(..) {
                    conn.deregister_any(id)?;
                }
                Ok(())
            }),
            None,
            Opaque::none(),
        )
        .unwrap();
    let second = conn
        .register_any(
            EventId::Lifecycle,
            callback_fn(move |_, _, _, _, _| {
                second_bump();
                Ok(())
            }),
            None,
            Opaque::none(),
        )
        .unwrap();
    ids.lock().unwrap().extend([first, second]);

    host.define_domain("web").unwrap();
    host.start_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 0);
    assert!(conn.callback_ids().unwrap().is_empty());
    assert_eq!(conn.dispatch_stats().callback_failures, 0);
    assert_eq!(host.subscription_count(), 0);
}

/// Test that a callback is never invoked once deregister has returned.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_delivery_after_deregister() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let entered = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let (entered_flag, finished_flag, call_count) = (entered.clone(), finished.clone(), calls.clone());
    let id = conn
        .register_any(
            EventId::Lifecycle,
            callback_fn(move |_, _, _, _, _| {
                call_count.fetch_add(1, Ordering::SeqCst);
                entered_flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                finished_flag.store(true, Ordering::SeqCst);
                Ok(())
            }),
            None,
            Opaque::none(),
        )
        .unwrap();

    host.define_domain("web").unwrap();
    while !entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // Blocks until the in-flight delivery is over.
    conn.deregister_any(id).unwrap();
    assert!(finished.load(Ordering::SeqCst));
    let after_deregister = calls.load(Ordering::SeqCst);

    host.emit(
        &conn.lookup_domain_by_name("web").await.unwrap(),
        EventId::Lifecycle,
        LifecycleEvent::Started.code(),
        0,
    );
    conn.flush_events().await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), after_deregister);
}

/// Test that close removes registrations and their subscriptions.
#[tokio::test]
async fn test_close_tears_down_registrations() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let (count, bump) = counter();

    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, _, _, _, _| {
            bump();
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();
    conn.register(callback_fn(|_, _, _, _, _| Ok(())), Opaque::none())
        .unwrap();
    assert_eq!(host.subscription_count(), 2);

    conn.close().await.unwrap();
    assert_eq!(host.subscription_count(), 0);
    assert_eq!(host.session_count(), 0);

    host.define_domain("web").unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

/// Test that registrations racing with close fail instead of outliving it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_register_racing_close_fails() {
    let host = MockHost::with_config(MockHostConfig {
        subscribe_latency_ms: 300,
        ..MockHostConfig::default()
    });

    let conn = open_qemu(&host).await;
    let racing = conn.clone();
    let register_any = tokio::task::spawn_blocking(move || {
        racing.register_any(
            EventId::Lifecycle,
            callback_fn(|_, _, _, _, _| Ok(())),
            None,
            Opaque::none(),
        )
    });
    // Close while the host is still answering the subscribe call.
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close().await.unwrap();

    let err = register_any.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInvalid);
    assert!(conn.is_closed());

    let conn = open_qemu(&host).await;
    let racing = conn.clone();
    let register = tokio::task::spawn_blocking(move || {
        racing.register(callback_fn(|_, _, _, _, _| Ok(())), Opaque::none())
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    conn.close().await.unwrap();

    let err = register.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::OperationInvalid);
    assert_eq!(host.subscription_count(), 0);
    assert_eq!(host.session_count(), 0);
}

/// Test that events still queued when the connection closes are never delivered.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_discards_queued_events() {
    const QUEUED: usize = 10;

    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let entered = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));

    let (entered_flag, call_count) = (entered.clone(), calls.clone());
    conn.register_any(
        EventId::Lifecycle,
        callback_fn(move |_, _, _, _, _| {
            call_count.fetch_add(1, Ordering::SeqCst);
            entered_flag.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(50));
            Ok(())
        }),
        None,
        Opaque::none(),
    )
    .unwrap();

    let web = host.define_domain("web").unwrap();
    for _ in 1..QUEUED {
        host.emit(&web, EventId::Lifecycle, LifecycleEvent::Started.code(), 0);
    }
    while !entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    conn.close().await.unwrap();
    let at_close = calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(calls.load(Ordering::SeqCst), at_close);
    assert!(at_close < QUEUED, "every queued event was delivered before close");
}

/// Test that the legacy callback can deregister itself while running.
#[tokio::test]
async fn test_legacy_deregisters_itself() {
    let host = MockHost::new();
    let conn = open_qemu(&host).await;
    let (count, bump) = counter();

    conn.register(
        callback_fn(move |conn, _, _, _, _| {
            bump();
            conn.deregister()?;
            Ok(())
        }),
        Opaque::none(),
    )
    .unwrap();

    host.define_domain("web").unwrap();
    host.start_domain("web").unwrap();
    conn.flush_events().await.unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!conn.has_legacy_callback().unwrap());
    assert_eq!(host.subscription_count(), 0);
    assert_eq!(conn.dispatch_stats().callback_failures, 0);
}
