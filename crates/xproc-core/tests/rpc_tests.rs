//! End-to-end tests for proxy -> connection -> dispatcher -> service.
//!
//! Most tests run over the in-process memory transport; the TCP tests start a
//! real `ServiceHost` on a loopback port.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use xproc::process_service::{
    self, ProcessService, ProcessServiceProxy, ProcessServiceStub, INTERFACE_NAME,
};
use xproc::{
    Connection, ConnectionManager, ConnectionOptions, ConnectionState, DeathRecipient,
    DispatcherOptions, InterfaceDescriptor, MemoryTransport, Proxy, ServiceHost,
    ServiceRegistry, TcpTransport, Value, WireType, XprocError,
};

const NOW: i64 = 1_700_000_000_000;

/// Test implementation. `test_function` sleeps `parameters` milliseconds and
/// reports each entry on `entered`.
struct TestService {
    label: Option<String>,
    entered: Option<mpsc::UnboundedSender<String>>,
}

impl TestService {
    fn new() -> Self {
        Self {
            label: Some("primary".to_string()),
            entered: None,
        }
    }
}

#[async_trait]
impl ProcessService for TestService {
    async fn get_current_time_stamp(&self) -> xproc::Result<i64> {
        Ok(NOW)
    }

    async fn get_string(&self) -> xproc::Result<Option<String>> {
        Ok(self.label.clone())
    }

    async fn test_function(&self, path: String, parameters: i32) -> xproc::Result<String> {
        if let Some(entered) = &self.entered {
            let _ = entered.send(path.clone());
        }
        if parameters < 0 {
            panic!("negative delay");
        }
        tokio::time::sleep(Duration::from_millis(parameters as u64)).await;
        Ok(format!("{}/{}", path, parameters))
    }

    async fn start_service(&self) -> xproc::Result<()> {
        Ok(())
    }

    async fn get_started_at(&self) -> xproc::Result<DateTime<Utc>> {
        Utc.timestamp_millis_opt(NOW)
            .single()
            .ok_or_else(|| XprocError::malformed("bad timestamp"))
    }

    async fn post_data(&self, items: Vec<String>) -> xproc::Result<Vec<i32>> {
        Ok(items.iter().map(|item| item.chars().count() as i32).collect())
    }
}

fn registry_with(service: TestService, v1: bool) -> Arc<ServiceRegistry> {
    let registry = Arc::new(ServiceRegistry::new());
    let descriptor = if v1 {
        process_service::descriptor_v1().unwrap()
    } else {
        process_service::descriptor().unwrap()
    };
    registry.bind_service(descriptor, Arc::new(ProcessServiceStub::new(Arc::new(service))));
    registry
}

fn memory_setup(service: TestService, v1: bool) -> (Arc<MemoryTransport>, ConnectionManager) {
    let transport = Arc::new(MemoryTransport::new());
    transport.register("remote", registry_with(service, v1));
    let manager = ConnectionManager::new(transport.clone());
    (transport, manager)
}

fn counting_recipient(count: &Arc<AtomicUsize>) -> Arc<dyn DeathRecipient> {
    let count = count.clone();
    Arc::new(move |_target: &str| {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

#[tokio::test]
async fn test_round_trip_returns_service_values() {
    let (_transport, manager) = memory_setup(TestService::new(), false);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);
    assert_eq!(service.get_string().await.unwrap().as_deref(), Some("primary"));
    assert_eq!(
        service.test_function("a/b".to_string(), 0).await.unwrap(),
        "a/b/0"
    );
    assert_eq!(
        service.get_started_at().await.unwrap().timestamp_millis(),
        NOW
    );
    service.start_service().await.unwrap();
    assert_eq!(
        service
            .post_data(vec!["héllo".to_string(), String::new(), "ab".to_string()])
            .await
            .unwrap(),
        vec![5, 0, 2]
    );
}

#[tokio::test]
async fn test_null_string_crosses_the_wire() {
    let service = TestService {
        label: None,
        entered: None,
    };
    let (_transport, manager) = memory_setup(service, false);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();
    assert_eq!(service.get_string().await.unwrap(), None);
}

#[tokio::test]
async fn test_not_connected_before_bind_then_value_after() {
    let transport = MemoryTransport::new();
    transport.register("remote", registry_with(TestService::new(), false));

    let descriptor = process_service::descriptor().unwrap();
    let connection = Arc::new(Connection::new(
        "remote",
        INTERFACE_NAME,
        ConnectionOptions::default(),
    ));
    let service = ProcessServiceProxy::new(Proxy::new(descriptor, connection.clone()));

    assert!(matches!(
        service.get_current_time_stamp().await,
        Err(XprocError::NotConnected)
    ));

    connection.bind(&transport).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Bound);
    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);
}

#[tokio::test]
async fn test_remote_death_mid_call() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let service = TestService {
        label: None,
        entered: Some(entered_tx),
    };
    let (transport, manager) = memory_setup(service, false);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    let first = Arc::new(AtomicUsize::new(0));
    let second = Arc::new(AtomicUsize::new(0));
    let first_recipient = counting_recipient(&first);
    let second_recipient = counting_recipient(&second);
    let connection = service.proxy().connection().clone();
    connection.link_to_death(&first_recipient);
    connection.link_to_death(&second_recipient);

    let calls: Vec<_> = ["one", "two"]
        .into_iter()
        .map(|path| {
            let service = service.clone();
            tokio::spawn(async move { service.test_function(path.to_string(), 60_000).await })
        })
        .collect();

    // Both calls are executing on the remote side before it dies.
    entered_rx.recv().await.unwrap();
    entered_rx.recv().await.unwrap();
    assert_eq!(transport.kill("remote"), 1);

    for call in calls {
        assert!(matches!(
            call.await.unwrap(),
            Err(XprocError::RemoteProcessGone)
        ));
    }
    assert_eq!(connection.state(), ConnectionState::Dead);
    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(second.load(Ordering::SeqCst), 1);

    assert!(matches!(
        service.get_current_time_stamp().await,
        Err(XprocError::RemoteProcessGone)
    ));
}

#[tokio::test]
async fn test_manager_replaces_dead_connection() {
    let (transport, manager) = memory_setup(TestService::new(), false);
    let before = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    transport.kill("remote");
    tokio::time::timeout(Duration::from_secs(5), async {
        while before.proxy().connection().state() != ConnectionState::Dead {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // The process comes back under the same name.
    transport.register("remote", registry_with(TestService::new(), false));
    let after = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();
    assert!(!Arc::ptr_eq(
        before.proxy().connection(),
        after.proxy().connection()
    ));
    assert_eq!(after.get_current_time_stamp().await.unwrap(), NOW);
}

#[tokio::test]
async fn test_v2_caller_against_v1_host() {
    let (_transport, manager) = memory_setup(TestService::new(), true);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    // Methods both versions share keep working.
    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);

    // startService has a default body and falls back silently.
    service.start_service().await.unwrap();

    let started_at_code = process_service::descriptor()
        .unwrap()
        .method(process_service::GET_STARTED_AT)
        .unwrap()
        .code();
    match service.get_started_at().await {
        Err(XprocError::UnsupportedMethod { code }) => assert_eq!(code, started_at_code),
        other => panic!("Expected UnsupportedMethod, got: {:?}", other),
    }
    assert!(matches!(
        service.post_data(vec!["x".to_string()]).await,
        Err(XprocError::UnsupportedMethod { .. })
    ));
}

#[tokio::test]
async fn test_root_error_handler_after_remote_death() {
    let (transport, manager) = memory_setup(TestService::new(), false);
    let absorbed = Arc::new(AtomicUsize::new(0));
    let manager = {
        let absorbed = absorbed.clone();
        manager.with_error_handler(Arc::new(move |method: &str, err: &XprocError| {
            let gone = matches!(err, XprocError::RemoteProcessGone);
            if gone && method == process_service::START_SERVICE {
                absorbed.fetch_add(1, Ordering::SeqCst);
            }
            gone
        }))
    };
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    transport.kill("remote");
    tokio::time::timeout(Duration::from_secs(5), async {
        while service.proxy().connection().state() != ConnectionState::Dead {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // void and string? calls are absorbed, the rest still fail.
    service.start_service().await.unwrap();
    assert_eq!(service.get_string().await.unwrap(), None);
    assert_eq!(absorbed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        service.get_current_time_stamp().await,
        Err(XprocError::RemoteProcessGone)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_complete_out_of_order() {
    let (_transport, manager) = memory_setup(TestService::new(), false);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    let slow = service.test_function("slow".to_string(), 200);
    let fast = service.test_function("fast".to_string(), 10);
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap(), "slow/200");
    assert_eq!(fast.unwrap(), "fast/10");
}

#[tokio::test(start_paused = true)]
async fn test_serial_dispatcher_still_routes_each_response() {
    let transport = Arc::new(MemoryTransport::new());
    let registry = Arc::new(ServiceRegistry::with_options(DispatcherOptions::serial()));
    registry.bind_service(
        process_service::descriptor().unwrap(),
        Arc::new(ProcessServiceStub::new(Arc::new(TestService::new()))),
    );
    transport.register("remote", registry);
    let manager = ConnectionManager::new(transport.clone());
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    let (a, b, c) = tokio::join!(
        service.test_function("a".to_string(), 30),
        service.test_function("b".to_string(), 20),
        service.test_function("c".to_string(), 10),
    );
    assert_eq!(
        (a.unwrap(), b.unwrap(), c.unwrap()),
        ("a/30".to_string(), "b/20".to_string(), "c/10".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn test_call_timeout_then_connection_still_usable() {
    let transport = Arc::new(MemoryTransport::new());
    transport.register("remote", registry_with(TestService::new(), false));
    let options = ConnectionOptions::default().with_call_timeout(Duration::from_millis(50));
    let manager = ConnectionManager::with_options(transport.clone(), options);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    match service.test_function("late".to_string(), 1_000).await {
        Err(XprocError::CallTimeout(timeout)) => assert_eq!(timeout, Duration::from_millis(50)),
        other => panic!("Expected CallTimeout, got: {:?}", other),
    }

    // Let the late response arrive and be discarded.
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(service.proxy().connection().state(), ConnectionState::Bound);
    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);
}

#[tokio::test]
async fn test_service_panic_becomes_remote_failure() {
    let (_transport, manager) = memory_setup(TestService::new(), false);
    let service = ProcessServiceProxy::connect(&manager, "remote").await.unwrap();

    match service.test_function("x".to_string(), -1).await {
        Err(XprocError::RemoteFailure { message }) => assert!(message.contains("negative delay")),
        other => panic!("Expected RemoteFailure, got: {:?}", other),
    }
    // The dispatcher survives the panic.
    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);
}

#[tokio::test]
async fn test_interface_mismatch_on_bind() {
    let transport = Arc::new(MemoryTransport::new());
    let registry = Arc::new(ServiceRegistry::new());
    let other = InterfaceDescriptor::builder("SomethingElse")
        .method("ping", &[], WireType::Void)
        .build()
        .unwrap();
    registry.bind_service(
        Arc::new(other),
        Arc::new(ProcessServiceStub::new(Arc::new(TestService::new()))),
    );
    transport.register("remote", registry);
    let manager = ConnectionManager::new(transport.clone());

    match ProcessServiceProxy::connect(&manager, "remote").await {
        Err(XprocError::InterfaceMismatch { requested, message }) => {
            assert_eq!(requested, INTERFACE_NAME);
            assert!(message.contains("SomethingElse"));
        }
        other => panic!("Expected InterfaceMismatch, got: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_generic_proxy_call_by_name() {
    let (_transport, manager) = memory_setup(TestService::new(), false);
    let proxy = manager
        .connect("remote", process_service::descriptor().unwrap())
        .await
        .unwrap();

    let value = proxy
        .call(
            process_service::TEST_FUNCTION,
            vec![Value::string("p"), Value::I32(0)],
        )
        .await
        .unwrap();
    assert_eq!(value, Value::string("p/0"));

    // Wrong argument types never leave the caller.
    assert!(matches!(
        proxy
            .call(process_service::TEST_FUNCTION, vec![Value::I32(0)])
            .await,
        Err(XprocError::MalformedPayload { .. })
    ));
    assert!(matches!(
        proxy.call("noSuchMethod", vec![]).await,
        Err(XprocError::UnknownMethod { .. })
    ));
}

// ========== TCP ==========

#[tokio::test]
async fn test_tcp_host_round_trip() {
    let registry = registry_with(TestService::new(), false);
    let host = ServiceHost::start(registry, "127.0.0.1:0").await.unwrap();

    let manager = ConnectionManager::new(Arc::new(TcpTransport::new()));
    let service = ProcessServiceProxy::connect(&manager, &host.addr().to_string())
        .await
        .unwrap();

    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);
    assert_eq!(
        service.test_function("tcp".to_string(), 1).await.unwrap(),
        "tcp/1"
    );
    assert_eq!(host.active_connections(), 1);
}

#[tokio::test]
async fn test_tcp_host_shutdown_is_remote_death() {
    let registry = registry_with(TestService::new(), false);
    let mut host = ServiceHost::start(registry, "127.0.0.1:0").await.unwrap();
    let target = host.addr().to_string();

    let manager = ConnectionManager::new(Arc::new(TcpTransport::new()));
    let service = ProcessServiceProxy::connect(&manager, &target).await.unwrap();
    assert_eq!(service.get_current_time_stamp().await.unwrap(), NOW);

    let (died_tx, mut died_rx) = mpsc::unbounded_channel::<String>();
    let recipient: Arc<dyn DeathRecipient> = Arc::new(move |target: &str| {
        let _ = died_tx.send(target.to_string());
    });
    service.proxy().connection().link_to_death(&recipient);

    host.shutdown();

    let died = tokio::time::timeout(Duration::from_secs(5), died_rx.recv())
        .await
        .unwrap();
    assert_eq!(died.as_deref(), Some(target.as_str()));
    assert!(matches!(
        service.get_current_time_stamp().await,
        Err(XprocError::RemoteProcessGone)
    ));
}
