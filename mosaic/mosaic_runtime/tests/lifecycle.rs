//! Instance lifecycles driven through the framework against a fake host.

use mosaic_channel::RpcMessage;
use mosaic_core::config::FrameworkConfig;
use mosaic_core::error::{Error, LifecycleError, LoadError};
use mosaic_core::testing::{FakeContainer, LoadBehavior};
use mosaic_core::types::{InstanceStatus, IsolationLevel, Priority};
use mosaic_isolation::testing::{greeter, FakeHost};
use mosaic_runtime::{Framework, InstanceSpec, LifecycleEvent, PROPS_EVENT};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use url::Url;

// Initialize tracing for tests
fn init_tracing() {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

const PAGE: &str = "https://apps.example.com/greeter/index.html";

fn page() -> Url {
    Url::parse(PAGE).unwrap()
}

fn start(host: &FakeHost, configure: impl FnOnce(&mut FrameworkConfig)) -> Arc<Framework> {
    init_tracing();
    let mut config = FrameworkConfig::default();
    configure(&mut config);
    Framework::init(config, host.services.clone()).unwrap()
}

fn drain(events: &mut broadcast::Receiver<LifecycleEvent>) -> Vec<LifecycleEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

async fn wait_for_eviction(events: &mut broadcast::Receiver<LifecycleEvent>) {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(LifecycleEvent::Evicted { .. }) => break,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {}", e),
            }
        }
    })
    .await
    .expect("no eviction within a second");
}

#[tokio::test]
async fn test_connect_and_greet_over_strict() {
    let host = FakeHost::new();
    host.respond_in_contexts(greeter());
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("greeter", page()))
        .unwrap();
    assert_eq!(instance.isolation(), IsolationLevel::Strict);
    assert_eq!(instance.status(), InstanceStatus::Idle);
    let mut events = instance.subscribe();

    let container = FakeContainer::new();
    instance.connect(container.clone()).await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Mounted);

    let channel = instance.channel().unwrap();
    let greeting: String = channel.call_as("greet", vec![json!("World")]).await.unwrap();
    assert_eq!(greeting, "Hello, World!");

    let id = instance.id();
    assert_eq!(
        drain(&mut events),
        vec![
            LifecycleEvent::StatusChanged {
                id,
                from: InstanceStatus::Idle,
                to: InstanceStatus::Loading
            },
            LifecycleEvent::StatusChanged {
                id,
                from: InstanceStatus::Loading,
                to: InstanceStatus::Mounting
            },
            LifecycleEvent::StatusChanged {
                id,
                from: InstanceStatus::Mounting,
                to: InstanceStatus::Mounted
            },
            LifecycleEvent::RpcReady { id },
        ]
    );

    let context = instance.snapshot().context.unwrap();
    assert_eq!(container.attached_contexts(), vec![context]);
    assert_eq!(framework.pool_stats().in_use, 1);
}

#[tokio::test]
async fn test_keep_alive_restore_skips_reload() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("cart", page()).with_keep_alive(Priority::Normal))
        .unwrap();
    let mut events = instance.subscribe();

    instance.connect(FakeContainer::new()).await.unwrap();
    let context = instance.snapshot().context.unwrap();

    instance.disconnect().await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Unmounted);
    assert!(instance.channel().is_none());
    assert!(framework.keep_alive().has(instance.id()));
    let snapshot = instance.snapshot();
    assert!(snapshot.retained);
    assert_eq!(snapshot.context, Some(context));
    drain(&mut events);

    let container = FakeContainer::new();
    instance.connect(container.clone()).await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Mounted);
    assert!(!framework.keep_alive().has(instance.id()));
    assert_eq!(framework.keep_alive().visits(instance.id()), 1);
    assert_eq!(container.attached_contexts(), vec![context]);
    assert_eq!(host.context(context).unwrap().loads().len(), 1);

    let seen = drain(&mut events);
    assert!(!seen.iter().any(|event| matches!(
        event,
        LifecycleEvent::StatusChanged {
            to: InstanceStatus::Loading,
            ..
        }
    )));
    assert!(seen.contains(&LifecycleEvent::KeepAliveRestore { id: instance.id() }));
    assert!(seen.contains(&LifecycleEvent::RpcReady { id: instance.id() }));
}

#[tokio::test]
async fn test_detach_without_keep_alive_releases_context() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("greeter", page()))
        .unwrap();
    instance.connect(FakeContainer::new()).await.unwrap();
    assert_eq!(framework.pool_stats().in_use, 1);

    instance.disconnect().await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Unmounted);
    assert!(!instance.snapshot().retained);
    assert!(framework.keep_alive().is_empty());
    assert_eq!(framework.pool_stats().in_use, 0);

    // Detaching twice is a no-op.
    instance.disconnect().await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Unmounted);
}

#[tokio::test]
async fn test_eviction_prefers_low_priority() {
    let host = FakeHost::new();
    let framework = start(&host, |config| config.pool.max_alive = 1);

    let low = framework
        .create_instance(InstanceSpec::new("low", page()).with_keep_alive(Priority::Low))
        .unwrap();
    let high = framework
        .create_instance(InstanceSpec::new("high", page()).with_keep_alive(Priority::High))
        .unwrap();
    let mut low_events = low.subscribe();

    low.connect(FakeContainer::new()).await.unwrap();
    low.disconnect().await.unwrap();
    high.connect(FakeContainer::new()).await.unwrap();
    high.disconnect().await.unwrap();

    wait_for_eviction(&mut low_events).await;

    assert!(framework.keep_alive().has(high.id()));
    assert!(!framework.keep_alive().has(low.id()));
    assert!(high.snapshot().retained);
    let snapshot = low.snapshot();
    assert!(!snapshot.retained);
    assert_eq!(snapshot.context, None);
    assert_eq!(snapshot.status, InstanceStatus::Unmounted);
    assert_eq!(framework.pool_stats().in_use, 1);

    // An evicted instance comes back through a full load.
    low.connect(FakeContainer::new()).await.unwrap();
    assert_eq!(low.status(), InstanceStatus::Mounted);
}

#[tokio::test(start_paused = true)]
async fn test_load_timeout_enters_error() {
    let host = FakeHost::new();
    host.contexts.set_load_behavior(LoadBehavior::Hang);
    let framework = start(&host, |config| config.load_timeout_ms = 500);

    let instance = framework
        .create_instance(InstanceSpec::new("slow", page()))
        .unwrap();
    let mut events = instance.subscribe();

    let err = instance.connect(FakeContainer::new()).await.unwrap_err();
    assert!(matches!(err, Error::Load(LoadError::Timeout(500))));
    assert_eq!(instance.status(), InstanceStatus::Error);
    assert!(instance.channel().is_none());
    assert_eq!(framework.pool_stats().in_use, 0);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, LifecycleEvent::Error { .. })));

    // Detaching from the error state settles in `Unmounted`.
    instance.disconnect().await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Unmounted);
}

#[tokio::test]
async fn test_load_failure_can_be_retried() {
    let host = FakeHost::new();
    host.fetcher
        .fail(PAGE, LoadError::Unreachable("connection refused".to_string()));
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("light", page()).with_isolation(IsolationLevel::Light))
        .unwrap();
    let container = FakeContainer::new();

    let err = instance.connect(container.clone()).await.unwrap_err();
    assert!(matches!(err, Error::Load(LoadError::Unreachable(_))));
    assert_eq!(instance.status(), InstanceStatus::Error);

    host.fetcher.serve(PAGE, "<main>back online</main>");
    instance.connect(container.clone()).await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Mounted);
}

#[tokio::test]
async fn test_queued_operations_run_in_order() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("racy", page()).with_keep_alive(Priority::Normal))
        .unwrap();
    let mut events = instance.subscribe();
    let container = FakeContainer::new();

    let (first, second, third) = tokio::join!(
        instance.connect(container.clone()),
        instance.disconnect(),
        instance.connect(container.clone()),
    );
    first.unwrap();
    second.unwrap();
    third.unwrap();

    assert_eq!(instance.status(), InstanceStatus::Mounted);
    let seen = drain(&mut events);
    let start = seen
        .iter()
        .position(|event| matches!(event, LifecycleEvent::KeepAliveStart { .. }))
        .unwrap();
    let restore = seen
        .iter()
        .position(|event| matches!(event, LifecycleEvent::KeepAliveRestore { .. }))
        .unwrap();
    assert!(start < restore);
}

#[tokio::test]
async fn test_script_sources_are_refused() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    for source in ["javascript:alert(document.cookie)", "data:text/html,<script>1</script>"] {
        let spec = InstanceSpec::new("hostile", Url::parse(source).unwrap());
        let err = framework.create_instance(spec).unwrap_err();
        assert!(matches!(err, Error::Load(LoadError::InvalidSource(_))));
    }
    assert!(framework.instances().is_empty());
    assert_eq!(framework.pool_stats().in_use, 0);
}

#[tokio::test]
async fn test_operations_after_destroy_fail() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("gone", page()).with_keep_alive(Priority::Normal))
        .unwrap();
    instance.connect(FakeContainer::new()).await.unwrap();
    instance.disconnect().await.unwrap();

    instance.destroy().await.unwrap();
    assert!(instance.is_destroyed());
    assert!(!framework.keep_alive().has(instance.id()));
    assert_eq!(framework.keep_alive().visits(instance.id()), 0);
    assert_eq!(framework.pool_stats().in_use, 0);

    let err = instance.connect(FakeContainer::new()).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Lifecycle(LifecycleError::Destroyed(id)) if id == instance.id()
    ));
    assert!(instance.destroy().await.is_err());
}

#[tokio::test]
async fn test_props_are_pushed_over_the_channel() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(
            InstanceSpec::new("themed", page()).with_props(json!({ "theme": "light" })),
        )
        .unwrap();
    instance.connect(FakeContainer::new()).await.unwrap();
    instance.set_props(json!({ "theme": "dark" })).await.unwrap();
    assert_eq!(instance.props(), json!({ "theme": "dark" }));

    let context = host.context(instance.snapshot().context.unwrap()).unwrap();
    let payloads: Vec<_> = context
        .posted()
        .iter()
        .filter_map(|(data, _)| match RpcMessage::decode(data) {
            Some(RpcMessage::Event { name, payload, .. }) if name == PROPS_EVENT => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(
        payloads,
        vec![json!({ "theme": "light" }), json!({ "theme": "dark" })]
    );
}

#[tokio::test]
async fn test_greet_over_local_bus() {
    let host = FakeHost::new();
    host.fetcher.serve(PAGE, "<main>greeter</main>");
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("inline", page()).with_isolation(IsolationLevel::None))
        .unwrap();
    let container = FakeContainer::new();
    instance.connect(container.clone()).await.unwrap();
    assert!(!container.nodes().is_empty());
    assert_eq!(framework.pool_stats().in_use, 0);

    let _guest = host.respond_on_bus(instance.id(), greeter()).unwrap();
    let channel = instance.channel().unwrap();
    let greeting: String = channel.call_as("greet", vec![json!("Bus")]).await.unwrap();
    assert_eq!(greeting, "Hello, Bus!");
}

#[tokio::test]
async fn test_reload_mounts_again() {
    let host = FakeHost::new();
    host.respond_in_contexts(greeter());
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("greeter", page()))
        .unwrap();

    // Nothing to reload before the first attach.
    assert!(instance.reload().await.is_err());

    instance.connect(FakeContainer::new()).await.unwrap();
    let before = instance.channel().unwrap();
    let mut events = instance.subscribe();

    instance.reload().await.unwrap();
    assert_eq!(instance.status(), InstanceStatus::Mounted);
    assert!(before.is_disposed());
    assert!(drain(&mut events).contains(&LifecycleEvent::RpcReady { id: instance.id() }));

    let channel = instance.channel().unwrap();
    let greeting: String = channel.call_as("greet", vec![json!("again")]).await.unwrap();
    assert_eq!(greeting, "Hello, again!");
    assert_eq!(framework.pool_stats().in_use, 1);
}

#[tokio::test]
async fn test_dropping_the_last_handle_destroys() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let instance = framework
        .create_instance(InstanceSpec::new("dropped", page()))
        .unwrap();
    let id = instance.id();
    instance.connect(FakeContainer::new()).await.unwrap();
    assert_eq!(framework.pool_stats().in_use, 1);

    drop(instance);
    for _ in 0..10 {
        if framework.pool_stats().in_use == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(framework.pool_stats().in_use, 0);
    assert!(framework.instance(id).is_none());
}

#[tokio::test]
async fn test_dispose_destroys_everything() {
    let host = FakeHost::new();
    let framework = start(&host, |_| {});

    let mounted = framework
        .create_instance(InstanceSpec::new("a", page()))
        .unwrap();
    let idle = framework
        .create_instance(InstanceSpec::new("b", page()))
        .unwrap();
    mounted.connect(FakeContainer::new()).await.unwrap();
    assert_eq!(framework.instances().len(), 2);

    framework.dispose().await;
    assert!(framework.is_disposed());
    assert!(mounted.is_destroyed());
    assert!(idle.is_destroyed());
    assert!(framework.pool().is_disposed());
    assert!(framework
        .create_instance(InstanceSpec::new("c", page()))
        .is_err());

    // Disposing twice is harmless.
    framework.dispose().await;
}

#[tokio::test]
async fn test_from_config_file() {
    let host = FakeHost::new();
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "default_sandbox = \"light\"").unwrap();
    writeln!(file, "load_timeout_ms = 2000").unwrap();
    writeln!(file, "[pool]").unwrap();
    writeln!(file, "initial_size = 1").unwrap();

    let framework = Framework::from_config_file(file.path(), host.services.clone()).unwrap();
    assert_eq!(framework.config().default_sandbox, IsolationLevel::Light);
    assert_eq!(framework.config().load_timeout_ms, 2000);
    assert_eq!(framework.pool_stats().total, 1);

    let instance = framework
        .create_instance(InstanceSpec::new("styled", page()))
        .unwrap();
    assert_eq!(instance.isolation(), IsolationLevel::Light);

    let mut invalid = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(invalid, r#"{{ "pool": {{ "initial_size": 4, "max_size": 2 }} }}"#).unwrap();
    let err = Framework::from_config_file(invalid.path(), host.services.clone()).unwrap_err();
    assert!(err.to_string().contains("Failed to load configuration"));
}
