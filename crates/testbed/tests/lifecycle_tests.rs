//! Setup/teardown lifecycle tests.
//!
//! Runs the full controller against `FakeRuntime` and `ScriptedProbes`:
//! dependency-ordered startup, all-or-nothing provisioning, remote
//! overrides, registry lookups and idempotent teardown.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use testbed::config::TestbedConfig;
use testbed::descriptor::ServiceDescriptor;
use testbed::errors::{ConfigError, TestbedError};
use testbed::registry::EndpointOrigin;
use testbed::runtime::{RUN_LABEL, SERVICE_LABEL};
use testbed::Testbed;
use testbed_test_utils::*;

fn testbed(
    runtime: &Arc<FakeRuntime>,
    services: Vec<ServiceDescriptor>,
    config: TestbedConfig,
    env: HashMap<String, String>,
) -> Result<Testbed, TestbedError> {
    Testbed::builder(runtime.clone())
        .services(services)
        .config(config)
        .env(env)
        .probe_runner(Arc::new(ScriptedProbes::all_ready()))
        .build()
}

/// Two independent healthy services end up in the registry, nothing else.
#[tokio::test]
async fn test_two_independent_services_registered() -> Result<(), anyhow::Error> {
    init_test_tracing();
    let runtime = Arc::new(FakeRuntime::new());
    let running = testbed(
        &runtime,
        services(&[("alpha", 7000), ("beta", 7001)], &[]),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await?;

    let registry = running.registry();
    assert_eq!(registry.len(), 2);
    assert!(registry.contains("alpha"));
    assert!(registry.contains("beta"));

    let alpha = registry.get("alpha")?;
    assert_eq!(alpha.host, "127.0.0.1");
    assert_eq!(alpha.address, format!("127.0.0.1:{}", alpha.port.unwrap_or_default()));
    assert!(matches!(alpha.origin, EndpointOrigin::Provisioned { .. }));

    assert_eq!(runtime.running_services(), vec!["alpha", "beta"]);
    assert_eq!(runtime.network_count(), 1);

    running.teardown().await;
    assert!(runtime.running_services().is_empty());
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

/// A dependency that fails to start aborts Setup before the dependent
/// starts, and nothing is left running.
#[tokio::test]
async fn test_dependency_start_failure_names_service() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.fail_start("broker-deps", "manifest unknown");

    let err = testbed(
        &runtime,
        services(
            &[("broker", 9092), ("broker-deps", 2181)],
            &[("broker", "broker-deps")],
        ),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(matches!(err, TestbedError::Provision { .. }));
    assert_eq!(err.service(), Some("broker-deps"));
    assert!(err.to_string().contains("manifest unknown"));

    assert_eq!(runtime.started_services(), vec!["broker-deps"]);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

/// A later failure rolls back every container already started, newest first.
#[tokio::test]
async fn test_failure_rolls_back_started_containers() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.exit_on_start("gamma", 1);
    runtime.set_logs("gamma", "starting\nERROR: bad configuration");

    let err = testbed(
        &runtime,
        services(&[("alpha", 7000), ("beta", 7001), ("gamma", 7002)], &[]),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert_eq!(err.service(), Some("gamma"));
    assert!(err.logs().is_some_and(|l| l.contains("bad configuration")));
    assert!(err.to_string().contains("--- container log tail ---"));

    assert_eq!(runtime.stopped_services(), vec!["gamma", "beta", "alpha"]);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_network_failure_starts_nothing() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.fail_network("address pool exhausted");

    let err = testbed(
        &runtime,
        services(&[("alpha", 7000)], &[]),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(err.to_string().contains("address pool exhausted"));
    assert!(runtime.started_services().is_empty());
    Ok(())
}

/// A dependency cycle is a configuration error; the runtime is never touched.
#[tokio::test]
async fn test_cycle_starts_no_containers() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());

    let err = testbed(
        &runtime,
        services(
            &[("a", 1), ("b", 2), ("c", 3)],
            &[("a", "b"), ("b", "c"), ("c", "a")],
        ),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(matches!(
        err,
        TestbedError::Config(ConfigError::DependencyCycle { .. })
    ));
    assert!(runtime.calls().is_empty());
    Ok(())
}

/// Services are started dependencies first, with run labels and aliases.
#[tokio::test]
async fn test_start_order_and_container_spec() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let testbed = testbed(
        &runtime,
        services(
            &[("app-db", 5432), ("queue", 9092), ("coordinator", 2181)],
            &[("app-db", "queue"), ("queue", "coordinator")],
        ),
        test_config(),
        HashMap::new(),
    )?;
    let run_id = testbed.run_id();
    let running = testbed.setup().await?;

    assert_eq!(
        runtime.started_services(),
        vec!["coordinator", "queue", "app-db"]
    );

    let spec = runtime
        .spec_for("queue")
        .ok_or_else(|| anyhow::anyhow!("queue not started"))?;
    assert_eq!(spec.alias, "queue");
    assert_eq!(spec.network, format!("testbed-{}", run_id.short()));
    assert_eq!(spec.labels.get(RUN_LABEL), Some(&run_id.to_string()));
    assert_eq!(spec.labels.get(SERVICE_LABEL).map(String::as_str), Some("queue"));

    running.teardown().await;
    assert_eq!(
        runtime.stopped_services(),
        vec!["app-db", "queue", "coordinator"]
    );
    Ok(())
}

/// Remote endpoint variables replace provisioning; values are kept verbatim.
#[tokio::test]
async fn test_remote_override_skips_container() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let docs = tcp_service("docs", 8081)
        .remote_vars("COSMOS_ENDPOINT", "COSMOS_KEY")
        .property("docs.key", "{credential}")
        .build()?;

    let running = testbed(
        &runtime,
        vec![docs],
        test_config(),
        env(&[
            ("COSMOS_ENDPOINT", "https://acct.documents.azure.com:443/"),
            ("COSMOS_KEY", "s3cr3t=="),
        ]),
    )?
    .setup()
    .await?;

    assert!(runtime.calls().is_empty(), "no network, no container");

    let endpoint = running.registry().get("docs")?.clone();
    assert!(endpoint.is_remote());
    assert_eq!(endpoint.address, "https://acct.documents.azure.com:443/");

    let properties = running.properties();
    assert_eq!(
        properties.get("docs.address").map(String::as_str),
        Some("https://acct.documents.azure.com:443/")
    );
    assert_eq!(properties.get("docs.key").map(String::as_str), Some("s3cr3t=="));

    let report = running.teardown().await;
    assert_eq!(report.stopped, 0);
    assert!(!report.network_removed);
    Ok(())
}

/// A remote service does not pull its own dependencies into the run.
#[tokio::test]
async fn test_remote_service_does_not_start_dependencies() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let running = testbed(
        &runtime,
        services(
            &[("coordinator", 2181), ("queue", 9092), ("mock", 8080)],
            &[("queue", "coordinator")],
        ),
        test_config(),
        env(&[("TESTBED_QUEUE_ENDPOINT", "queue.example.net:9092")]),
    )?
    .setup()
    .await?;

    // Static selection still starts every declared, non-remote service.
    assert_eq!(runtime.started_services(), vec!["coordinator", "mock"]);
    assert!(running.registry().get("queue")?.is_remote());
    running.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_opt_in_pulls_dependencies() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let running = testbed(
        &runtime,
        services(
            &[("coordinator", 2181), ("queue", 9092), ("mock", 8080)],
            &[("queue", "coordinator")],
        ),
        opt_in_config(&["queue"]),
        HashMap::new(),
    )?
    .setup()
    .await?;

    assert_eq!(runtime.started_services(), vec!["coordinator", "queue"]);
    let registry = running.registry();
    assert_eq!(registry.names().collect::<Vec<_>>(), vec!["coordinator", "queue"]);

    let err = registry
        .get("mock")
        .err()
        .ok_or_else(|| anyhow::anyhow!("mock must not be registered"))?;
    assert!(matches!(err, TestbedError::NotFound(ref name) if name == "mock"));

    running.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_empty_opt_in_is_noop() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let running = testbed(
        &runtime,
        services(&[("alpha", 7000)], &[]),
        opt_in_config(&[]),
        HashMap::new(),
    )?
    .setup()
    .await?;

    assert!(running.registry().is_empty());
    assert!(runtime.calls().is_empty());
    running.teardown().await;
    Ok(())
}

#[tokio::test]
async fn test_unknown_opt_in_service_rejected() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let err = testbed(
        &runtime,
        services(&[("alpha", 7000)], &[]),
        opt_in_config(&["omega"]),
        HashMap::new(),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(matches!(
        err,
        TestbedError::Config(ConfigError::UnknownService(ref name)) if name == "omega"
    ));
    Ok(())
}

#[tokio::test]
async fn test_teardown_is_idempotent() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let running = testbed(
        &runtime,
        services(&[("alpha", 7000), ("beta", 7001)], &[]),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await?;

    let first = running.teardown().await;
    assert_eq!(first.stopped, 2);
    assert!(first.network_removed);
    assert!(running.is_torn_down().await);

    let second = running.teardown().await;
    assert_eq!(second.stopped, 0);
    assert!(second.is_clean());
    assert_eq!(runtime.stopped_services().len(), 2);
    Ok(())
}

/// A container that refuses to stop is reported, the rest are still released.
#[tokio::test]
async fn test_teardown_continues_past_failures() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.fail_stop("beta");

    let running = testbed(
        &runtime,
        services(&[("alpha", 7000), ("beta", 7001), ("gamma", 7002)], &[]),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await?;

    let report = running.teardown().await;
    assert_eq!(report.stopped, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(report.failures.iter().any(|f| f.to_string().contains("'beta'")));
    assert_eq!(runtime.stopped_services(), vec!["gamma", "beta", "alpha"]);
    assert_eq!(runtime.running_services(), vec!["beta"]);
    Ok(())
}

#[tokio::test]
async fn test_inject_properties_into_sink() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let mock = tcp_service("mock", 8080)
        .expose_fixed(8443, 18443)
        .property("mock.tls-port", "{port:8443}")
        .build()?;

    let running = testbed(&runtime, vec![mock], test_config(), HashMap::new())?
        .setup()
        .await?;

    let mut sink: BTreeMap<String, String> = BTreeMap::new();
    running.inject_into(&mut sink);
    assert_eq!(sink.get("mock.tls-port").map(String::as_str), Some("18443"));
    assert!(sink
        .get("mock.address")
        .is_some_and(|a| a.starts_with("127.0.0.1:")));

    running.teardown().await;
    Ok(())
}

/// The container output is attached when the engine cannot start a container.
#[tokio::test]
async fn test_start_failure_carries_container_logs() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.fail_start("alpha", "port is already allocated");
    runtime.set_logs("alpha", "binding 0.0.0.0:7000\nbind: address in use");

    let err = testbed(
        &runtime,
        services(&[("alpha", 7000)], &[]),
        test_config(),
        HashMap::new(),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert_eq!(err.service(), Some("alpha"));
    assert!(err.to_string().contains("port is already allocated"));
    assert!(err.logs().is_some_and(|l| l.contains("address in use")));
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

/// A Setup future dropped halfway (here by a timeout) still releases the
/// containers and network it created.
#[tokio::test(start_paused = true)]
async fn test_dropped_setup_releases_resources() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready().with("slow", ProbeScript::Never));
    let testbed = Testbed::builder(runtime.clone())
        .services(services(&[("fast", 7000), ("slow", 7001)], &[("slow", "fast")]))
        .config(test_config())
        .env(HashMap::new())
        .probe_runner(probes)
        .build()?;

    let outcome = tokio::time::timeout(Duration::from_secs(10), testbed.setup()).await;
    assert!(outcome.is_err(), "setup should still be waiting for 'slow'");

    // Let the scheduled release run.
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(runtime.stopped_services(), vec!["slow", "fast"]);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_releases_resources() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready().with("slow", ProbeScript::Never));
    let testbed = Testbed::builder(runtime.clone())
        .services(services(&[("fast", 7000), ("slow", 7001)], &[("slow", "fast")]))
        .config(test_config())
        .env(HashMap::new())
        .probe_runner(probes)
        .handle_ctrl_c(false)
        .build()?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        testbed.run(|_registry| async { "body never runs" }),
    )
    .await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(runtime.running_services().is_empty());
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}
