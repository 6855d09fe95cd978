//! Readiness gating tests.
//!
//! Time is paused so retry budgets of minutes run instantly while the
//! elapsed virtual time still shows how many sleeps happened.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use testbed::config::TestbedConfig;
use testbed::descriptor::{NodeMarker, ReadinessProbe, ServiceDescriptor};
use testbed::errors::TestbedError;
use testbed::Testbed;
use testbed_test_utils::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn testbed(
    runtime: &Arc<FakeRuntime>,
    probes: &Arc<ScriptedProbes>,
    services: Vec<ServiceDescriptor>,
    config: TestbedConfig,
) -> Result<Testbed, TestbedError> {
    Testbed::builder(runtime.clone())
        .services(services)
        .config(config)
        .env(HashMap::new())
        .probe_runner(probes.clone())
        .build()
}

/// A probe that never succeeds uses exactly the whole budget: 50 attempts
/// and 49 two-second sleeps.
#[tokio::test(start_paused = true)]
async fn test_readiness_timeout_after_exact_attempts() -> Result<(), anyhow::Error> {
    init_test_tracing();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_logs("broker", "waiting for controller quorum");
    let probes = Arc::new(ScriptedProbes::new(ProbeScript::Never));

    let start = Instant::now();
    let err = testbed(&runtime, &probes, services(&[("broker", 9092)], &[]), test_config())?
        .setup()
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;
    let elapsed = start.elapsed();

    match &err {
        TestbedError::ReadinessTimeout {
            service,
            attempts,
            last_error,
            logs,
        } => {
            assert_eq!(service, "broker");
            assert_eq!(*attempts, 50);
            assert!(last_error.contains("connection refused"));
            assert!(logs
                .as_deref()
                .is_some_and(|l| l.contains("controller quorum")));
        }
        other => panic!("expected readiness timeout, got {other}"),
    }
    assert_eq!(probes.attempts("broker"), 50);
    assert_eq!(elapsed, Duration::from_secs(98));

    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_configured_readiness_budget() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::new(ProbeScript::Never));

    let start = Instant::now();
    let err = testbed(
        &runtime,
        &probes,
        services(&[("mock", 8080)], &[]),
        quick_readiness_config(3, Duration::from_millis(500)),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(matches!(err, TestbedError::ReadinessTimeout { attempts: 3, .. }));
    assert_eq!(probes.attempts("mock"), 3);
    assert_eq!(start.elapsed(), Duration::from_secs(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_service_becomes_ready() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready().with("db", ProbeScript::FailTimes(4)));

    let running = testbed(&runtime, &probes, services(&[("db", 9042)], &[]), test_config())?
        .setup()
        .await?;

    assert_eq!(probes.attempts("db"), 5);
    assert!(running.registry().contains("db"));
    running.teardown().await;
    Ok(())
}

/// A hung attempt is cut off by the per-attempt timeout, not the interval.
#[tokio::test(start_paused = true)]
async fn test_hung_probe_bounded_by_attempt_timeout() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::new(ProbeScript::Hang));
    let config = TestbedConfig {
        probe_timeout: Duration::from_millis(200),
        ..quick_readiness_config(2, Duration::from_secs(1))
    };

    let start = Instant::now();
    let err = testbed(&runtime, &probes, services(&[("mock", 8080)], &[]), config)?
        .setup()
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(err.to_string().contains("timed out after 200ms"));
    // Two 200ms attempts and one 1s sleep.
    assert_eq!(start.elapsed(), Duration::from_millis(1400));
    Ok(())
}

/// A dependent is neither started nor probed before its dependency is ready.
#[tokio::test(start_paused = true)]
async fn test_dependents_wait_for_dependencies() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready().with("coordinator", ProbeScript::FailTimes(3)));

    let running = testbed(
        &runtime,
        &probes,
        services(
            &[("broker", 9092), ("coordinator", 2181)],
            &[("broker", "coordinator")],
        ),
        test_config(),
    )?
    .setup()
    .await?;

    assert_eq!(probes.probe_order(), vec!["coordinator", "broker"]);
    assert_eq!(runtime.started_services(), vec!["coordinator", "broker"]);
    running.teardown().await;
    Ok(())
}

/// A dependency that never becomes ready keeps its dependent from starting.
#[tokio::test(start_paused = true)]
async fn test_unready_dependency_blocks_dependent() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready().with("coordinator", ProbeScript::Never));

    let err = testbed(
        &runtime,
        &probes,
        services(
            &[("broker", 9092), ("coordinator", 2181)],
            &[("broker", "coordinator")],
        ),
        quick_readiness_config(2, Duration::from_secs(1)),
    )?
    .setup()
    .await
    .err()
    .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert_eq!(err.service(), Some("coordinator"));
    assert_eq!(runtime.started_services(), vec!["coordinator"]);
    assert_eq!(probes.attempts("broker"), 0);
    assert_eq!(runtime.container_count(), 0);
    Ok(())
}

/// The describe probe runs inside the container through the runtime.
#[tokio::test(start_paused = true)]
async fn test_describe_probe_through_runtime() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_exec_output("store", 0, "Datacenter: dc1\nUN  172.18.0.3  104 KiB  16  ?  rack1\n");
    let store = ServiceDescriptor::builder("store", TEST_IMAGE)
        .expose(9042)
        .probe(ReadinessProbe::describe(
            9042,
            ["nodetool", "status"],
            NodeMarker::LinePrefix("UN".to_string()),
        ))
        .build()?;

    let running = Testbed::builder(runtime.clone())
        .services(vec![store])
        .config(test_config())
        .env(HashMap::new())
        .build()?
        .setup()
        .await?;

    assert!(runtime
        .calls()
        .contains(&RuntimeCall::Exec("store".to_string())));
    running.teardown().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_describe_probe_without_active_nodes_times_out() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_exec_output("store", 0, "UJ  172.18.0.3  104 KiB  16  ?  rack1\n");
    let store = ServiceDescriptor::builder("store", TEST_IMAGE)
        .expose(9042)
        .probe(ReadinessProbe::describe(
            9042,
            ["nodetool", "status"],
            NodeMarker::LinePrefix("UN".to_string()),
        ))
        .readiness(3, Duration::from_secs(2))
        .build()?;

    let err = Testbed::builder(runtime.clone())
        .services(vec![store])
        .config(test_config())
        .env(HashMap::new())
        .build()?
        .setup()
        .await
        .err()
        .ok_or_else(|| anyhow::anyhow!("setup should fail"))?;

    assert!(err.to_string().contains("no active nodes"));
    assert_eq!(runtime.container_count(), 0);
    Ok(())
}

/// Cancelling while a readiness wait is in progress interrupts the run and
/// still tears down what was started.
#[tokio::test(start_paused = true)]
async fn test_cancellation_interrupts_run() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready().with("slow", ProbeScript::Never));
    let cancel = CancellationToken::new();

    let testbed = Testbed::builder(runtime.clone())
        .services(services(&[("fast", 7000), ("slow", 7001)], &[("slow", "fast")]))
        .config(test_config())
        .env(HashMap::new())
        .probe_runner(probes.clone())
        .cancellation(cancel.clone())
        .build()?;

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let result = testbed.run(|_registry| async { "body never runs" }).await;
    canceller.await?;

    assert!(matches!(result, Err(TestbedError::Interrupted)));
    assert!(start.elapsed() < Duration::from_secs(10));
    assert!(probes.attempts("slow") <= 4);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_run_tears_down_after_body() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready());

    let seen = testbed(&runtime, &probes, services(&[("mock", 8080)], &[]), test_config())?
        .run(|registry| async move { registry.get("mock").map(|e| e.address.clone()) })
        .await??;

    assert!(seen.starts_with("127.0.0.1:"));
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_run_tears_down_after_panic() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready());
    let testbed = testbed(&runtime, &probes, services(&[("mock", 8080)], &[]), test_config())?;

    let handle = tokio::spawn(async move {
        testbed
            .run(|_registry| async {
                panic!("assertion failed inside test body");
            })
            .await
    });

    let join = handle.await;
    assert!(join.is_err_and(|e| e.is_panic()));
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

/// A container that is slow to report running does not delay cancellation
/// until its startup timeout.
#[tokio::test(start_paused = true)]
async fn test_cancellation_while_container_starting() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.hang_on_start("store");
    let cancel = CancellationToken::new();

    let testbed = Testbed::builder(runtime.clone())
        .services(services(&[("store", 9042)], &[]))
        .config(test_config())
        .env(HashMap::new())
        .probe_runner(Arc::new(ScriptedProbes::all_ready()))
        .cancellation(cancel.clone())
        .handle_ctrl_c(false)
        .build()?;

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
    });

    let start = Instant::now();
    let result = testbed.run(|_registry| async {}).await;
    canceller.await?;

    assert!(matches!(result, Err(TestbedError::Interrupted)));
    // Far below the 120s startup timeout.
    assert!(start.elapsed() < Duration::from_secs(6));
    assert_eq!(runtime.stopped_services(), vec!["store"]);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

/// Cancelling while the body runs stops the body and still tears down.
#[tokio::test(start_paused = true)]
async fn test_cancellation_during_body() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready());
    let cancel = CancellationToken::new();

    let testbed = Testbed::builder(runtime.clone())
        .services(services(&[("mock", 8080)], &[]))
        .config(test_config())
        .env(HashMap::new())
        .probe_runner(probes)
        .cancellation(cancel.clone())
        .handle_ctrl_c(false)
        .build()?;

    let result = testbed
        .run(|registry| async move {
            assert!(registry.contains("mock"));
            cancel.cancel();
            tokio::time::sleep(Duration::from_secs(600)).await;
            "body finished"
        })
        .await;

    assert!(matches!(result, Err(TestbedError::Interrupted)));
    assert_eq!(runtime.stopped_services(), vec!["mock"]);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}

/// Dropping a running testbed without tearing it down releases it in the
/// background.
#[tokio::test]
async fn test_drop_without_teardown_releases() -> Result<(), anyhow::Error> {
    let runtime = Arc::new(FakeRuntime::new());
    let probes = Arc::new(ScriptedProbes::all_ready());
    let running = testbed(
        &runtime,
        &probes,
        services(&[("alpha", 7000), ("beta", 7001)], &[]),
        test_config(),
    )?
    .setup()
    .await?;
    assert_eq!(runtime.container_count(), 2);

    drop(running);
    for _ in 0..10 {
        if runtime.network_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(runtime.stopped_services(), vec!["beta", "alpha"]);
    assert_eq!(runtime.container_count(), 0);
    assert_eq!(runtime.network_count(), 0);
    Ok(())
}
