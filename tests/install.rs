//! End-to-end install runs against an instrumented fake transport.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use onprem_launch::error::LaunchError;
use onprem_launch::genconf::materialize;
use onprem_launch::install::install;
use onprem_launch::stage::{RemoteStageStore, StageStore, STAGE_MARKER_FILE};
use onprem_launch::templates::ScriptTemplates;
use onprem_launch::InstallStage;

use common::{context, launch_config, static_dcos_config, FakeMetrics, FakeTransport};

const BOOTSTRAP: &str = "54.0.0.1";

#[tokio::test]
async fn full_install_reaches_postflight() {
    let transport = FakeTransport::default();
    let metrics = Arc::new(FakeMetrics::default());
    let ctx = context(&transport, metrics.clone(), launch_config(1, 2, 1, static_dcos_config()));
    install(ctx).await.unwrap();

    let state = &transport.state;
    assert_eq!(
        state.file(BOOTSTRAP, STAGE_MARKER_FILE).as_deref(),
        Some("POSTFLIGHT")
    );
    assert_eq!(state.commands_matching("--genconf").len(), 1);

    let config_yaml = state.file(BOOTSTRAP, "genconf/config.yaml").unwrap();
    assert!(config_yaml.contains("master_discovery: static"));
    assert!(config_yaml.contains("cluster_name: test"));
    assert!(!config_yaml.contains("PRIVATE KEY"));
    assert_eq!(
        state.file(BOOTSTRAP, "genconf/ssh_key").as_deref(),
        Some("PRIVATE KEY")
    );
    assert!(state.file(BOOTSTRAP, "genconf/ip-detect").is_some());
    assert!(state.file(BOOTSTRAP, "genconf/ip-detect-public").is_some());
    assert!(state.file(BOOTSTRAP, "genconf/fault-domain-detect").is_some());

    // The static backend never needs the bootstrap ZooKeeper.
    assert!(state.commands_matching("dcos-bootstrap-zk").is_empty());

    let deploys = state.commands_matching("sudo bash /tmp/install_dcos.sh");
    let mut roles: Vec<(String, String)> = deploys
        .iter()
        .filter(|c| !c.line().contains("--preflight-only"))
        .map(|c| (c.host.clone(), c.argv.last().cloned().unwrap()))
        .collect();
    roles.sort();
    assert_eq!(
        roles,
        [
            ("54.0.0.2".to_string(), "master".to_string()),
            ("54.0.0.3".to_string(), "slave".to_string()),
            ("54.0.0.4".to_string(), "slave".to_string()),
            ("54.0.0.5".to_string(), "slave_public".to_string()),
        ]
    );

    // Every cluster node was checked for health after postflight.
    let polled = metrics.polled.lock().unwrap().clone();
    for host in ["54.0.0.2", "54.0.0.3", "54.0.0.4", "54.0.0.5"] {
        assert!(polled.iter().any(|p| p == host), "{} never polled", host);
    }
}

#[tokio::test]
async fn rollout_never_exceeds_parallelism() {
    let transport = FakeTransport::with_delay(Duration::from_millis(5));
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 10, 3, static_dcos_config()),
    );
    install(ctx).await.unwrap();

    let state = &transport.state;
    assert!(state.max_in_flight.load(Ordering::SeqCst) <= 2);
    let deploys: Vec<_> = state
        .commands_matching("sudo bash /tmp/install_dcos.sh")
        .into_iter()
        .filter(|c| !c.line().contains("--preflight-only"))
        .collect();
    assert_eq!(deploys.len(), 14);
}

#[tokio::test]
async fn resume_after_failure_skips_completed_stages() {
    let transport = FakeTransport::default();
    let state = Arc::clone(&transport.state);
    state.fail_on("54.0.0.3", "--preflight-only");

    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 2, 1, static_dcos_config()),
    );
    let err = install(ctx).await.unwrap_err();
    assert!(matches!(err, LaunchError::DeploymentFailure { ref action, .. } if action == "preflight"));
    assert_eq!(
        state.file(BOOTSTRAP, STAGE_MARKER_FILE).as_deref(),
        Some("GENCONF")
    );

    state.clear_failures();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 2, 1, static_dcos_config()),
    );
    install(ctx).await.unwrap();
    assert_eq!(state.commands_matching("--genconf").len(), 1);
    assert_eq!(
        state
            .commands_matching("-o /home/core/dcos_generate_config.sh")
            .len(),
        1
    );
    assert_eq!(
        state.file(BOOTSTRAP, STAGE_MARKER_FILE).as_deref(),
        Some("POSTFLIGHT")
    );

    // Running again at POSTFLIGHT does no stage work.
    let before = state.commands().len();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 2, 1, static_dcos_config()),
    );
    install(ctx).await.unwrap();
    let after = state.commands();
    assert!(after[before..]
        .iter()
        .all(|c| c.argv[0] == "test" || c.argv[0] == "cat"));
}

#[tokio::test]
async fn deploy_failures_are_aggregated_after_every_host_ran() {
    let transport = FakeTransport::default();
    let state = Arc::clone(&transport.state);
    state.fail_on("54.0.0.2", "install_dcos.sh master");
    state.fail_on("54.0.0.4", "install_dcos.sh slave");

    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 2, 1, static_dcos_config()),
    );
    match install(ctx).await.unwrap_err() {
        LaunchError::DeploymentFailure { action, failures } => {
            assert_eq!(action, "deploy");
            let hosts: Vec<&str> = failures.iter().map(|f| f.host.as_str()).collect();
            assert_eq!(hosts, ["54.0.0.2", "54.0.0.4"]);
            assert!(failures.iter().all(|f| f.returncode == 1));
        }
        other => panic!("unexpected error: {}", other),
    }
    let deploys: Vec<_> = state
        .commands_matching("sudo bash /tmp/install_dcos.sh")
        .into_iter()
        .filter(|c| !c.line().contains("--preflight-only"))
        .collect();
    assert_eq!(deploys.len(), 4);
    assert_eq!(
        state.file(BOOTSTRAP, STAGE_MARKER_FILE).as_deref(),
        Some("PREFLIGHT")
    );
}

#[tokio::test]
async fn zookeeper_backend_starts_bootstrap_zk() {
    let transport = FakeTransport::default();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(
            1,
            1,
            0,
            "dcos_config:\n  cluster_name: test\n  exhibitor_storage_backend: zookeeper\n",
        ),
    );
    let onprem = materialize(
        &ctx.config,
        &ctx.topology,
        ctx.transport.as_ref(),
        &ctx.templates,
    )
    .await
    .unwrap();
    assert_eq!(onprem.get_str("exhibitor_zk_hosts"), Some("10.0.0.1:2181"));
    assert!(!onprem.contains_key("master_discovery"));
    let zk_runs: Vec<_> = transport
        .state
        .commands_matching("docker run --name dcos-bootstrap-zk");
    assert_eq!(zk_runs.len(), 1);
    assert_eq!(zk_runs[0].host, BOOTSTRAP);
}

#[tokio::test]
async fn conflicting_script_sources_fail_before_remote_calls() {
    let transport = FakeTransport::default();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(
            1,
            1,
            0,
            "dcos_config:\n  exhibitor_storage_backend: zookeeper\n  ip_detect_contents: echo 1\n  ip_detect_filename: /tmp/ip-detect\n",
        ),
    );
    let err = materialize(
        &ctx.config,
        &ctx.topology,
        ctx.transport.as_ref(),
        &ScriptTemplates::new().unwrap(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LaunchError::Validation { ref field, .. } if field == "ip_detect_filename"));
    assert!(transport.state.commands().is_empty());
}

#[tokio::test]
async fn missing_script_file_fails_before_remote_calls() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");
    let transport = FakeTransport::default();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(
            1,
            1,
            0,
            &format!(
                "dcos_config:\n  exhibitor_storage_backend: zookeeper\n  ip_detect_public_filename: {}\n",
                missing.display()
            ),
        ),
    );
    let err = materialize(
        &ctx.config,
        &ctx.topology,
        ctx.transport.as_ref(),
        &ctx.templates,
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("ip_detect_public_filename"));
    assert!(transport.state.commands().is_empty());
}

#[tokio::test]
async fn script_file_contents_are_used() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("ip-detect");
    std::fs::write(&script, "#!/bin/sh\necho 192.168.0.1\n").unwrap();
    let transport = FakeTransport::default();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(
            1,
            1,
            0,
            &format!("dcos_config:\n  ip_detect_filename: {}\n", script.display()),
        ),
    );
    let onprem = materialize(
        &ctx.config,
        &ctx.topology,
        ctx.transport.as_ref(),
        &ctx.templates,
    )
    .await
    .unwrap();
    assert_eq!(
        onprem.get_str("ip_detect_contents"),
        Some("#!/bin/sh\necho 192.168.0.1\n")
    );
    assert!(!onprem.contains_key("ip_detect_filename"));
    assert_eq!(onprem.get_str("master_discovery"), Some("static"));
}

#[tokio::test]
async fn fault_domain_helper_generates_script() {
    let transport = FakeTransport::default();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(
            1,
            2,
            0,
            "fault_domain_helper:\n  USA:\n    num_zones: 2\n    num_private_agents: 2\n    local: true\n",
        ),
    );
    let onprem = materialize(
        &ctx.config,
        &ctx.topology,
        ctx.transport.as_ref(),
        &ctx.templates,
    )
    .await
    .unwrap();
    let script = onprem.get_str("fault_domain_detect_contents").unwrap();
    assert!(script.contains("\"host-54.0.0.2\")"));
    assert!(script.contains("ZONE=\"USA-2\""));
    assert_eq!(transport.state.commands_matching("hostname").len(), 3);
}

#[tokio::test]
async fn fault_domain_helper_conflicts_with_explicit_script() {
    let transport = FakeTransport::default();
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(
            1,
            1,
            0,
            "fault_domain_helper:\n  USA:\n    num_zones: 1\n    local: true\ndcos_config:\n  fault_domain_detect_contents: echo fixed\n",
        ),
    );
    let err = materialize(
        &ctx.config,
        &ctx.topology,
        ctx.transport.as_ref(),
        &ctx.templates,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, LaunchError::Validation { ref field, .. } if field == "fault_domain_helper"));
    assert!(transport.state.commands().is_empty());
}

#[tokio::test]
async fn unknown_marker_text_is_an_error() {
    let transport = FakeTransport::default();
    transport
        .state
        .set_file(BOOTSTRAP, STAGE_MARKER_FILE, "HALFWAY\n");
    let store = RemoteStageStore::new(&transport, BOOTSTRAP);
    assert!(matches!(
        store.get_last_state().await,
        Err(LaunchError::UnknownStage(ref text)) if text == "HALFWAY"
    ));

    transport
        .state
        .set_file(BOOTSTRAP, STAGE_MARKER_FILE, "DEPLOY\n");
    assert_eq!(
        store.get_last_state().await.unwrap(),
        Some(InstallStage::Deploy)
    );
}

#[tokio::test]
async fn missing_marker_means_not_started() {
    let transport = FakeTransport::default();
    let store = RemoteStageStore::new(&transport, BOOTSTRAP);
    assert_eq!(store.get_last_state().await.unwrap(), None);
    store.post_state(InstallStage::Setup).await.unwrap();
    assert_eq!(
        store.get_last_state().await.unwrap(),
        Some(InstallStage::Setup)
    );
}

#[tokio::test]
async fn ssh_waits_never_exceed_parallelism() {
    let transport = FakeTransport::with_delay(Duration::from_millis(20));
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 10, 3, static_dcos_config()),
    );
    install(ctx).await.unwrap();

    let state = &transport.state;
    assert_eq!(state.ssh_waits.lock().unwrap().len(), 15);
    let peak = state.max_ssh_in_flight.load(Ordering::SeqCst);
    assert!(peak >= 1 && peak <= 2, "{} SSH waits at once", peak);
}

#[tokio::test]
async fn unreachable_host_fails_setup_after_every_wait_finished() {
    let transport = FakeTransport::default();
    transport
        .state
        .unreachable
        .lock()
        .unwrap()
        .insert("54.0.0.3".to_string());
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 2, 1, static_dcos_config()),
    );
    let err = install(ctx).await.unwrap_err();
    assert!(matches!(err, LaunchError::RetryExhausted { .. }));

    let state = &transport.state;
    let mut waited = state.ssh_waits.lock().unwrap().clone();
    waited.sort();
    assert_eq!(
        waited,
        ["54.0.0.1", "54.0.0.2", "54.0.0.3", "54.0.0.4", "54.0.0.5"]
    );
    assert!(state.commands_matching("usermod").is_empty());
    assert!(state.file(BOOTSTRAP, STAGE_MARKER_FILE).is_none());
}

#[tokio::test]
async fn unexpected_marker_check_exit_is_an_error() {
    let transport = FakeTransport::default();
    transport.state.fail_with(BOOTSTRAP, "test -f", 255);
    let store = RemoteStageStore::new(&transport, BOOTSTRAP);
    match store.get_last_state().await {
        Err(LaunchError::CommandFailed {
            host, returncode, ..
        }) => {
            assert_eq!(host, BOOTSTRAP);
            assert_eq!(returncode, 255);
        }
        other => panic!("unexpected marker state: {:?}", other),
    }

    // Not mistaken for a fresh cluster: no SETUP work runs.
    let ctx = context(
        &transport,
        Arc::new(FakeMetrics::default()),
        launch_config(1, 1, 0, static_dcos_config()),
    );
    let err = install(ctx).await.unwrap_err();
    assert!(matches!(err, LaunchError::CommandFailed { returncode: 255, .. }));
    let state = &transport.state;
    assert!(state.ssh_waits.lock().unwrap().is_empty());
    assert!(state.commands_matching("usermod").is_empty());
    assert!(state.file(BOOTSTRAP, STAGE_MARKER_FILE).is_none());
}

#[tokio::test]
async fn failed_marker_read_is_an_error() {
    let transport = FakeTransport::default();
    transport
        .state
        .set_file(BOOTSTRAP, STAGE_MARKER_FILE, "GENCONF\n");
    transport
        .state
        .fail_with(BOOTSTRAP, &format!("cat {}", STAGE_MARKER_FILE), 1);
    let store = RemoteStageStore::new(&transport, BOOTSTRAP);
    assert!(matches!(
        store.get_last_state().await,
        Err(LaunchError::CommandFailed { returncode: 1, .. })
    ));
}
