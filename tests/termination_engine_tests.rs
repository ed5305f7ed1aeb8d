//! Termination engine behaviour against a recording backend

mod common;

use common::{running, terminated, Call, Outcome, PodFixture, RecordingBackend};
use serde_json::json;
use sidecar_terminator::controller::snapshot::PodSnapshot;
use sidecar_terminator::controller::termination::{AttemptState, TerminationEngine};
use sidecar_terminator::{SidecarSpec, TerminationError, TerminationStrategy};
use std::sync::Arc;

fn engine(
    backend: RecordingBackend,
    sidecars: &[&str],
    strategy: TerminationStrategy,
) -> TerminationEngine<RecordingBackend> {
    TerminationEngine::new(
        backend,
        Arc::new(SidecarSpec::parse(sidecars).unwrap()),
        strategy,
        "busybox:1.36",
    )
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(ToString::to_string).collect()
}

#[tokio::test]
async fn test_exec_sends_default_signal_to_process_one() {
    let backend = RecordingBackend::default();
    let engine = engine(backend.clone(), &["istio-proxy"], TerminationStrategy::Exec);
    let pod = PodSnapshot::from_pod(&PodFixture::job("job-1").sidecar("istio-proxy", running()).build());

    let report = engine.terminate(&pod).await;

    assert_eq!(
        backend.calls(),
        vec![Call::Exec {
            pod: "ns/job-1".to_string(),
            container: "istio-proxy".to_string(),
            command: strings(&["/bin/kill", "-s", "15", "1"]),
        }]
    );
    assert_eq!(report.attempt("istio-proxy").unwrap().state, AttemptState::Succeeded);
}

#[tokio::test]
async fn test_exec_falls_back_to_shell() {
    let backend = RecordingBackend::scripted([Outcome::Fail]);
    let engine = engine(backend.clone(), &["cloud-sql-proxy=2"], TerminationStrategy::Exec);
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("cloud-sql-proxy", running())
            .build(),
    );

    let report = engine.terminate(&pod).await;

    assert_eq!(
        backend.exec_commands(),
        vec![
            ("cloud-sql-proxy".to_string(), strings(&["/bin/kill", "-s", "2", "1"])),
            ("cloud-sql-proxy".to_string(), strings(&["/bin/sh", "-c", "kill -s \"2\" 1"])),
        ]
    );
    let attempt = report.attempt("cloud-sql-proxy").unwrap();
    assert_eq!(attempt.state, AttemptState::Succeeded);
    assert!(matches!(attempt.error, Some(TerminationError::RemoteExecution { .. })));
}

#[tokio::test]
async fn test_exec_gives_up_after_shell_fails() {
    let backend = RecordingBackend::scripted([Outcome::Fail, Outcome::Fail]);
    let engine = engine(
        backend.clone(),
        &["istio-proxy", "cloud-sql-proxy"],
        TerminationStrategy::Exec,
    );
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", running())
            .sidecar("cloud-sql-proxy", running())
            .build(),
    );

    let report = engine.terminate(&pod).await;

    // The second sidecar is still handled
    assert_eq!(backend.calls().len(), 3);
    assert_eq!(report.attempt("istio-proxy").unwrap().state, AttemptState::FailedLogged);
    assert_eq!(report.attempt("cloud-sql-proxy").unwrap().state, AttemptState::Succeeded);
    assert!(!report.pod_gone);
}

#[tokio::test]
async fn test_vanished_pod_ends_the_pass() {
    let backend = RecordingBackend::scripted([Outcome::NotFound]);
    let engine = engine(
        backend.clone(),
        &["istio-proxy", "cloud-sql-proxy"],
        TerminationStrategy::Exec,
    );
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", running())
            .sidecar("cloud-sql-proxy", running())
            .build(),
    );

    let report = engine.terminate(&pod).await;

    assert_eq!(backend.calls().len(), 1);
    assert!(report.pod_gone);
    assert_eq!(report.attempts.len(), 1);
}

#[tokio::test]
async fn test_only_running_sidecars_are_signalled() {
    let backend = RecordingBackend::default();
    let engine = engine(
        backend.clone(),
        &["istio-proxy", "cloud-sql-proxy"],
        TerminationStrategy::Exec,
    );
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", terminated(0))
            .sidecar("cloud-sql-proxy", running())
            .build(),
    );

    engine.terminate(&pod).await;

    let targets: Vec<String> = backend.exec_commands().into_iter().map(|(c, _)| c).collect();
    assert_eq!(targets, vec!["cloud-sql-proxy".to_string()]);
}

#[tokio::test]
async fn test_exec_still_runs_in_shared_process_namespace() {
    let backend = RecordingBackend::default();
    let engine = engine(backend.clone(), &["istio-proxy"], TerminationStrategy::Exec);
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", running())
            .shared_pid_namespace()
            .build(),
    );

    let report = engine.terminate(&pod).await;

    assert_eq!(backend.calls().len(), 1);
    assert_eq!(report.attempt("istio-proxy").unwrap().state, AttemptState::Succeeded);
}

#[tokio::test]
async fn test_ephemeral_container_is_injected_once() {
    let backend = RecordingBackend::default();
    let engine = engine(backend.clone(), &["istio-proxy=9"], TerminationStrategy::Ephemeral);
    let security_context = json!({ "runAsUser": 1337, "runAsNonRoot": true });
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", running())
            .sidecar_security_context(security_context.clone())
            .build(),
    );

    let report = engine.terminate(&pod).await;

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    let Call::Ephemeral { pod, container } = &calls[0] else {
        panic!("expected an ephemeral container call, got {calls:?}");
    };
    assert_eq!(pod, "ns/job-1");
    assert_eq!(container.name, "sidecar-terminator-istio-proxy");
    assert_eq!(container.target_container_name.as_deref(), Some("istio-proxy"));
    assert_eq!(container.image.as_deref(), Some("busybox:1.36"));
    assert_eq!(container.image_pull_policy.as_deref(), Some("IfNotPresent"));
    assert_eq!(
        container.command.as_deref(),
        Some(strings(&["kill", "-s", "9", "1"]).as_slice())
    );
    assert_eq!(
        serde_json::to_value(container.security_context.as_ref().unwrap()).unwrap(),
        security_context
    );
    assert_eq!(report.attempt("istio-proxy").unwrap().state, AttemptState::MarkerCreated);
}

#[tokio::test]
async fn test_existing_marker_skips_injection() {
    let backend = RecordingBackend::default();
    let engine = engine(backend.clone(), &["istio-proxy"], TerminationStrategy::Ephemeral);
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", running())
            .ephemeral("sidecar-terminator-istio-proxy")
            .build(),
    );

    let report = engine.terminate(&pod).await;

    assert!(backend.calls().is_empty());
    assert_eq!(report.attempt("istio-proxy").unwrap().state, AttemptState::AlreadyMarked);
}

#[tokio::test]
async fn test_ephemeral_refuses_shared_process_namespace() {
    let backend = RecordingBackend::default();
    let engine = engine(backend.clone(), &["istio-proxy"], TerminationStrategy::Ephemeral);
    let pod = PodSnapshot::from_pod(
        &PodFixture::job("job-1")
            .sidecar("istio-proxy", running())
            .shared_pid_namespace()
            .build(),
    );

    let report = engine.terminate(&pod).await;

    assert!(backend.calls().is_empty());
    let attempt = report.attempt("istio-proxy").unwrap();
    assert_eq!(attempt.state, AttemptState::FailedLogged);
    assert!(matches!(
        attempt.error,
        Some(TerminationError::SharedProcessNamespace { .. })
    ));
}

#[tokio::test]
async fn test_failed_injection_is_not_retried_in_the_same_pass() {
    let backend = RecordingBackend::scripted([Outcome::Fail]);
    let engine = engine(backend.clone(), &["istio-proxy"], TerminationStrategy::Ephemeral);
    let pod = PodSnapshot::from_pod(&PodFixture::job("job-1").sidecar("istio-proxy", running()).build());

    let report = engine.terminate(&pod).await;

    assert_eq!(backend.calls().len(), 1);
    assert_eq!(report.attempt("istio-proxy").unwrap().state, AttemptState::FailedLogged);
}
