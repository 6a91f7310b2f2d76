//! End-to-end scan pipeline tests against scripted backends

mod common;

use common::{marked, orchestrator, png, ScriptedClassifier, ScriptedProvider};
use cropscan_node::taxonomy::FALLBACK_KEY;
use cropscan_node::{Device, ScanError, ScanState, Severity, SubmitOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_early_blight_scan() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::returning(&[("early_blight", 0.85), ("healthy", 0.1)]),
        &[Device::Cpu],
    ));
    let orchestrator = orchestrator(provider, 1000);

    let outcome = orchestrator.submit(png(), "image/png").await;
    let record = outcome.record().expect("scan should complete");

    assert_eq!(record.disease_name, "Early Blight");
    assert_eq!(record.confidence, 85);
    assert_eq!(record.severity, Severity::Medium);
    assert!(!record.degraded);
    assert_eq!(orchestrator.state().state, ScanState::Completed);
    assert_eq!(orchestrator.intake().live_handles(), 0);
}

#[tokio::test]
async fn test_non_image_is_rejected_before_loading() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::returning(&[("healthy", 0.9)]),
        &[Device::Cpu],
    ));
    let orchestrator = orchestrator(provider.clone(), 1000);

    let outcome = orchestrator.submit(b"plain notes".to_vec(), "text/plain").await;

    assert!(matches!(
        outcome,
        SubmitOutcome::Rejected { error: ScanError::InvalidInput(_), .. }
    ));
    assert!(provider.attempts().is_empty());
    assert_eq!(orchestrator.loader().load_sequences(), 0);
    assert_eq!(orchestrator.state().state, ScanState::Failed);
}

#[tokio::test]
async fn test_all_devices_failing_degrades() {
    let provider = Arc::new(ScriptedProvider::new(ScriptedClassifier::returning(&[]), &[]));
    let orchestrator = orchestrator(provider.clone(), 1000);

    let outcome = orchestrator.submit(png(), "image/jpeg").await;
    let record = outcome.record().expect("degraded scans still complete");

    assert_eq!(record.key, FALLBACK_KEY);
    assert_eq!(record.confidence, 0);
    assert!(record.degraded);
    assert_eq!(provider.classifier().calls(), 0);
    assert_eq!(orchestrator.intake().live_handles(), 0);
}

#[tokio::test]
async fn test_inference_timeout_degrades() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::returning(&[("late_blight", 0.99)]).with_delay(Duration::from_secs(5)),
        &[Device::Cpu],
    ));
    let orchestrator = orchestrator(provider, 50);

    let record = orchestrator.submit(png(), "image/png").await.record().cloned().unwrap();

    assert_eq!(record.key, FALLBACK_KEY);
    assert_eq!(record.confidence, 0);
    assert!(record.degraded);
}

#[tokio::test]
async fn test_classifier_fault_degrades() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::failing("output tensor missing"),
        &[Device::Cpu],
    ));
    let orchestrator = orchestrator(provider, 1000);

    let record = orchestrator.submit(png(), "image/png").await.record().cloned().unwrap();
    assert!(record.degraded);
    assert_eq!(orchestrator.state().state, ScanState::Completed);
}

#[tokio::test]
async fn test_newer_submission_supersedes_older() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::returning(&[("septoria_leaf_spot", 0.77)])
            .slow_for(b"slow", Duration::from_millis(300)),
        &[Device::Cpu],
    ));
    let orchestrator = orchestrator(provider, 2000);
    let mut rx = orchestrator.subscribe();

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(marked(b"slow"), "image/png").await })
    };
    assert!(rx
        .wait_for(|s| s.sequence == 1 && s.state == ScanState::Scanning)
        .await
        .is_ok());

    let second = orchestrator.submit(png(), "image/png").await;
    let first = first.await.unwrap();

    assert_eq!(first, SubmitOutcome::Superseded { sequence: 1, latest: 2 });
    let record = second.record().cloned().unwrap();
    assert_eq!(record.disease_name, "Septoria Leaf Spot");

    // The stale result never overwrites the newer one
    let snapshot = orchestrator.state();
    assert_eq!(snapshot.sequence, 2);
    assert_eq!(snapshot.result, Some(record));
    assert_eq!(orchestrator.intake().live_handles(), 0);
    assert_eq!(orchestrator.intake().stats().released, 2);
}

#[tokio::test]
async fn test_dropped_caller_does_not_strand_the_scan() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::returning(&[("bacterial_spot", 0.88)]).with_delay(Duration::from_millis(150)),
        &[Device::Cpu],
    ));
    let orchestrator = orchestrator(provider, 2000);
    let mut rx = orchestrator.subscribe();

    let caller = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(png(), "image/png").await })
    };
    assert!(rx.wait_for(|s| s.state == ScanState::Scanning).await.is_ok());

    // The client goes away mid-inference
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    let finished = tokio::time::timeout(
        Duration::from_secs(2),
        rx.wait_for(|s| s.state.is_terminal()),
    )
    .await
    .expect("scan should reach a terminal state")
    .map(|snapshot| snapshot.clone())
    .unwrap();

    assert_eq!(finished.state, ScanState::Completed);
    assert_eq!(finished.result.unwrap().disease_name, "Bacterial Spot");
    assert_eq!(orchestrator.intake().live_handles(), 0);
}

#[tokio::test]
async fn test_session_stale_after_loading_skips_inference() {
    let provider = Arc::new(
        ScriptedProvider::new(ScriptedClassifier::returning(&[("healthy", 0.9)]), &[Device::Cpu])
            .with_load_delay(Duration::from_millis(100)),
    );
    let orchestrator = orchestrator(provider.clone(), 1000);
    let mut rx = orchestrator.subscribe();

    let pending = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(png(), "image/png").await })
    };
    assert!(rx.wait_for(|s| s.state == ScanState::Loading).await.is_ok());

    orchestrator.reset();
    let outcome = pending.await.unwrap();

    assert!(outcome.is_superseded());
    assert_eq!(provider.classifier().calls(), 0);
    assert_eq!(orchestrator.state().state, ScanState::Idle);
    assert_eq!(orchestrator.intake().live_handles(), 0);
}

#[tokio::test]
async fn test_snapshot_stream_follows_state_machine() {
    let provider = Arc::new(
        ScriptedProvider::new(
            ScriptedClassifier::returning(&[("powdery_mildew", 0.64)])
                .with_delay(Duration::from_millis(50)),
            &[Device::Cpu],
        )
        .with_load_delay(Duration::from_millis(50)),
    );
    let orchestrator = orchestrator(provider, 1000);
    let mut updates = orchestrator.updates();

    let initial = updates.next().await.unwrap();
    assert_eq!(initial.state, ScanState::Idle);
    assert_eq!(initial.sequence, 0);

    let submission = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move { orchestrator.submit(png(), "image/webp").await })
    };

    let mut seen = Vec::new();
    while let Some(snapshot) = updates.next().await {
        seen.push(snapshot.state);
        if snapshot.state.is_terminal() {
            assert_eq!(snapshot.result.unwrap().disease_name, "Powdery Mildew");
            break;
        }
    }

    assert_eq!(seen, vec![ScanState::Loading, ScanState::Scanning, ScanState::Completed]);
    assert!(submission.await.unwrap().record().is_some());
}

#[tokio::test]
async fn test_backend_is_reused_across_scans() {
    let provider = Arc::new(ScriptedProvider::new(
        ScriptedClassifier::returning(&[("black_rot", 0.8)]),
        &[Device::Cuda],
    ));
    let orchestrator = orchestrator(provider.clone(), 1000);

    for _ in 0..3 {
        assert!(orchestrator.submit(png(), "image/png").await.record().is_some());
    }

    assert_eq!(orchestrator.loader().load_sequences(), 1);
    assert_eq!(provider.classifier().calls(), 3);
    assert_eq!(orchestrator.state().sequence, 3);
}
