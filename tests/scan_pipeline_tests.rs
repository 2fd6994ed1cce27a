mod common;

use std::sync::Arc;

use common::*;
use recon_backend::{
    models::{InstanceFilter, InstanceStatus, ScanJobCreate, ScanStatus, ScannerKind, Severity, TargetCreate},
    repositories::{
        InMemoryScanJobRepository, InMemoryTargetRepository, InMemoryVulnerabilityRepository,
        ScanJobRepository, TargetRepository,
    },
    services::{AdapterRegistry, ScanEvent, ScannerAdapter},
    AppState,
};

fn is_running(job: &recon_backend::models::ScanJob) -> bool {
    job.status == ScanStatus::Running
}

#[tokio::test]
async fn test_two_slots_cancel_and_complete() {
    let app = create_test_app(2);
    let t1 = app.create_target("10.0.0.1").await;
    let t2 = app.create_target("10.0.0.2").await;
    let t3 = app.create_target("10.0.0.3").await;

    app.adapter.gate("10.0.0.1");
    app.adapter.gate("10.0.0.2");
    app.adapter.gate("10.0.0.3");
    app.adapter
        .script("10.0.0.2", Script::Complete(single_port_report("10.0.0.2", 80, "http")));

    let s1 = app.submit(&t1).await;
    let s2 = app.submit(&t2).await;
    let s3 = app.submit(&t3).await;

    assert_eq!(app.job(&s1).await.status, ScanStatus::Running);
    assert_eq!(app.job(&s2).await.status, ScanStatus::Running);
    let queued = app.job(&s3).await;
    assert_eq!(queued.status, ScanStatus::Queued);
    assert_eq!(queued.queue_position, 1);

    assert!(app.manager().cancel(&s1));
    let cancelled = app.wait_for(&s1, |j| j.status.is_terminal()).await;
    assert_eq!(cancelled.status, ScanStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());

    let promoted = app.wait_for(&s3, is_running).await;
    assert_eq!(promoted.queue_position, 0);

    app.adapter.release("10.0.0.2");
    let done = app
        .wait_for(&s2, |j| j.status == ScanStatus::Completed && j.finding_count == 1)
        .await;
    assert_eq!(done.progress, 100);
    assert_eq!(done.severity_breakdown.get("Info"), Some(&1));
    assert!(done.raw_output.is_some());

    let definitions = app
        .state
        .vulnerability_repository
        .list_definitions(50, 0)
        .await
        .unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].name, "Open Port 80/tcp (http)");
    assert_eq!(definitions[0].severity, Severity::Info);

    let instances = app
        .state
        .vulnerability_repository
        .list_instances(
            &InstanceFilter {
                scan_id: Some(s2),
                ..Default::default()
            },
            50,
            0,
        )
        .await
        .unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, InstanceStatus::Open);
    assert_eq!(instances[0].port, Some(80));
    assert_eq!(instances[0].target_id, t2.id);

    app.manager().cancel(&s3);
    app.wait_for(&s3, |j| j.status.is_terminal()).await;
}

#[tokio::test]
async fn test_queue_drains_in_submission_order() {
    let app = create_test_app(1);
    let addresses = ["10.1.0.1", "10.1.0.2", "10.1.0.3", "10.1.0.4"];
    let mut scans = Vec::new();
    for address in addresses {
        app.adapter.gate(address);
        let target = app.create_target(address).await;
        scans.push(app.submit(&target).await);
    }

    assert!(is_running(&app.job(&scans[0]).await));
    for (index, scan_id) in scans.iter().enumerate().skip(1) {
        let job = app.job(scan_id).await;
        assert_eq!(job.status, ScanStatus::Queued);
        assert_eq!(job.queue_position, index as i32);
    }

    app.adapter.release(addresses[0]);
    app.wait_for(&scans[1], is_running).await;
    app.wait_for(&scans[2], |j| j.queue_position == 1).await;
    app.wait_for(&scans[3], |j| j.queue_position == 2).await;

    app.adapter.release(addresses[1]);
    app.wait_for(&scans[2], is_running).await;
    app.wait_for(&scans[3], |j| j.queue_position == 1).await;

    app.adapter.release(addresses[2]);
    app.adapter.release(addresses[3]);
    app.wait_for(&scans[3], |j| j.status == ScanStatus::Completed).await;

    assert_eq!(app.adapter.started(), addresses.to_vec());
    let state = app.manager().get_queue_state().await.unwrap();
    assert_eq!(state.active_count, 0);
    assert_eq!(state.queue_size, 0);
}

#[tokio::test]
async fn test_active_count_never_exceeds_limit() {
    let app = create_test_app(2);
    let mut scans = Vec::new();
    for i in 0..5 {
        let address = format!("10.2.0.{}", i);
        app.adapter.gate(&address);
        let target = app.create_target(&address).await;
        scans.push(app.submit(&target).await);
    }

    let state = app.manager().get_queue_state().await.unwrap();
    assert_eq!(state.max_concurrent, 2);
    assert_eq!(state.active_count, 2);
    assert_eq!(state.active_jobs.len(), 2);
    assert_eq!(state.queue_size, 3);
    let positions: Vec<usize> = state.queued_jobs.iter().map(|j| j.queue_position).collect();
    assert_eq!(positions, vec![1, 2, 3]);
    assert_eq!(state.queued_jobs[0].scan_id, scans[2]);

    // Queued jobs pick up freed slots and are cancelled in turn
    let mut finished = 0;
    for _ in 0..200 {
        finished = 0;
        for scan_id in &scans {
            app.manager().cancel(scan_id);
            if app.job(scan_id).await.status.is_terminal() {
                finished += 1;
            }
        }
        let state = app.manager().get_queue_state().await.unwrap();
        assert!(state.active_count <= 2);
        if finished == scans.len() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(finished, scans.len());
    for scan_id in &scans {
        assert_eq!(app.job(scan_id).await.status, ScanStatus::Cancelled);
    }
}

#[tokio::test]
async fn test_failure_frees_slot_for_next_job() {
    let app = create_test_app(1);
    let a = app.create_target("10.3.0.1").await;
    let b = app.create_target("10.3.0.2").await;
    app.adapter.gate("10.3.0.1");
    app.adapter.gate("10.3.0.2");
    app.adapter
        .script("10.3.0.1", Script::Fail("engine exited with status 1".to_string()));

    let first = app.submit(&a).await;
    let second = app.submit(&b).await;
    assert_eq!(app.job(&second).await.status, ScanStatus::Queued);

    app.adapter.release("10.3.0.1");
    let failed = app.wait_for(&first, |j| j.status.is_terminal()).await;
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(failed
        .errors
        .iter()
        .any(|e| e.contains("engine exited with status 1")));

    app.wait_for(&second, is_running).await;
    app.adapter.release("10.3.0.2");
    app.wait_for(&second, |j| j.status == ScanStatus::Completed).await;
}

#[tokio::test]
async fn test_panicking_adapter_fails_only_its_job() {
    let app = create_test_app(1);
    let bad = app.create_target("10.4.0.1").await;
    let good = app.create_target("10.4.0.2").await;
    app.adapter.script("10.4.0.1", Script::Panic);

    let crashed = app.submit(&bad).await;
    let next = app.submit(&good).await;

    let failed = app.wait_for(&crashed, |j| j.status.is_terminal()).await;
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(failed.errors.iter().any(|e| e.contains("panicked")));

    app.wait_for(&next, |j| j.status == ScanStatus::Completed).await;
}

#[tokio::test]
async fn test_cancel_is_idempotent() {
    let app = create_test_app(1);
    let target = app.create_target("10.5.0.1").await;
    app.adapter.gate("10.5.0.1");
    let scan_id = app.submit(&target).await;

    assert!(app.manager().cancel(&scan_id));
    app.manager().cancel(&scan_id);
    let job = app.wait_for(&scan_id, |j| j.status.is_terminal()).await;
    assert_eq!(job.status, ScanStatus::Cancelled);

    assert!(!app.manager().cancel(&scan_id));
    assert!(!app.manager().cancel(&uuid::Uuid::new_v4()));
    assert_eq!(app.job(&scan_id).await.status, ScanStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_after_completion_keeps_status() {
    let app = create_test_app(1);
    let target = app.create_target("10.5.0.2").await;
    let scan_id = app.submit(&target).await;

    app.wait_for(&scan_id, |j| j.status == ScanStatus::Completed).await;
    assert!(!app.manager().cancel(&scan_id));
    assert_eq!(app.job(&scan_id).await.status, ScanStatus::Completed);
}

#[tokio::test]
async fn test_missing_target_fails_without_queueing() {
    let app = create_test_app(1);
    let scan_id = app
        .manager()
        .submit(ScanJobCreate {
            target_id: uuid::Uuid::new_v4(),
            scanner: ScannerKind::LineStream,
            args: None,
            engine_config_id: None,
        })
        .await
        .unwrap();

    let job = app.job(&scan_id).await;
    assert_eq!(job.status, ScanStatus::Failed);
    assert!(app.adapter.started().is_empty());
    assert_eq!(app.manager().get_queue_state().await.unwrap().queue_size, 0);
}

#[tokio::test]
async fn test_delete_rules() {
    let app = create_test_app(1);
    let a = app.create_target("10.6.0.1").await;
    let b = app.create_target("10.6.0.2").await;
    let c = app.create_target("10.6.0.3").await;
    for address in ["10.6.0.1", "10.6.0.2", "10.6.0.3"] {
        app.adapter.gate(address);
    }

    let running = app.submit(&a).await;
    let queued = app.submit(&b).await;
    let last = app.submit(&c).await;
    assert_eq!(app.job(&last).await.queue_position, 2);

    let err = app.manager().delete(&running).await.unwrap_err();
    assert!(matches!(err, recon_backend::error::ApiError::Conflict(_)));

    app.manager().delete(&queued).await.unwrap();
    assert!(app.manager().get_job(&queued).await.is_err());
    assert_eq!(app.job(&last).await.queue_position, 1);

    app.manager().cancel(&running);
    app.wait_for(&running, |j| j.status.is_terminal()).await;
    app.manager().delete(&running).await.unwrap();

    app.wait_for(&last, is_running).await;
    app.adapter.release("10.6.0.3");
    app.wait_for(&last, |j| j.status == ScanStatus::Completed).await;
    assert_eq!(app.adapter.started(), vec!["10.6.0.1", "10.6.0.3"]);
}

#[tokio::test]
async fn test_observer_sees_ordered_progress_until_terminal() {
    let app = create_test_app(1);
    let target = app.create_target("10.7.0.1").await;
    app.adapter.gate("10.7.0.1");
    app.adapter
        .script("10.7.0.1", Script::Complete(single_port_report("10.7.0.1", 22, "ssh")));

    let scan_id = app.submit(&target).await;
    let mut subscription = app.manager().broadcaster().subscribe(scan_id);
    app.adapter.release("10.7.0.1");

    let mut percents = Vec::new();
    let mut last = None;
    while let Some(event) = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        subscription.events.recv(),
    )
    .await
    .unwrap()
    {
        if let ScanEvent::Progress(progress) = &event {
            percents.push(progress.progress);
        }
        last = Some(event);
    }

    assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
    match last {
        Some(ScanEvent::Progress(progress)) => {
            assert_eq!(progress.status, ScanStatus::Completed);
            assert_eq!(progress.progress, 100);
            assert_eq!(progress.finding_count, 1);
        }
        other => panic!("expected terminal progress, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recover_interrupted_jobs() {
    let settings = Arc::new(test_settings(2));
    let scans = Arc::new(InMemoryScanJobRepository::new());
    let targets = Arc::new(InMemoryTargetRepository::new());
    let vulns = Arc::new(InMemoryVulnerabilityRepository::new());

    let target = targets
        .create(&TargetCreate {
            name: "restart".to_string(),
            address: "10.8.0.1".to_string(),
            description: None,
        })
        .await
        .unwrap();
    let create = ScanJobCreate {
        target_id: target.id,
        scanner: ScannerKind::LineStream,
        args: None,
        engine_config_id: None,
    };
    let was_running = scans.create(&create).await.unwrap();
    assert!(scans.mark_running(&was_running.id).await.unwrap());
    let never_started = scans.create(&create).await.unwrap();

    let adapter = ScriptedAdapter::new();
    let engine: Arc<dyn ScannerAdapter> = adapter.clone();
    let state = AppState::with_repositories(
        settings,
        None,
        scans,
        targets,
        vulns,
        AdapterRegistry::new(engine.clone(), engine.clone(), engine),
    );
    let app = TestApp { state, adapter };

    let report = app.manager().recover_interrupted().await.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.resubmitted, 1);

    let failed = app.job(&was_running.id).await;
    assert_eq!(failed.status, ScanStatus::Failed);
    assert!(failed
        .errors
        .iter()
        .any(|e| e.contains("interrupted by service restart")));

    app.wait_for(&never_started.id, |j| j.status == ScanStatus::Completed)
        .await;
}
