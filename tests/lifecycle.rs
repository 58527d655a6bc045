mod common;

use std::sync::atomic::Ordering;

use common::{ALL_FILES, DIRECT_HOST, FakeControlPlane, Harness, POD, pod};
use runpod_node_manager::runpod_orchestrator::RestoreReport;
use runpod_node_manager::{
    CreateOptions, DiscoverySource, PodError, PodId, PodStatus, RestoreOutcome, StartRestore,
    StopBackup,
};

const RTX_4090: &str = "NVIDIA GeForce RTX 4090";
const RTX_3090: &str = "NVIDIA GeForce RTX 3090";

fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// ============================================================================
// create
// ============================================================================

#[tokio::test(start_paused = true)]
async fn create_falls_back_to_next_gpu_and_waits_for_running() {
    let control = FakeControlPlane::with_statuses(&[PodStatus::Pending, PodStatus::Running]);
    lock(&control.unavailable_gpus).insert(RTX_4090.to_string());
    let h = Harness::new(control, false);

    let report = h.manager.create(CreateOptions::default()).await;

    let Ok(report) = report else {
        panic!("create failed: {report:?}");
    };
    assert_eq!(report.pod_id, pod());
    assert_eq!(report.gpu_type, RTX_3090);
    assert_eq!(report.detail.status, PodStatus::Running);
    assert_eq!(
        h.control.calls(),
        vec![format!("create:{RTX_4090}"), format!("create:{RTX_3090}")]
    );
    assert_eq!(h.settings.snapshot().get("POD_ID").map(String::as_str), Some(POD));
    assert!(h.backup_dir().join("pod_info.json").is_file());
}

#[tokio::test(start_paused = true)]
async fn create_reports_every_rejected_gpu() {
    let control = FakeControlPlane::with_statuses(&[PodStatus::Running]);
    {
        let mut unavailable = lock(&control.unavailable_gpus);
        unavailable.insert(RTX_4090.to_string());
        unavailable.insert(RTX_3090.to_string());
        unavailable.insert("NVIDIA GeForce RTX 4080 SUPER".to_string());
    }
    let h = Harness::new(control, false);

    let res = h.manager.create(CreateOptions::default()).await;

    assert!(matches!(res, Err(PodError::CreateFailed { ref tried }) if tried.len() == 3));
    assert!(!h.settings.snapshot().contains_key("POD_ID"));
}

// ============================================================================
// start
// ============================================================================

#[tokio::test(start_paused = true)]
async fn start_restores_backup_onto_fresh_endpoint() {
    let h = Harness::new(
        FakeControlPlane::with_statuses(&[PodStatus::Stopped, PodStatus::Pending, PodStatus::Running]),
        false,
    );
    h.seed_backup(&ALL_FILES);
    h.make_reachable();

    let report = h.manager.start(&pod()).await;

    let Ok(report) = report else {
        panic!("start failed: {report:?}");
    };
    assert!(!report.already_running);
    assert!(h.control.calls().contains(&format!("start:{POD}")));
    assert!(matches!(
        report.connection,
        Some(ref c) if c.source == DiscoverySource::DirectTcp && c.endpoint.host == DIRECT_HOST
    ));
    assert_eq!(
        report.restore,
        StartRestore::Restored(RestoreOutcome::Restored {
            restart_script_ok: true
        })
    );
}

#[tokio::test(start_paused = true)]
async fn start_resolves_fresh_endpoint_ignoring_cache() {
    let h = Harness::new(
        FakeControlPlane::with_statuses(&[PodStatus::Exited, PodStatus::Running]),
        false,
    );
    h.settings.set("POD_ID", POD);
    h.settings.set("SSH_HOST", "198.51.100.1");
    h.settings.set("SSH_PORT", "41000");
    h.settings.set("SSH_USERNAME", "root");
    h.shell.set_live("198.51.100.1", 41000);
    h.make_reachable();

    let report = h.manager.start(&pod()).await;

    let Ok(report) = report else {
        panic!("start failed: {report:?}");
    };
    assert!(matches!(
        report.connection,
        Some(ref c) if c.source == DiscoverySource::DirectTcp
    ));
    assert_eq!(report.restore, StartRestore::NoBackup);
    assert_eq!(
        h.settings.snapshot().get("SSH_HOST").map(String::as_str),
        Some(DIRECT_HOST)
    );
}

#[tokio::test(start_paused = true)]
async fn start_on_running_pod_does_nothing() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);
    h.seed_backup(&ALL_FILES);

    let report = h.manager.start(&pod()).await;

    let Ok(report) = report else {
        panic!("start failed: {report:?}");
    };
    assert!(report.already_running);
    assert_eq!(
        report.restore,
        StartRestore::Skipped {
            backup_available: true
        }
    );
    assert!(h.control.calls().is_empty());
    assert_eq!(h.shell.remote_activity(), 0);
}

#[tokio::test(start_paused = true)]
async fn start_on_running_pod_without_backup_reports_none_available() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);

    let report = h.manager.start(&pod()).await;

    assert_eq!(
        report.ok().map(|r| r.restore),
        Some(StartRestore::Skipped {
            backup_available: false
        })
    );
}

#[tokio::test(start_paused = true)]
async fn start_without_ssh_reports_unavailable_connection() {
    let h = Harness::new(
        FakeControlPlane::with_statuses(&[PodStatus::Stopped, PodStatus::Running]),
        false,
    );
    h.seed_backup(&ALL_FILES);

    let report = h.manager.start(&pod()).await;

    assert!(matches!(
        report,
        Ok(ref r) if matches!(r.restore, StartRestore::ConnectionUnavailable(_)) && r.connection.is_none()
    ));
    assert!(h.shell.uploads().is_empty());
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_while_starting_is_an_error() {
    let h = Harness::new(
        FakeControlPlane::with_statuses(&[PodStatus::Stopped, PodStatus::OutOfCredit]),
        false,
    );

    let res = h.manager.start(&pod()).await;

    assert!(matches!(
        res,
        Err(PodError::TerminalFailure {
            status: PodStatus::OutOfCredit,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn pod_terminated_while_starting_clears_saved_state() {
    let h = Harness::new(
        FakeControlPlane::with_statuses(&[PodStatus::Stopped, PodStatus::Terminated]),
        false,
    );
    h.settings.set("POD_ID", POD);
    h.settings.set("SSH_HOST", DIRECT_HOST);
    h.settings.set("SSH_KEY_PATH", "/keys/id");

    let res = h.manager.start(&pod()).await;

    assert!(matches!(
        res,
        Err(PodError::TerminalFailure {
            status: PodStatus::Terminated,
            ..
        })
    ));
    let saved = h.settings.snapshot();
    assert!(!saved.contains_key("POD_ID"));
    assert!(!saved.contains_key("SSH_HOST"));
    assert!(saved.contains_key("SSH_KEY_PATH"));
}

// ============================================================================
// stop
// ============================================================================

#[tokio::test(start_paused = true)]
async fn stop_backs_up_then_stops() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);
    h.make_reachable();

    let res = h.manager.stop(&pod()).await;

    assert!(matches!(res, Ok(StopBackup::Saved(ref paths)) if paths.len() == 3));
    assert_eq!(h.control.calls(), vec![format!("stop:{POD}")]);
    assert_eq!(h.confirm.asked.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn declined_stop_after_failed_backup_sends_no_stop() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);

    let res = h.manager.stop(&pod()).await;

    assert!(matches!(res, Err(PodError::Cancelled)));
    assert_eq!(h.confirm.asked.load(Ordering::SeqCst), 1);
    assert!(h.control.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn confirmed_stop_after_failed_backup_proceeds() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), true);

    let res = h.manager.stop(&pod()).await;

    assert!(matches!(res, Ok(StopBackup::FailedConfirmed(_))));
    assert_eq!(h.control.calls(), vec![format!("stop:{POD}")]);
}

#[tokio::test(start_paused = true)]
async fn stopping_a_stopped_pod_skips_backup() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Stopped]), false);

    let res = h.manager.stop(&pod()).await;

    assert_eq!(res.ok(), Some(StopBackup::Skipped(PodStatus::Stopped)));
    assert_eq!(h.shell.remote_activity(), 0);
}

// ============================================================================
// terminate, status, clean
// ============================================================================

#[tokio::test(start_paused = true)]
async fn terminate_clears_state_even_when_removal_fails() {
    let control = FakeControlPlane::with_statuses(&[PodStatus::Running]);
    *lock(&control.fail_remove) = true;
    let h = Harness::new(control, false);
    h.settings.set("POD_ID", POD);
    h.settings.set("SSH_HOST", DIRECT_HOST);
    h.settings.set("SSH_KEY_PATH", "/keys/id");

    let res = h.manager.terminate(&pod()).await;

    assert!(res.is_err());
    let saved = h.settings.snapshot();
    assert!(!saved.contains_key("POD_ID"));
    assert!(!saved.contains_key("SSH_HOST"));
    assert_eq!(saved.get("SSH_KEY_PATH").map(String::as_str), Some("/keys/id"));
}

#[tokio::test(start_paused = true)]
async fn vanished_pod_clears_saved_identity() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::NotFound]), false);
    h.settings.set("POD_ID", POD);
    h.settings.set("SSH_HOST", DIRECT_HOST);

    let res = h.manager.start(&pod()).await;

    assert!(matches!(res, Err(PodError::NotFound(_))));
    let saved = h.settings.snapshot();
    assert!(!saved.contains_key("POD_ID"));
    assert!(!saved.contains_key("SSH_HOST"));
    assert!(h.control.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clean_keeps_the_key_path() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);
    h.settings.set("POD_ID", POD);
    h.settings.set("SSH_PORT", "40022");
    h.settings.set("SSH_KEY_PATH", "/keys/id");

    assert!(h.manager.clean().is_ok());

    let saved = h.settings.snapshot();
    assert_eq!(saved.len(), 1);
    assert!(saved.contains_key("SSH_KEY_PATH"));
}

// ============================================================================
// identity, restore, connect
// ============================================================================

#[tokio::test(start_paused = true)]
async fn first_listed_pod_is_adopted() {
    let control = FakeControlPlane::with_statuses(&[PodStatus::Running]);
    *lock(&control.listed) = vec![PodId::new("z9z9z9z9z9z9z9"), pod()];
    let h = Harness::new(control, false);

    let id = h.manager.current_pod_id().await;

    assert_eq!(id.ok(), Some(PodId::new("z9z9z9z9z9z9z9")));
    assert_eq!(
        h.settings.snapshot().get("POD_ID").map(String::as_str),
        Some("z9z9z9z9z9z9z9")
    );
}

#[tokio::test(start_paused = true)]
async fn saved_identity_wins_over_listing() {
    let control = FakeControlPlane::with_statuses(&[PodStatus::Running]);
    *lock(&control.listed) = vec![PodId::new("z9z9z9z9z9z9z9")];
    let h = Harness::new(control, false);
    h.settings.set("POD_ID", POD);

    assert_eq!(h.manager.current_pod_id().await.ok(), Some(pod()));
}

#[tokio::test(start_paused = true)]
async fn no_identity_anywhere_is_missing_pod_id() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);

    let res = h.manager.current_pod_id().await;
    assert!(matches!(res, Err(PodError::MissingPodId)));
}

#[tokio::test(start_paused = true)]
async fn restore_checks_local_files_first() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);
    h.seed_backup(&["userData.json"]);

    let res = h.manager.restore(&pod()).await;

    assert!(matches!(res, Err(PodError::MissingBackupFiles(ref m)) if m.len() == 2));
    assert_eq!(h.control.status_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_on_stopped_pod_goes_through_start() {
    let h = Harness::new(
        FakeControlPlane::with_statuses(&[
            PodStatus::Stopped,
            PodStatus::Stopped,
            PodStatus::Pending,
            PodStatus::Running,
        ]),
        false,
    );
    h.seed_backup(&ALL_FILES);
    h.make_reachable();

    let res = h.manager.restore(&pod()).await;

    let Ok(RestoreReport::ViaStart(report)) = res else {
        panic!("expected restore through start, got {res:?}");
    };
    assert!(matches!(report.restore, StartRestore::Restored(_)));
    assert!(h.control.calls().contains(&format!("start:{POD}")));
}

#[tokio::test(start_paused = true)]
async fn restore_on_running_pod_is_direct() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);
    h.seed_backup(&ALL_FILES);
    h.make_reachable();

    let res = h.manager.restore(&pod()).await;

    assert!(matches!(
        res,
        Ok(RestoreReport::Direct(RestoreOutcome::Restored {
            restart_script_ok: true
        }))
    ));
    assert!(h.control.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_reports_direct_details() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Running]), false);
    h.make_reachable();

    let res = h.manager.connect(&pod(), false).await;

    let Ok(report) = res else {
        panic!("connect failed: {res:?}");
    };
    assert_eq!(report.status, PodStatus::Running);
    assert_eq!(report.web_url, format!("https://{POD}-3000.proxy.runpod.net"));
    assert!(
        report
            .scp_template
            .as_deref()
            .is_some_and(|s| s.starts_with("scp -P 40022 "))
    );
}

#[tokio::test(start_paused = true)]
async fn connect_to_stopped_pod_needs_force() {
    let h = Harness::new(FakeControlPlane::with_statuses(&[PodStatus::Stopped]), false);

    let res = h.manager.connect(&pod(), false).await;
    assert!(matches!(res, Err(PodError::NotRunning { .. })));
    assert_eq!(h.shell.remote_activity(), 0);
}
