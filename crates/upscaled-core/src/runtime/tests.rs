use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use image::{GenericImageView, ImageFormat};
use tempfile::TempDir;

use crate::api::{Config, Service};
use crate::engine::testing::{
    NearestUpscale, failing_loader, nearest_loader, pattern, png_bytes, unavailable_loader,
};
use crate::engine::{EngineError, EngineLoader, InferenceEngine, encode_image};
use crate::runtime::reaper::{ReapReport, reap_once};
use crate::runtime::registry::TaskRegistry;
use crate::runtime::store::FileStore;
use crate::runtime::types::{ErrorKind, RuntimeError, TaskId, TaskStatus, TaskStatusView, progress};

async fn start(dir: &TempDir, loader: EngineLoader, tweak: impl FnOnce(&mut Config)) -> Service {
    let mut config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    tweak(&mut config);
    Service::start(config, loader).await.unwrap()
}

/// Poll until the task is terminal, returning every distinct observation.
async fn wait_terminal(service: &Service, task_id: TaskId) -> Vec<TaskStatusView> {
    let mut seen: Vec<TaskStatusView> = Vec::new();
    for _ in 0..1000 {
        let view = service.get_status(task_id).unwrap();
        let changed = seen
            .last()
            .is_none_or(|last| (last.status, last.progress) != (view.status, view.progress));
        let terminal = view.status.is_terminal();
        if changed {
            seen.push(view);
        }
        if terminal {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} did not finish: {seen:?}");
}

async fn wait_status(service: &Service, task_id: TaskId, status: TaskStatus) {
    for _ in 0..1000 {
        if service.get_status(task_id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {task_id} never reached {status}");
}

fn files_with_prefix(dir: &Path, task_id: TaskId) -> Vec<String> {
    let prefix = task_id.to_string();
    ["uploads", "outputs"]
        .iter()
        .flat_map(|area| std::fs::read_dir(dir.join(area)).unwrap())
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(&prefix))
        .collect()
}

fn file_count(dir: &Path) -> usize {
    ["uploads", "outputs"]
        .iter()
        .map(|area| std::fs::read_dir(dir.join(area)).unwrap().count())
        .sum()
}

fn rank(view: &TaskStatusView) -> (u8, u8) {
    match view.status {
        TaskStatus::Queued => (0, view.progress),
        TaskStatus::Processing => (1, view.progress),
        TaskStatus::Completed | TaskStatus::Error => (2, 0),
    }
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

// ── Happy path ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn completes_with_four_times_the_resolution() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    let task_id = service
        .submit_task(Bytes::from(png_bytes(100, 100, 1)), "photo.png")
        .await
        .unwrap();
    let seen = wait_terminal(&service, task_id).await;
    let last = seen.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed, "{last:?}");
    assert_eq!(last.progress, progress::DONE);

    let result = service.get_result(task_id).await.unwrap();
    assert_eq!(result.filename, format!("{task_id}_upscaled_photo.png"));
    assert_eq!(result.content_type, "image/png");
    let decoded = image::load_from_memory(&result.bytes).unwrap();
    assert_eq!(decoded.dimensions(), (400, 400));
}

#[tokio::test]
async fn observed_progress_is_monotonic_and_on_checkpoints() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::from_millis(150)), |_| {}).await;

    let task_id = service
        .submit_task(Bytes::from(png_bytes(16, 16, 2)), "a.png")
        .await
        .unwrap();
    let seen = wait_terminal(&service, task_id).await;

    for view in &seen {
        assert!(progress::CHECKPOINTS.contains(&view.progress), "{view:?}");
    }
    for pair in seen.windows(2) {
        assert!(rank(&pair[0]) <= rank(&pair[1]), "went backwards: {pair:?}");
    }
    assert!(
        seen.iter()
            .any(|v| v.status == TaskStatus::Processing && v.progress == progress::INFERENCE_STARTED),
        "inference checkpoint should be visible while the transform runs: {seen:?}"
    );
    assert_eq!(seen.last().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn jpeg_input_produces_jpeg_output() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    let jpeg = encode_image(&pattern(20, 10, 5), ImageFormat::Jpeg).unwrap();
    let task_id = service.submit_task(Bytes::from(jpeg), "shot.JPEG").await.unwrap();
    wait_terminal(&service, task_id).await;

    let result = service.get_result(task_id).await.unwrap();
    assert_eq!(result.content_type, "image/jpeg");
    assert_eq!(image::guess_format(&result.bytes).unwrap(), ImageFormat::Jpeg);
    assert_eq!(
        image::load_from_memory(&result.bytes).unwrap().dimensions(),
        (80, 40)
    );
}

#[tokio::test]
async fn concurrent_tasks_do_not_cross_contaminate() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::from_millis(20)), |c| {
        c.engine_instances = 2;
        c.max_workers = 2;
    })
    .await;

    let input_a = png_bytes(24, 24, 11);
    let input_b = png_bytes(24, 24, 97);
    let (a, b) = tokio::join!(
        service.submit_task(Bytes::from(input_a.clone()), "a.png"),
        service.submit_task(Bytes::from(input_b.clone()), "b.png"),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_ne!(a, b);
    wait_terminal(&service, a).await;
    wait_terminal(&service, b).await;

    let reference = InferenceEngine::new(NearestUpscale::new(4, Duration::ZERO));
    let expected_a = content_hash(&reference.upscale(&input_a).unwrap());
    let expected_b = content_hash(&reference.upscale(&input_b).unwrap());
    assert_ne!(expected_a, expected_b);

    // Read back through the task-id-prefixed artifacts on disk.
    for (task_id, expected) in [(a, expected_a), (b, expected_b)] {
        let output = dir
            .path()
            .join("outputs")
            .join(format!("{task_id}_upscaled_{}.png", if task_id == a { "a" } else { "b" }));
        let stored = std::fs::read(output).unwrap();
        assert_eq!(content_hash(&stored), expected);
        let served = service.get_result(task_id).await.unwrap();
        assert_eq!(content_hash(&served.bytes), expected);
    }
}

#[tokio::test]
async fn untrusted_filenames_are_sanitized() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    let id = service
        .submit_task(Bytes::from(png_bytes(4, 4, 0)), "../../etc/evil name.png")
        .await
        .unwrap();
    wait_terminal(&service, id).await;
    assert_eq!(
        service.get_result(id).await.unwrap().filename,
        format!("{id}_upscaled_etc_evil_name.png")
    );
    assert!(dir.path().join("uploads").join(format!("{id}_etc_evil_name.png")).is_file());

    let id = service
        .submit_task(Bytes::from(png_bytes(4, 4, 0)), "ümläut.png")
        .await
        .unwrap();
    wait_terminal(&service, id).await;
    assert_eq!(
        service.get_result(id).await.unwrap().filename,
        format!("{id}_upscaled_mlut.png")
    );

    let id = service
        .submit_task(Bytes::from(png_bytes(4, 4, 0)), "日本.png")
        .await
        .unwrap();
    wait_terminal(&service, id).await;
    assert_eq!(
        service.get_result(id).await.unwrap().filename,
        format!("{id}_upscaled_image.png")
    );
}

// ── Validation ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn disallowed_extensions_never_create_a_task() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    for name in ["anim.gif", "noextension", "trailingdot.", "archive.png.zip"] {
        let err = service
            .submit_task(Bytes::from(png_bytes(4, 4, 0)), name)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidFileType, "{name}");
    }
    assert_eq!(service.stats().unwrap().tasks.total, 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn malformed_uploads_are_rejected_synchronously() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |c| c.max_upload_bytes = 64).await;

    let err = service.submit_task(Bytes::from_static(b"x"), "  ").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = service.submit_task(Bytes::new(), "empty.png").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = service
        .submit_task(Bytes::from(vec![0u8; 65]), "big.png")
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::PayloadTooLarge { size: 65, limit: 64 }));

    assert_eq!(service.stats().unwrap().tasks.total, 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;
    let id = TaskId::new_v4();

    assert_eq!(service.get_status(id).unwrap_err().kind(), ErrorKind::TaskNotFound);
    assert_eq!(
        service.get_result(id).await.unwrap_err().kind(),
        ErrorKind::TaskNotFound
    );
    assert_eq!(service.cleanup(id).await.unwrap_err().kind(), ErrorKind::TaskNotFound);
}

// ── Failures recorded on the task ─────────────────────────────────────────────

#[tokio::test]
async fn undecodable_input_ends_in_decode_error() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    let id = service
        .submit_task(Bytes::from_static(b"this is not a png"), "fake.png")
        .await
        .unwrap();
    let last = wait_terminal(&service, id).await.pop().unwrap();
    assert_eq!(last.status, TaskStatus::Error);
    assert_eq!(last.progress, 0);
    assert_eq!(last.error_kind, Some(ErrorKind::Decode));
    assert!(last.error.is_some());
    assert_eq!(
        service.get_result(id).await.unwrap_err().kind(),
        ErrorKind::TaskNotCompleted
    );
}

#[tokio::test]
async fn transform_failure_ends_in_inference_error() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, failing_loader(), |_| {}).await;

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap();
    let last = wait_terminal(&service, id).await.pop().unwrap();
    assert_eq!(last.error_kind, Some(ErrorKind::Inference));
    assert!(last.error.unwrap().contains("out of memory"));
}

#[tokio::test]
async fn oversized_image_ends_in_error_and_service_keeps_working() {
    let dir = TempDir::new().unwrap();
    let loader: EngineLoader = Arc::new(|_| {
        Ok(InferenceEngine::new(NearestUpscale::new(4, Duration::ZERO)).with_max_input_pixels(32 * 32))
    });
    let service = start(&dir, loader, |_| {}).await;

    let big = service
        .submit_task(Bytes::from(png_bytes(64, 64, 0)), "big.png")
        .await
        .unwrap();
    let last = wait_terminal(&service, big).await.pop().unwrap();
    assert_eq!(last.status, TaskStatus::Error);
    assert_eq!(last.error_kind, Some(ErrorKind::Decode));
    assert!(last.error.unwrap().contains("64x64"));

    let small = service
        .submit_task(Bytes::from(png_bytes(32, 32, 1)), "small.png")
        .await
        .unwrap();
    let last = wait_terminal(&service, small).await.pop().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert!(service.engine_status());
}

#[tokio::test]
async fn missing_engine_rejects_every_submission() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, unavailable_loader(), |_| {}).await;

    assert!(!service.engine_status());
    let err = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::EngineUnavailable);
    assert_eq!(service.stats().unwrap().tasks.total, 0);
    assert_eq!(file_count(dir.path()), 0);
}

#[tokio::test]
async fn reload_brings_an_unavailable_engine_online() {
    let dir = TempDir::new().unwrap();
    let healthy = Arc::new(AtomicBool::new(false));
    let loader: EngineLoader = {
        let healthy = Arc::clone(&healthy);
        Arc::new(move |_| {
            if healthy.load(Ordering::SeqCst) {
                Ok(InferenceEngine::new(NearestUpscale::new(4, Duration::ZERO)))
            } else {
                Err(EngineError::Unavailable {
                    reason: "weights missing".into(),
                })
            }
        })
    };
    let service = start(&dir, loader, |_| {}).await;
    assert!(!service.engine_status());
    assert_eq!(
        service.reload_engine().await.unwrap_err().kind(),
        ErrorKind::EngineUnavailable
    );

    healthy.store(true, Ordering::SeqCst);
    service.reload_engine().await.unwrap();
    assert!(service.engine_status());

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap();
    assert_eq!(
        wait_terminal(&service, id).await.pop().unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn deadline_marks_task_timed_out_and_frees_the_slot() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::from_millis(800)), |c| {
        c.max_workers = 1;
        c.job_timeout = Duration::from_millis(100);
    })
    .await;

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "slow.png")
        .await
        .unwrap();
    let last = wait_terminal(&service, id).await.pop().unwrap();
    assert_eq!(last.status, TaskStatus::Error);
    assert_eq!(last.error_kind, Some(ErrorKind::Timeout));

    for _ in 0..200 {
        if service.stats().unwrap().active_jobs == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let stats = service.stats().unwrap();
    assert_eq!(stats.active_jobs, 0);
    assert_eq!(stats.free_worker_slots, 1);
}

// ── Admission ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn full_queue_rejects_with_busy_and_creates_nothing() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::from_millis(300)), |c| {
        c.queue_capacity = 1;
        c.max_workers = 1;
    })
    .await;
    let image = Bytes::from(png_bytes(8, 8, 0));

    let running = service.submit_task(image.clone(), "a.png").await.unwrap();
    wait_status(&service, running, TaskStatus::Processing).await;

    let queued = service.submit_task(image.clone(), "b.png").await.unwrap();
    assert_eq!(service.get_status(queued).unwrap().status, TaskStatus::Queued);

    let err = service.submit_task(image.clone(), "c.png").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Busy { capacity: 1 }), "{err:?}");
    assert_eq!(service.stats().unwrap().tasks.total, 2);
    assert_eq!(std::fs::read_dir(dir.path().join("uploads")).unwrap().count(), 2);

    // Both accepted tasks still finish.
    for id in [running, queued] {
        assert_eq!(
            wait_terminal(&service, id).await.pop().unwrap().status,
            TaskStatus::Completed
        );
    }
    assert!(service.submit_task(image, "d.png").await.is_ok());
}

// ── Cleanup ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn cleanup_removes_record_and_artifacts() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap();
    let other = service
        .submit_task(Bytes::from(png_bytes(8, 8, 1)), "b.png")
        .await
        .unwrap();
    wait_terminal(&service, id).await;
    wait_terminal(&service, other).await;
    assert_eq!(files_with_prefix(dir.path(), id).len(), 2);

    let report = service.cleanup(id).await.unwrap();
    assert_eq!(report.removed_files, 2);
    assert!(files_with_prefix(dir.path(), id).is_empty());

    assert_eq!(service.get_status(id).unwrap_err().kind(), ErrorKind::TaskNotFound);
    assert_eq!(
        service.get_result(id).await.unwrap_err().kind(),
        ErrorKind::TaskNotFound
    );
    assert_eq!(service.cleanup(id).await.unwrap_err().kind(), ErrorKind::TaskNotFound);

    // The neighbour is untouched.
    assert_eq!(files_with_prefix(dir.path(), other).len(), 2);
    assert!(service.get_result(other).await.is_ok());
}

#[tokio::test]
async fn missing_output_file_is_reported_as_artifact_missing() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |_| {}).await;

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap();
    wait_terminal(&service, id).await;
    std::fs::remove_file(dir.path().join("outputs").join(format!("{id}_upscaled_a.png"))).unwrap();

    assert_eq!(
        service.get_result(id).await.unwrap_err().kind(),
        ErrorKind::ArtifactMissing
    );
}

#[tokio::test]
async fn cleanup_of_a_running_task_cancels_it() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::from_millis(300)), |c| c.max_workers = 1).await;

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap();
    wait_status(&service, id, TaskStatus::Processing).await;

    service.cleanup(id).await.unwrap();
    assert_eq!(service.get_status(id).unwrap_err().kind(), ErrorKind::TaskNotFound);

    // Give the transform time to finish; nothing may be written afterwards.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(files_with_prefix(dir.path(), id).is_empty());
    assert_eq!(service.stats().unwrap().active_jobs, 0);
}

#[tokio::test]
async fn cleanup_of_a_queued_task_skips_its_job() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::from_millis(200)), |c| c.max_workers = 1).await;
    let image = Bytes::from(png_bytes(8, 8, 0));

    let first = service.submit_task(image.clone(), "a.png").await.unwrap();
    wait_status(&service, first, TaskStatus::Processing).await;
    let second = service.submit_task(image, "b.png").await.unwrap();
    service.cleanup(second).await.unwrap();

    wait_terminal(&service, first).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(files_with_prefix(dir.path(), second).is_empty());
    assert_eq!(service.stats().unwrap().tasks.total, 1);
}

// ── Reclamation ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn reaper_evicts_expired_tasks() {
    let dir = TempDir::new().unwrap();
    let service = start(&dir, nearest_loader(Duration::ZERO), |c| {
        c.task_ttl = Some(Duration::ZERO);
        c.reap_interval = Duration::from_millis(20);
    })
    .await;
    assert!(service.stats().unwrap().reaper_enabled);

    let id = service
        .submit_task(Bytes::from(png_bytes(8, 8, 0)), "a.png")
        .await
        .unwrap();

    for _ in 0..500 {
        if service.get_status(id).is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(service.get_status(id).unwrap_err().kind(), ErrorKind::TaskNotFound);
    assert!(files_with_prefix(dir.path(), id).is_empty());
}

#[test]
fn reap_once_sweeps_orphans_but_keeps_live_tasks() {
    let dir = TempDir::new().unwrap();
    let store = FileStore::open(dir.path()).unwrap();
    let registry = TaskRegistry::new();

    let live = registry.create().unwrap();
    store
        .save(live, crate::runtime::store::ArtifactKind::Input, "live.png", b"x")
        .unwrap();
    let orphan = TaskId::new_v4();
    store
        .save(orphan, crate::runtime::store::ArtifactKind::Output, "gone.png", b"y")
        .unwrap();
    std::fs::write(store.uploads_dir().join("not-a-task.png"), b"z").unwrap();

    let report = reap_once(&registry, &store, Duration::from_secs(3600)).unwrap();
    assert_eq!(
        report,
        ReapReport {
            evicted_tasks: 0,
            removed_files: 1
        }
    );
    assert!(files_with_prefix(dir.path(), live).len() == 1);
    assert!(files_with_prefix(dir.path(), orphan).is_empty());
    assert!(store.uploads_dir().join("not-a-task.png").is_file());
}
