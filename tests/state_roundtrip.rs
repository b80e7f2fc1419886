mod common;

use common::test_config;
use rob_batch::state::{AssessmentState, BatchState, DocumentState, DocumentStatus};
use rob_batch::state_manager::{StateError, StateManager};
use std::path::Path;

fn sample_state(root: &Path, session_id: &str) -> AssessmentState {
    let cfg = test_config(root);
    let work_dir = root.join("work");
    let output_dir = root.join("out");
    std::fs::create_dir_all(&work_dir).unwrap();
    std::fs::create_dir_all(&output_dir).unwrap();

    let mut state = AssessmentState::new(
        session_id.to_string(),
        cfg,
        work_dir,
        output_dir.clone(),
    );

    for b in 0..2 {
        let id = format!("{session_id}_batch_{b:03}");
        let docs: Vec<DocumentState> = (0..3)
            .map(|i| DocumentState::new(root.join(format!("docs/doc_{b}_{i}.pdf"))))
            .collect();
        state
            .batches
            .push(BatchState::new(id.clone(), docs, output_dir.join(&id)));
    }
    state.update_counters();
    state
}

#[test]
fn save_then_load_roundtrips() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    let mut state = sample_state(tmp.path(), "sess-rt");
    state.batches[0].documents[0].status = DocumentStatus::Completed;
    state.batches[0].documents[0].result_file = Some(tmp.path().join("r.json"));
    state.cost_tracking.insert("input_tokens_usd".into(), 1.25);
    state.update_counters();

    manager.save_state(&mut state).unwrap();
    let loaded = manager.load_state("sess-rt", true).unwrap();

    assert_eq!(loaded.session_id, state.session_id);
    assert_eq!(loaded.created_at, state.created_at);
    assert_eq!(loaded.status, state.status);
    assert_eq!(loaded.batches.len(), 2);
    assert_eq!(
        loaded.batches[0].documents[0].status,
        DocumentStatus::Completed
    );
    assert_eq!(loaded.total_documents, 6);
    assert_eq!(loaded.completed_documents, 1);
    assert_eq!(loaded.cost_tracking.get("input_tokens_usd"), Some(&1.25));
    assert_eq!(loaded.config.llm_models.assessor_model, "test-model");
}

#[test]
fn load_missing_session_is_not_found() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    match manager.load_state("nope", true) {
        Err(StateError::NotFound(id)) => assert_eq!(id, "nope"),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn corruption_is_never_silently_accepted() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    let mut state = sample_state(tmp.path(), "sess-corrupt");
    manager.save_state(&mut state).unwrap();

    // Flip one byte in the middle of the saved file.
    let path = manager.state_path("sess-corrupt");
    let mut bytes = std::fs::read(&path).unwrap();
    let mid = bytes.len() / 2;
    bytes[mid] = bytes[mid].wrapping_add(1);
    std::fs::write(&path, &bytes).unwrap();

    match manager.load_state("sess-corrupt", true) {
        Err(StateError::Corrupted { .. }) => {}
        Ok(_) => panic!("corrupted state must not load as valid"),
        other => panic!("expected Corrupted, got {other:?}"),
    }
}

#[test]
fn corruption_recovers_from_backup_when_present() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    let mut state = sample_state(tmp.path(), "sess-recover");
    manager.save_state(&mut state).unwrap();
    // Second save backs up the first file.
    state.batches[0].documents[0].status = DocumentStatus::Completed;
    state.batches[0].documents[0].result_file = Some(tmp.path().join("r.json"));
    state.update_counters();
    manager.save_state(&mut state).unwrap();

    let path = manager.state_path("sess-recover");
    std::fs::write(&path, b"{ not json at all").unwrap();

    let recovered = manager.load_state("sess-recover", true).unwrap();
    assert_eq!(recovered.session_id, "sess-recover");
    // After recovery the re-saved file must load cleanly again.
    let again = manager.load_state("sess-recover", true).unwrap();
    assert_eq!(again.session_id, "sess-recover");
}

#[test]
fn counters_always_match_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let mut state = sample_state(tmp.path(), "sess-counters");
    state.batches[0].documents[0].status = DocumentStatus::Completed;
    state.batches[0].documents[1].status = DocumentStatus::Skipped;
    state.batches[1].documents[2].status = DocumentStatus::Failed;
    state.update_counters();

    let total: usize = state.batches.iter().map(|b| b.documents.len()).sum();
    let completed: usize = state
        .batches
        .iter()
        .map(|b| b.completed_documents().len())
        .sum();
    assert_eq!(state.total_documents, total);
    assert_eq!(state.completed_documents, completed);
    assert_eq!(state.completed_documents, 2);
    assert_eq!(state.failed_documents, 1);
}

#[test]
fn progress_hits_100_only_when_all_documents_resolve_clean() {
    let tmp = tempfile::tempdir().unwrap();
    let mut state = sample_state(tmp.path(), "sess-progress");
    let batch = &mut state.batches[0];

    batch.update_progress();
    assert_eq!(batch.progress, 0);

    batch.documents[0].status = DocumentStatus::Completed;
    batch.update_progress();
    assert_eq!(batch.progress, 33);
    assert!(!batch.is_complete());

    batch.documents[1].status = DocumentStatus::Skipped;
    batch.documents[2].status = DocumentStatus::Failed;
    batch.update_progress();
    assert_eq!(batch.progress, 67);
    assert!(!batch.is_complete());

    batch.documents[2].status = DocumentStatus::Completed;
    batch.update_progress();
    assert_eq!(batch.progress, 100);
    assert!(batch.is_complete());
}

#[test]
fn validate_state_accumulates_issues() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    let mut state = sample_state(tmp.path(), "sess-validate");

    // A completed document with no result file, plus a wrong counter.
    state.batches[0].documents[0].status = DocumentStatus::Completed;
    state.total_documents = 99;

    let issues = manager.validate_state(&state);
    assert!(issues.iter().any(|i| i.contains("no result file")));
    assert!(issues.iter().any(|i| i.contains("total_documents mismatch")));

    // Clean state validates.
    state.batches[0].documents[0].status = DocumentStatus::Pending;
    state.update_counters();
    assert!(manager.validate_state(&state).is_empty());
}

#[test]
fn validate_state_flags_empty_batches_and_missing_dirs() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    let mut state = sample_state(tmp.path(), "sess-empty");
    state.batches.clear();
    state.update_counters();
    state.work_dir = tmp.path().join("gone");

    let issues = manager.validate_state(&state);
    assert!(issues.iter().any(|i| i.contains("no batches")));
    assert!(issues.iter().any(|i| i.contains("work dir missing")));
}

#[test]
fn listing_reports_corrupted_files_without_failing() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();

    let mut a = sample_state(tmp.path(), "sess-a");
    manager.save_state(&mut a).unwrap();
    let mut b = sample_state(tmp.path(), "sess-b");
    manager.save_state(&mut b).unwrap();

    std::fs::write(manager.state_path("sess-b"), b"garbage").unwrap();

    let rows = manager.list_sessions().unwrap();
    assert_eq!(rows.len(), 2);
    let corrupt = rows.iter().find(|r| r.session_id == "sess-b").unwrap();
    assert_eq!(corrupt.status, "corrupted");
    let ok = rows.iter().find(|r| r.session_id == "sess-a").unwrap();
    assert_eq!(ok.total_documents, 6);
}

#[test]
fn delete_and_cleanup() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = StateManager::new(&tmp.path().join("state")).unwrap();
    let mut state = sample_state(tmp.path(), "sess-del");
    manager.save_state(&mut state).unwrap();

    manager.delete_state("sess-del", true).unwrap();
    assert!(matches!(
        manager.load_state("sess-del", true),
        Err(StateError::NotFound(_))
    ));

    // Nothing recent enough to remove.
    let mut keep = sample_state(tmp.path(), "sess-keep");
    manager.save_state(&mut keep).unwrap();
    assert_eq!(manager.cleanup_old_states(30, true).unwrap(), 0);
    assert!(manager.load_state("sess-keep", true).is_ok());
}
