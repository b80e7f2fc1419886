mod common;

use common::{make_documents, test_config, MockSpawner};
use rob_batch::capacity;
use rob_batch::manager::AssessmentManager;

#[test]
fn batch_size_balances_workers_under_cap() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    let manager = AssessmentManager::new(&cfg, MockSpawner::new()).unwrap();

    // ceil(23 / 4) = 6, below the cap of 10.
    assert_eq!(manager.optimal_batch_size(23, 4), 6);
    // cap binds: ceil(100 / 2) = 50 -> 10.
    assert_eq!(manager.optimal_batch_size(100, 2), 10);
    // floor at 1.
    assert_eq!(manager.optimal_batch_size(0, 4), 1);
    assert_eq!(manager.optimal_batch_size(3, 0), 3);
}

#[test]
fn twenty_three_documents_make_four_batches() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    let docs = make_documents(tmp.path(), 23);
    let manager = AssessmentManager::new(&cfg, MockSpawner::new()).unwrap();

    let batches = manager.distribute_documents("sess", &docs);
    let sizes: Vec<usize> = batches.iter().map(|b| b.documents.len()).collect();
    assert_eq!(sizes, vec![6, 6, 6, 5]);
    assert_eq!(batches[0].id, "sess_batch_000");
    assert_eq!(batches[3].id, "sess_batch_003");
}

#[test]
fn distribution_is_deterministic() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    let docs = make_documents(tmp.path(), 17);
    let manager = AssessmentManager::new(&cfg, MockSpawner::new()).unwrap();

    let a = manager.distribute_documents("sess", &docs);
    let b = manager.distribute_documents("sess", &docs);
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(&b) {
        assert_eq!(x.id, y.id);
        let xp: Vec<_> = x.documents.iter().map(|d| &d.path).collect();
        let yp: Vec<_> = y.documents.iter().map(|d| &d.path).collect();
        assert_eq!(xp, yp);
    }
}

#[test]
fn discovery_sorts_and_filters() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    let docs_dir = tmp.path().join("docs");
    std::fs::create_dir_all(docs_dir.join("nested")).unwrap();
    std::fs::write(docs_dir.join("b.pdf"), "b").unwrap();
    std::fs::write(docs_dir.join("a.docx"), "a").unwrap();
    std::fs::write(docs_dir.join("notes.txt"), "ignored").unwrap();
    std::fs::write(docs_dir.join("nested").join("c.PDF"), "c").unwrap();

    let manager = AssessmentManager::new(&cfg, MockSpawner::new()).unwrap();
    let found = manager.discover_documents().unwrap();

    assert_eq!(found.len(), 3);
    assert!(found.windows(2).all(|w| w[0] < w[1]), "must be sorted");
    assert!(found.iter().all(|p| {
        let ext = p.extension().unwrap().to_str().unwrap().to_lowercase();
        ext == "pdf" || ext == "docx"
    }));
}

#[test]
fn discovery_fails_on_missing_or_empty_folder() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    let manager = AssessmentManager::new(&cfg, MockSpawner::new()).unwrap();

    let err = manager.discover_documents().unwrap_err();
    assert!(err.to_string().contains("not found"));

    std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
    std::fs::write(tmp.path().join("docs").join("readme.md"), "x").unwrap();
    let err = manager.discover_documents().unwrap_err();
    assert!(err.to_string().contains("no documents"));
}

#[test]
fn validation_failure_blocks_start() {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.llm_models.assessor_model = String::new();
    make_documents(tmp.path(), 5);

    let spawner = MockSpawner::new();
    let mut manager = AssessmentManager::new(&cfg, spawner.clone()).unwrap();

    let docs = manager.discover_documents().unwrap();
    let report = manager.validate_batch_distribution(&docs);
    assert!(!report.is_valid());
    assert!(report.issues.iter().any(|i| i.contains("llm_models")));

    let err = manager.start_assessment().unwrap_err();
    assert!(err.to_string().contains("llm_models"));
    assert_eq!(spawner.spawn_count(), 0, "no worker may launch");
}

#[test]
fn missing_document_is_a_validation_issue() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    let mut docs = make_documents(tmp.path(), 2);
    docs.push(tmp.path().join("docs").join("ghost.pdf"));

    let manager = AssessmentManager::new(&cfg, MockSpawner::new()).unwrap();
    let report = manager.validate_batch_distribution(&docs);
    assert!(!report.is_valid());
    assert!(report.issues.iter().any(|i| i.contains("ghost.pdf")));
}

#[test]
fn capacity_detection_stays_within_bounds() {
    let tmp = tempfile::tempdir().unwrap();
    let detected = capacity::detect(2, tmp.path());
    assert!(detected.cpu_count >= 1);
    assert!(detected.recommended_workers >= 1);
    assert!(detected.recommended_workers <= 2);

    // Far more workers than any machine has cores: warn, never abort.
    let warnings = capacity::resource_warnings(10_000, 3, tmp.path());
    assert!(warnings.iter().any(|w| w.contains("exceeds available CPUs")));
    assert!(warnings.iter().any(|w| w.contains("workers will be idle")));
}

#[test]
fn start_launches_one_worker_per_batch() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = test_config(tmp.path());
    make_documents(tmp.path(), 23);

    let spawner = MockSpawner::new();
    let mut manager = AssessmentManager::new(&cfg, spawner.clone()).unwrap();
    let state = manager.start_assessment().unwrap();

    assert_eq!(state.batches.len(), 4);
    assert_eq!(spawner.spawn_count(), 4);
    assert_eq!(state.total_documents, 23);
    for batch in &state.batches {
        assert!(batch.worker_pid.is_some());
        assert!(batch.config_file.as_ref().unwrap().exists());
    }
}
