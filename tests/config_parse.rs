use rob_batch::config::Config;

#[test]
fn parse_example_config() {
    let raw = include_str!("../rob-batch.example.toml");
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    assert!(cfg.parallel.parallel_workers >= 1);
    assert!(!cfg.paths.output_folder.is_empty());
    assert!(cfg.section_issues().is_empty(), "example config must validate");
}

#[test]
fn missing_llm_models_section_is_reported() {
    let raw = r#"
[paths]
input_folder = "docs"

[processing]
worker_script = "scripts/rob_worker.py"
"#;
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    let issues = cfg.section_issues();
    assert!(
        issues.iter().any(|i| i.contains("llm_models")),
        "expected an issue naming llm_models, got {issues:?}"
    );
}

#[test]
fn empty_config_reports_all_required_sections() {
    let cfg: Config = toml::from_str("").expect("parse TOML");
    let issues = cfg.section_issues();
    assert!(issues.iter().any(|i| i.contains("paths")));
    assert!(issues.iter().any(|i| i.contains("processing")));
    assert!(issues.iter().any(|i| i.contains("llm_models")));
}

#[test]
fn zero_workers_is_rejected() {
    let raw = r#"
[parallel]
parallel_workers = 0
"#;
    let cfg: Config = toml::from_str(raw).expect("parse TOML");
    assert!(cfg
        .section_issues()
        .iter()
        .any(|i| i.contains("parallel_workers")));
}
