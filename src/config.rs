use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: Global,
    #[serde(default)]
    pub paths: Paths,
    #[serde(default)]
    pub parallel: Parallel,
    #[serde(default)]
    pub processing: Processing,
    #[serde(default)]
    pub llm_models: LlmModels,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub debug: Debug,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// One validation pass over the whole schema. Sections deserialized to
    /// their zero defaults count as missing, so a config file that omits a
    /// required table is reported here rather than failing at parse time.
    pub fn section_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.paths.input_folder.is_empty() {
            issues.push("paths section is missing or incomplete: input_folder is empty".into());
        }
        if self.processing.worker_script.is_empty() {
            issues
                .push("processing section is missing or incomplete: worker_script is empty".into());
        }
        if self.llm_models.assessor_model.is_empty() {
            issues
                .push("llm_models section is missing or incomplete: assessor_model is empty".into());
        }
        if self.parallel.parallel_workers == 0 {
            issues.push("parallel.parallel_workers must be at least 1".into());
        }
        if self.parallel.max_documents_per_batch == 0 {
            issues.push("parallel.max_documents_per_batch must be at least 1".into());
        }
        issues
    }

    pub fn validate(&self) -> Result<()> {
        let issues = self.section_issues();
        if issues.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("invalid configuration: {}", issues.join("; "))
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global: Default::default(),
            paths: Default::default(),
            parallel: Default::default(),
            processing: Default::default(),
            llm_models: Default::default(),
            logging: Default::default(),
            debug: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Global {
    pub print_summary: bool,
    pub poll_interval_seconds: u64,
}
impl Default for Global {
    fn default() -> Self {
        Self {
            print_summary: true,
            poll_interval_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub input_folder: String,
    pub output_folder: String,
    pub work_dir: String,
    pub state_dir: String,
}
impl Default for Paths {
    fn default() -> Self {
        Self {
            input_folder: "".into(),
            output_folder: "out".into(),
            work_dir: ".rob-batch-work".into(),
            state_dir: ".rob-batch-state".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Parallel {
    pub parallel_workers: usize,
    pub max_documents_per_batch: usize,
    pub stop_grace_seconds: u64,
}
impl Default for Parallel {
    fn default() -> Self {
        Self {
            parallel_workers: 4,
            max_documents_per_batch: 10,
            stop_grace_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Processing {
    pub python_exe: String,
    pub worker_script: String,
    pub supported_extensions: Vec<String>,
    pub document_timeout_seconds: u64,
    pub max_retries: u32,
    pub checksum_documents: bool,
}
impl Default for Processing {
    fn default() -> Self {
        Self {
            python_exe: "python3".into(),
            worker_script: "".into(),
            supported_extensions: vec!["pdf".into(), "docx".into(), "doc".into()],
            document_timeout_seconds: 600,
            max_retries: 2,
            checksum_documents: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmModels {
    pub assessor_model: String,
    pub fallback_model: String,
    pub temperature: f32,
    pub api_key_env: String,
}
impl Default for LlmModels {
    fn default() -> Self {
        Self {
            assessor_model: "".into(),
            fallback_model: "".into(),
            temperature: 0.0,
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: true,
            file_path: "".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Debug {
    pub dump_effective_config: bool,
    pub keep_worker_logs: bool,
}
impl Default for Debug {
    fn default() -> Self {
        Self {
            dump_effective_config: true,
            keep_worker_logs: true,
        }
    }
}
