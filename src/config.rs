//! Run configuration and the file layout derived from it.

use std::path::{Path, PathBuf};

use crate::dataset::DEFAULT_SEED;
use crate::evaluate::EvalMode;
use crate::gateway::BackendKind;
use crate::guideline::DEFAULT_GUIDELINE_TEMPERATURE;

pub const DEFAULT_MODEL: &str = "llama3.3:70b";
pub const DEFAULT_TEMPERATURE: f32 = 0.1;
pub const DEFAULT_SOURCE_RATIO: f64 = 0.1;
pub const DEFAULT_CONTEXT_WINDOW: u32 = 8192;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("few-shot requires --num-examples of 1 or an even number, got {0}")]
    InvalidShotCount(usize),
    #[error("source ratio must be within [0, 1], got {0}")]
    InvalidRatio(f64),
    #[error("temperature must be within [0, 2], got {0}")]
    InvalidTemperature(f32),
    #[error("context window must be positive")]
    InvalidContextWindow,
    #[error("model name is empty")]
    EmptyModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    ZeroShot,
    FewShot,
    Custom,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::ZeroShot => "zeroshot",
            Strategy::FewShot => "fewshot",
            Strategy::Custom => "custom",
        }
    }
}

/// Earlier run that rubric evaluation compares against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    ZeroShot,
    FewShot1,
    FewShot2,
}

impl Baseline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Baseline::ZeroShot => "zeroshot",
            Baseline::FewShot1 => "fewshot1",
            Baseline::FewShot2 => "fewshot2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportLanguage {
    Eng,
    Kor,
}

impl ReportLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportLanguage::Eng => "eng",
            ReportLanguage::Kor => "kor",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Directory holding `data/`, `prompts/` and `results/`.
    pub root: PathBuf,
    pub strategy: Strategy,
    /// Shot count; only read by the few-shot strategy.
    pub num_examples: usize,
    pub source_ratio: f64,
    pub backend: BackendKind,
    pub model: String,
    pub temperature: f32,
    pub context_window: u32,
    pub eval_mode: EvalMode,
    pub baseline: Baseline,
    pub seed: u64,
    pub report_language: ReportLanguage,
    /// Falls back to `model`.
    pub judge_model: Option<String>,
    pub guideline_temperature: f32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            strategy: Strategy::ZeroShot,
            num_examples: 0,
            source_ratio: DEFAULT_SOURCE_RATIO,
            backend: BackendKind::Ollama,
            model: DEFAULT_MODEL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            context_window: DEFAULT_CONTEXT_WINDOW,
            eval_mode: EvalMode::Classification,
            baseline: Baseline::ZeroShot,
            seed: DEFAULT_SEED,
            report_language: ReportLanguage::Eng,
            judge_model: None,
            guideline_temperature: DEFAULT_GUIDELINE_TEMPERATURE,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.strategy == Strategy::FewShot {
            let k = self.num_examples;
            if k == 0 || (k > 1 && k % 2 != 0) {
                return Err(ConfigError::InvalidShotCount(k));
            }
        }
        if !(0.0..=1.0).contains(&self.source_ratio) {
            return Err(ConfigError::InvalidRatio(self.source_ratio));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature(self.temperature));
        }
        if self.context_window == 0 {
            return Err(ConfigError::InvalidContextWindow);
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel);
        }
        Ok(())
    }

    pub fn judge_model(&self) -> &str {
        self.judge_model.as_deref().unwrap_or(&self.model)
    }

    /// `fewshot{k}-{model}` or `{strategy}-{model}`, file-name safe.
    pub fn prefix(&self) -> String {
        let strategy = match self.strategy {
            Strategy::FewShot => format!("fewshot{}", self.num_examples),
            other => other.as_str().to_string(),
        };
        format!("{strategy}-{}", file_safe(&self.model))
    }

    pub fn paths(&self) -> RunPaths {
        RunPaths::new(self)
    }
}

/// Model names may contain `/` (e.g. `org/model`).
pub fn file_safe(model: &str) -> String {
    model.replace('/', "_")
}

/// Every file a run reads or writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPaths {
    pub info: PathBuf,
    pub scores_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub payloads: PathBuf,
    pub responses: PathBuf,
    pub eval_results: PathBuf,
    pub baseline_responses: PathBuf,
    pub guideline: PathBuf,
}

impl RunPaths {
    fn new(config: &RunConfig) -> Self {
        let root: &Path = &config.root;
        let processed = root.join("data/processed");
        let results = root.join("results");
        let prefix = config.prefix();
        let model = file_safe(&config.model);

        // Zero-shot and few-shot payloads do not depend on the model.
        let payload_name = match config.strategy {
            Strategy::Custom => prefix.clone(),
            _ => prefix
                .split_once('-')
                .map(|(head, _)| head.to_string())
                .unwrap_or_else(|| prefix.clone()),
        };

        Self {
            info: processed.join("info.jsonl"),
            scores_dir: processed.join("SNSB/scores"),
            reports_dir: processed
                .join("SNSB/reports")
                .join(config.report_language.as_str()),
            prompts_dir: root.join("prompts"),
            payloads: root.join("data/payloads").join(format!("{payload_name}.jsonl")),
            responses: results.join(format!("{prefix}.output.jsonl")),
            eval_results: results.join(format!(
                "{prefix}.eval_results-{}.jsonl",
                config.eval_mode.suffix()
            )),
            baseline_responses: results.join(format!(
                "{}-{model}.output.jsonl",
                config.baseline.as_str()
            )),
            guideline: results.join("guidelines").join(format!("{model}.txt")),
        }
    }
}
