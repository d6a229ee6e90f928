//! Response evaluation: classification metrics or pairwise rubric judging.
//!
//! Evaluation results are terminal. A non-empty result file is loaded and
//! returned as-is; otherwise the result is computed and written atomically.

pub mod classification;
pub mod rubric;

use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dataset::DatasetError;
use crate::store::{JsonlStore, Slot, StoreError};

pub use classification::{evaluate_classification, predict, ClassificationSummary, ConfusionMatrix};
pub use rubric::{
    judge_all, pair_responses, parse_judgment, CriterionSummary, JudgeError, JudgeItem, Judgment,
    JudgmentRecord, LlmJudge, RubricCriterion, RubricJudge, RubricSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("subject '{subject_id}' has no record in {stage}")]
    MissingRecord {
        stage: &'static str,
        subject_id: String,
    },
    #[error("baseline responses not found at {0}; run the baseline configuration first")]
    MissingBaseline(PathBuf),
    #[error("{0} exists but holds no usable evaluation record")]
    EmptyResult(PathBuf),
}

impl EvalError {
    pub(crate) fn missing(stage: &'static str, subject_id: &str) -> Self {
        EvalError::MissingRecord {
            stage,
            subject_id: subject_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    Classification,
    Rubric,
}

impl EvalMode {
    /// File-name suffix of the result store.
    pub fn suffix(&self) -> &'static str {
        match self {
            EvalMode::Classification => "clf",
            EvalMode::Rubric => "rubric",
        }
    }
}

/// Final result of a run, printed to stdout.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EvaluationReport {
    Classification(ClassificationSummary),
    Rubric {
        summary: RubricSummary,
        judgments: Vec<JudgmentRecord>,
    },
}

/// Previously persisted results, if the file exists and is non-empty.
pub fn load_terminal<T>(store: &JsonlStore<T>) -> Result<Option<Vec<T>>, EvalError>
where
    T: Serialize + DeserializeOwned,
{
    let slots = store.load()?;
    if slots.is_empty() {
        return Ok(None);
    }
    tracing::info!(path = %store.path().display(), records = slots.len(), "evaluation already done");
    let records: Vec<T> = slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Filled(r) => Some(r),
            Slot::Sentinel => None,
        })
        .collect();
    if records.is_empty() {
        return Err(EvalError::EmptyResult(store.path().to_path_buf()));
    }
    Ok(Some(records))
}

pub fn persist<T>(store: &JsonlStore<T>, records: &[T]) -> Result<(), EvalError>
where
    T: Serialize + DeserializeOwned + Clone,
{
    let slots: Vec<Slot<T>> = records.iter().cloned().map(Slot::Filled).collect();
    store.write_all(&slots)?;
    tracing::info!(path = %store.path().display(), records = slots.len(), "evaluation saved");
    Ok(())
}
