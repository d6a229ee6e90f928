#![forbid(unsafe_code)]

//! # snsb-harness
//!
//! Evaluates LLMs as neuropsychologists: given a subject's SNSB-C (Seoul
//! Neuropsychological Screening Battery, Core) results, the model writes a
//! clinical rationale and picks a diagnosis. Outputs are scored against ground
//! truth (classification metrics) or against a baseline run by an LLM judge.
//!
//! Each stage persists one JSONL record per subject and resumes from the first
//! missing record, so an interrupted run can simply be restarted.

pub mod config;
pub mod dataset;
pub mod evaluate;
pub mod fetch;
pub mod gateway;
pub mod guideline;
pub mod payload;
pub mod prompts;
pub mod runner;
pub mod store;

pub use config::{Baseline, ConfigError, ReportLanguage, RunConfig, RunPaths, Strategy};
pub use dataset::{DiagnosticGroup, SnsbIndex, SourceTestSplit, SubjectRecord};
pub use evaluate::{ClassificationSummary, EvalMode, EvaluationReport, RubricSummary};
pub use fetch::{extract_diagnosis, Response};
pub use gateway::{Attribution, BackendKind, ChatGateway, ProviderGateway, UsageSink};
pub use payload::{Payload, PayloadStrategy};
pub use runner::{run, RunData, RunError, RunOutcome};
pub use store::{resume_batch, BatchStatus, JsonlStore, Slot};
