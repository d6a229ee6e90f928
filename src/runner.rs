//! End-to-end run: split, payloads, responses, evaluation.
//!
//! Every stage is cached under the run's [`RunPaths`], so rerunning the same
//! configuration after an interruption only does the remaining work.

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::{ConfigError, RunConfig, RunPaths, Strategy};
use crate::dataset::{
    check_consistency, load_subjects, split_source_test, ConsistencyReport, DatasetError,
    SnsbIndex, SourceTestSplit, SubjectRecord,
};
use crate::evaluate::{
    evaluate_classification, judge_all, load_terminal, pair_responses, persist,
    ClassificationSummary, EvalError, EvalMode, EvaluationReport, JudgmentRecord, LlmJudge,
    RubricSummary,
};
use crate::fetch::{FetchError, Response, ResponseFetcher};
use crate::gateway::ChatGateway;
use crate::guideline::{GuidelineError, GuidelineOrigin, GuidelineSynthesizer};
use crate::payload::{Payload, PayloadBuilder, PayloadError, PayloadStrategy};
use crate::prompts::DiagnosisPrompts;
use crate::store::{BatchOutcome, BatchStatus, JsonlStore, Slot, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Payload(#[from] PayloadError),
    #[error("guideline synthesis failed: {0}")]
    Guideline(#[from] GuidelineError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("failed to read prompts: {0}")]
    Prompts(#[source] std::io::Error),
}

/// Inputs shared by every stage of one run.
#[derive(Debug, Clone)]
pub struct RunData {
    pub paths: RunPaths,
    pub subjects: Vec<SubjectRecord>,
    pub docs: SnsbIndex,
    pub split: SourceTestSplit,
}

impl RunData {
    /// Load subjects and documents and draw the source/test split.
    pub fn load(config: &RunConfig) -> Result<Self, RunError> {
        config.validate()?;
        let paths = config.paths();
        let subjects = load_subjects(&paths.info)?;
        let docs = SnsbIndex::build(&paths.scores_dir, &paths.reports_dir)?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let split = split_source_test(&subjects, config.source_ratio, &mut rng)?;
        Ok(Self {
            paths,
            subjects,
            docs,
            split,
        })
    }

    pub fn source_subjects(&self) -> Vec<SubjectRecord> {
        self.split
            .source_ids
            .iter()
            .filter_map(|id| self.subjects.iter().find(|s| &s.subject_id == id))
            .cloned()
            .collect()
    }

    pub fn consistency(&self) -> Result<ConsistencyReport, RunError> {
        Ok(check_consistency(&self.subjects, &self.docs)?)
    }
}

/// How each cached stage went, plus the final evaluation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub prefix: String,
    pub payloads: StageReport,
    pub responses: StageReport,
    pub report: EvaluationReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    pub status: BatchStatus,
    pub cached: usize,
    pub produced: usize,
    pub failed: usize,
}

impl<T> From<&BatchOutcome<T>> for StageReport {
    fn from(o: &BatchOutcome<T>) -> Self {
        Self {
            status: o.status,
            cached: o.cached,
            produced: o.produced,
            failed: o.failed,
        }
    }
}

/// Load the cached guideline for `config.model` or synthesize it from the
/// source subjects.
pub async fn load_guideline<G: ChatGateway + ?Sized>(
    config: &RunConfig,
    data: &RunData,
    gateway: &G,
) -> Result<(String, GuidelineOrigin), RunError> {
    let synthesizer = GuidelineSynthesizer::new(gateway, config.model.clone())
        .temperature(config.guideline_temperature)
        .context_window(config.context_window);
    Ok(synthesizer
        .load_or_synthesize(&data.paths.guideline, &data.source_subjects(), &data.docs)
        .await?)
}

pub async fn run<G: ChatGateway + ?Sized>(config: &RunConfig, gateway: &G) -> Result<RunOutcome, RunError> {
    let data = RunData::load(config)?;
    run_with_data(config, &data, gateway).await
}

pub async fn run_with_data<G: ChatGateway + ?Sized>(
    config: &RunConfig,
    data: &RunData,
    gateway: &G,
) -> Result<RunOutcome, RunError> {
    let prefix = config.prefix();
    tracing::info!(
        prefix = %prefix,
        backend = config.backend.as_str(),
        subjects = data.subjects.len(),
        source = data.split.source_ids.len(),
        "starting run"
    );

    let prompts = DiagnosisPrompts::load(&data.paths.prompts_dir).map_err(RunError::Prompts)?;

    let strategy = match config.strategy {
        Strategy::ZeroShot => PayloadStrategy::ZeroShot,
        Strategy::FewShot => PayloadStrategy::few_shot(
            config.num_examples,
            &data.split.source_ids,
            &data.subjects,
            config.seed,
        )?,
        Strategy::Custom => {
            let (guideline, _) = load_guideline(config, data, gateway).await?;
            PayloadStrategy::Custom { guideline }
        }
    };

    let payload_store: JsonlStore<Payload> = JsonlStore::new(&data.paths.payloads);
    let payloads = PayloadBuilder {
        strategy: &strategy,
        prompts: &prompts,
        docs: &data.docs,
        test_ids: &data.split.test_ids,
        temperature: config.temperature,
    }
    .build_all(&data.subjects, &payload_store)
    .await?;

    let subject_ids: Vec<String> = data.subjects.iter().map(|s| s.subject_id.clone()).collect();
    let response_store: JsonlStore<Response> = JsonlStore::new(&data.paths.responses);
    let responses = ResponseFetcher::new(gateway, config.model.clone())
        .context_window(config.context_window)
        .fetch_all(&subject_ids, &payloads.records, &response_store)
        .await?;

    let report = match config.eval_mode {
        EvalMode::Classification => EvaluationReport::Classification(classify(
            data,
            &subject_ids,
            &payloads.records,
            &responses.records,
        )?),
        EvalMode::Rubric => {
            let judgments = judge(config, data, gateway, &prompts, &subject_ids, &responses.records).await?;
            EvaluationReport::Rubric {
                summary: RubricSummary::from_records(&judgments),
                judgments,
            }
        }
    };

    Ok(RunOutcome {
        prefix,
        payloads: StageReport::from(&payloads),
        responses: StageReport::from(&responses),
        report,
    })
}

fn classify(
    data: &RunData,
    subject_ids: &[String],
    payloads: &[Slot<Payload>],
    responses: &[Slot<Response>],
) -> Result<ClassificationSummary, RunError> {
    let store: JsonlStore<ClassificationSummary> = JsonlStore::new(&data.paths.eval_results);
    if let Some(summary) = load_terminal(&store)?.and_then(|v| v.into_iter().next()) {
        return Ok(summary);
    }
    let summary = evaluate_classification(subject_ids, payloads, responses)?;
    persist(&store, std::slice::from_ref(&summary))?;
    Ok(summary)
}

async fn judge<G: ChatGateway + ?Sized>(
    config: &RunConfig,
    data: &RunData,
    gateway: &G,
    prompts: &DiagnosisPrompts,
    subject_ids: &[String],
    responses: &[Slot<Response>],
) -> Result<Vec<JudgmentRecord>, RunError> {
    let store: JsonlStore<JudgmentRecord> = JsonlStore::new(&data.paths.eval_results);
    if let Some(records) = load_terminal(&store)? {
        return Ok(records);
    }

    let baseline_store: JsonlStore<Response> = JsonlStore::new(&data.paths.baseline_responses);
    if !baseline_store.exists() {
        return Err(EvalError::MissingBaseline(data.paths.baseline_responses.clone()).into());
    }
    if baseline_store.path() == data.paths.responses {
        tracing::warn!("baseline and candidate are the same run");
    }
    let baseline = baseline_store.load()?;

    let items = pair_responses(subject_ids, &data.docs, prompts, responses, &baseline)?;
    let judge = LlmJudge::new(gateway, config.judge_model());
    let records = judge_all(&judge, &items).await;
    persist(&store, &records)?;
    Ok(records)
}
