//! Pairwise rubric grading: a judge model compares each candidate rationale
//! with the baseline run's rationale for the same subject.

use std::fmt;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::classification::round4;
use super::EvalError;
use crate::dataset::SnsbIndex;
use crate::fetch::Response;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};
use crate::prompts::{DiagnosisPrompts, RELATIVE_GRADE_PROMPT};
use crate::store::{lookup, Lookup, Slot};

static RESULT_TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"\[RESULT\]\s*[("']*\s*([AB])\b"#).expect("Invalid result tag regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RubricCriterion {
    Consistency,
    Correctness,
    Specificity,
    Helpfulness,
    Humanlikeness,
}

impl RubricCriterion {
    pub const ALL: [RubricCriterion; 5] = [
        RubricCriterion::Consistency,
        RubricCriterion::Correctness,
        RubricCriterion::Specificity,
        RubricCriterion::Helpfulness,
        RubricCriterion::Humanlikeness,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RubricCriterion::Consistency => "consistency",
            RubricCriterion::Correctness => "correctness",
            RubricCriterion::Specificity => "specificity",
            RubricCriterion::Helpfulness => "helpfulness",
            RubricCriterion::Humanlikeness => "humanlikeness",
        }
    }

    pub fn rubric(&self) -> &'static str {
        match self {
            RubricCriterion::Consistency => {
                "How much is a generated rationale not contradictory to the presented data and model prediction (or the ground-truth diagnosis)?"
            }
            RubricCriterion::Correctness => {
                "How medically correct is the knowledge referred to in the rationale?"
            }
            RubricCriterion::Specificity => {
                "How detailed and specific are the insights provided in the generated rationale?"
            }
            RubricCriterion::Helpfulness => {
                "How much does a clinical rationale benefit the prediction towards the correct diagnosis?"
            }
            RubricCriterion::Humanlikeness => {
                "How well does a clinical rationale demonstrate the insight and understanding of the presented patient description or diagnosis in a way that matches the human behaviors?"
            }
        }
    }
}

impl fmt::Display for RubricCriterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pair to grade. Response A is the candidate, response B the baseline.
#[derive(Debug, Clone)]
pub struct JudgeItem {
    pub subject_id: String,
    pub instruction: String,
    pub candidate: String,
    pub baseline: String,
    pub reference: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Judgment {
    pub feedback: String,
    /// 1 when the candidate is preferred, 0 for the baseline.
    pub score: u8,
}

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("judge output has no [RESULT] verdict")]
    Unparseable,
}

/// Parse `Feedback: ... [RESULT] A|B`. The last verdict wins.
pub fn parse_judgment(text: &str) -> Result<Judgment, JudgeError> {
    let caps = RESULT_TAG
        .captures_iter(text)
        .last()
        .ok_or(JudgeError::Unparseable)?;
    let (Some(whole), Some(verdict)) = (caps.get(0), caps.get(1)) else {
        return Err(JudgeError::Unparseable);
    };
    let feedback = text[..whole.start()].trim();
    let feedback = feedback
        .strip_prefix("###Feedback:")
        .or_else(|| feedback.strip_prefix("Feedback:"))
        .unwrap_or(feedback)
        .trim();
    Ok(Judgment {
        feedback: feedback.to_string(),
        score: u8::from(verdict.as_str() == "A"),
    })
}

#[async_trait]
pub trait RubricJudge: Send + Sync {
    /// One result per item, in item order.
    async fn relative_grade(&self, items: &[JudgeItem], rubric: &str) -> Vec<Result<Judgment, JudgeError>>;
}

/// Judge backed by a chat model.
pub struct LlmJudge<'a, G: ChatGateway + ?Sized> {
    gateway: &'a G,
    model: String,
    temperature: f32,
}

impl<'a, G: ChatGateway + ?Sized> LlmJudge<'a, G> {
    pub fn new(gateway: &'a G, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: 0.0,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    async fn grade_one(&self, item: &JudgeItem, rubric: &str) -> Result<Judgment, JudgeError> {
        let prompt = RELATIVE_GRADE_PROMPT.render(&[
            ("instruction", item.instruction.as_str()),
            ("response_a", item.candidate.as_str()),
            ("response_b", item.baseline.as_str()),
            ("reference_answer", item.reference.as_str()),
            ("rubric", rubric),
        ]);
        let req = ChatRequest::new(
            self.model.clone(),
            prompt.to_messages(),
            Attribution::new("judge").with_subject(&item.subject_id),
        )
        .temperature(self.temperature);
        let resp = self.gateway.chat(req).await?;
        parse_judgment(&resp.content)
    }
}

#[async_trait]
impl<'a, G: ChatGateway + ?Sized> RubricJudge for LlmJudge<'a, G> {
    async fn relative_grade(&self, items: &[JudgeItem], rubric: &str) -> Vec<Result<Judgment, JudgeError>> {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(self.grade_one(item, rubric).await);
        }
        out
    }
}

/// One persisted judgment. `score` is null when the judge failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRecord {
    pub subject_id: String,
    pub criteria: RubricCriterion,
    pub feedback: String,
    pub score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CriterionSummary {
    pub criteria: RubricCriterion,
    pub judged: usize,
    pub failed: usize,
    pub candidate_wins: usize,
    /// Share of successful judgments preferring the candidate.
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RubricSummary {
    pub criteria: Vec<CriterionSummary>,
}

impl RubricSummary {
    pub fn from_records(records: &[JudgmentRecord]) -> Self {
        let criteria = RubricCriterion::ALL
            .iter()
            .filter_map(|&criteria| {
                let scores: Vec<Option<u8>> = records
                    .iter()
                    .filter(|r| r.criteria == criteria)
                    .map(|r| r.score)
                    .collect();
                if scores.is_empty() {
                    return None;
                }
                let judged = scores.iter().flatten().count();
                let candidate_wins = scores.iter().flatten().filter(|&&s| s == 1).count();
                let win_rate = if judged == 0 {
                    0.0
                } else {
                    round4(candidate_wins as f64 / judged as f64)
                };
                Some(CriterionSummary {
                    criteria,
                    judged,
                    failed: scores.len() - judged,
                    candidate_wins,
                    win_rate,
                })
            })
            .collect();
        Self { criteria }
    }
}

/// Build judge items for every subject with both a candidate and a baseline
/// response. Sentinels on either side are skipped; absence is fatal.
pub fn pair_responses(
    subject_ids: &[String],
    docs: &SnsbIndex,
    prompts: &DiagnosisPrompts,
    candidates: &[Slot<Response>],
    baseline: &[Slot<Response>],
) -> Result<Vec<JudgeItem>, EvalError> {
    let mut items = Vec::with_capacity(subject_ids.len());
    let mut skipped = 0usize;

    for (position, id) in subject_ids.iter().enumerate() {
        let candidate = match lookup(candidates, position, id) {
            Lookup::Found(r) => Some(r),
            Lookup::Sentinel => None,
            Lookup::Missing => return Err(EvalError::missing("responses", id)),
        };
        let base = match lookup(baseline, position, id) {
            Lookup::Found(r) => Some(r),
            Lookup::Sentinel => None,
            Lookup::Missing => return Err(EvalError::missing("baseline responses", id)),
        };
        let (Some(candidate), Some(base)) = (candidate, base) else {
            skipped += 1;
            continue;
        };

        let score = docs.score(id)?;
        items.push(JudgeItem {
            subject_id: id.clone(),
            instruction: format!("{}\n\n{}", prompts.system, score),
            candidate: candidate.generated_response.clone(),
            baseline: base.generated_response.clone(),
            reference: docs.report(id)?,
        });
    }

    if skipped > 0 {
        tracing::warn!(skipped, "skipped subjects with a failed candidate or baseline response");
    }
    Ok(items)
}

/// Grade every item under every criterion, criterion by criterion.
pub async fn judge_all<J: RubricJudge + ?Sized>(
    judge: &J,
    items: &[JudgeItem],
) -> Vec<JudgmentRecord> {
    let mut records = Vec::with_capacity(items.len() * RubricCriterion::ALL.len());
    for criterion in RubricCriterion::ALL {
        let results = judge.relative_grade(items, criterion.rubric()).await;
        let mut failed = 0usize;
        for (item, result) in items.iter().zip(results) {
            let record = match result {
                Ok(j) => JudgmentRecord {
                    subject_id: item.subject_id.clone(),
                    criteria: criterion,
                    feedback: j.feedback,
                    score: Some(j.score),
                },
                Err(err) => {
                    failed += 1;
                    tracing::warn!(criteria = %criterion, subject = %item.subject_id, "judgment failed: {err}");
                    JudgmentRecord {
                        subject_id: item.subject_id.clone(),
                        criteria: criterion,
                        feedback: String::new(),
                        score: None,
                    }
                }
            };
            records.push(record);
        }
        tracing::info!(criteria = %criterion, items = items.len(), failed, "criterion graded");
    }
    records
}
