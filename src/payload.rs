//! Request payloads: one chat request per subject, built by a closed set of
//! context strategies and persisted through [`resume_batch`].

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::dataset::{split_report, DatasetError, DiagnosticGroup, SnsbIndex, SubjectRecord};
use crate::gateway::Message;
use crate::prompts::{enumerate_examples, subject_context, worked_example, DiagnosisPrompts};
use crate::store::{fingerprint, resume_batch, BatchOutcome, BatchProducer, JsonlStore, Keyed, StoreError};

/// One persisted request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub subject_id: String,
    pub ground_truth: u8,
    /// 1 when the subject belongs to the evaluated set.
    pub test: u8,
    pub messages: Vec<Message>,
    pub temperature: f32,
}

impl Keyed for Payload {
    fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("report for subject '{0}' has fewer than two paragraphs")]
    MalformedReport(String),
    #[error("few-shot requires 1 or an even number of examples, got {0}")]
    InvalidShotCount(usize),
    #[error("source set is empty")]
    EmptySource,
}

// =============================================================================
// Strategies
// =============================================================================

/// How the user message context is assembled.
#[derive(Debug, Clone)]
pub enum PayloadStrategy {
    ZeroShot,
    FewShot {
        shots: usize,
        /// Source subjects examples are drawn from.
        source: Vec<SubjectRecord>,
        seed: u64,
    },
    Custom {
        guideline: String,
    },
}

impl PayloadStrategy {
    /// Few-shot strategy over `source_ids`. Validates the shot count and that
    /// every group can supply its share.
    pub fn few_shot(
        shots: usize,
        source_ids: &[String],
        subjects: &[SubjectRecord],
        seed: u64,
    ) -> Result<Self, PayloadError> {
        if shots == 0 || (shots > 1 && shots % 2 != 0) {
            return Err(PayloadError::InvalidShotCount(shots));
        }
        let source = source_ids
            .iter()
            .map(|id| {
                subjects
                    .iter()
                    .find(|s| &s.subject_id == id)
                    .cloned()
                    .ok_or_else(|| DatasetError::UnknownSubject(id.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if source.is_empty() {
            return Err(PayloadError::EmptySource);
        }
        if shots > 1 {
            for group in DiagnosticGroup::ALL {
                let available = source.iter().filter(|s| s.group == group).count();
                if available < shots / 2 {
                    return Err(DatasetError::InsufficientPopulation {
                        group,
                        requested: shots / 2,
                        available,
                    }
                    .into());
                }
            }
        }

        Ok(PayloadStrategy::FewShot {
            shots,
            source,
            seed,
        })
    }

    pub fn name(&self) -> String {
        match self {
            PayloadStrategy::ZeroShot => "zeroshot".to_string(),
            PayloadStrategy::FewShot { shots, .. } => format!("fewshot{shots}"),
            PayloadStrategy::Custom { .. } => "custom".to_string(),
        }
    }

    /// User-message context for the subject at `position`.
    pub fn build_context(
        &self,
        position: usize,
        subject: &SubjectRecord,
        docs: &SnsbIndex,
    ) -> Result<String, PayloadError> {
        let own = subject_context(subject, &docs.score(&subject.subject_id)?);
        match self {
            PayloadStrategy::ZeroShot => Ok(own),
            PayloadStrategy::FewShot {
                shots,
                source,
                seed,
            } => {
                let mut rng = subject_rng(*seed, position);
                let examples = select_examples(*shots, source, &mut rng)
                    .into_iter()
                    .map(|s| render_example(s, docs))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!(
                    "### Examples\n{}\n\n{own}",
                    enumerate_examples(&examples)
                ))
            }
            PayloadStrategy::Custom { guideline } => Ok(format!("{guideline}\n\n{own}")),
        }
    }
}

/// Per-subject RNG: the examples for position `i` do not depend on how many
/// subjects were built earlier in this process, so a resumed run rebuilds the
/// same prompts as an uninterrupted one.
fn subject_rng(seed: u64, position: usize) -> StdRng {
    StdRng::seed_from_u64(seed ^ (position as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// `shots == 1`: one subject uniformly from the whole source set.
/// `shots > 1`: `shots / 2` from each group, group 0 first, then shuffled.
pub fn select_examples<'a>(
    shots: usize,
    source: &'a [SubjectRecord],
    rng: &mut StdRng,
) -> Vec<&'a SubjectRecord> {
    if shots == 1 {
        return source.choose(rng).into_iter().collect();
    }

    let mut picked: Vec<&SubjectRecord> = Vec::with_capacity(shots);
    for group in DiagnosticGroup::ALL {
        let members: Vec<&SubjectRecord> = source.iter().filter(|s| s.group == group).collect();
        picked.extend(members.choose_multiple(rng, shots / 2).copied());
    }
    picked.shuffle(rng);
    picked
}

fn render_example(subject: &SubjectRecord, docs: &SnsbIndex) -> Result<String, PayloadError> {
    let score = docs.score(&subject.subject_id)?;
    let report = docs.report(&subject.subject_id)?;
    let sections = split_report(&report)
        .ok_or_else(|| PayloadError::MalformedReport(subject.subject_id.clone()))?;
    Ok(worked_example(&score, sections.rationale, sections.diagnosis))
}

// =============================================================================
// Builder
// =============================================================================

/// Builds and persists payloads for every subject.
pub struct PayloadBuilder<'a> {
    pub strategy: &'a PayloadStrategy,
    pub prompts: &'a DiagnosisPrompts,
    pub docs: &'a SnsbIndex,
    pub test_ids: &'a [String],
    pub temperature: f32,
}

impl PayloadBuilder<'_> {
    pub async fn build_all(
        &mut self,
        subjects: &[SubjectRecord],
        store: &JsonlStore<Payload>,
    ) -> Result<BatchOutcome<Payload>, StoreError> {
        let strategy_name = self.strategy.name();
        let temperature = self.temperature.to_string();
        let fp = fingerprint(
            [strategy_name.as_str(), temperature.as_str()]
                .into_iter()
                .chain(subjects.iter().map(|s| s.subject_id.as_str())),
        );
        if !store.check_fingerprint(&fp)? {
            tracing::warn!(
                path = %store.path().display(),
                "payload cache was written for a different subject order or strategy"
            );
        }
        resume_batch(store, subjects, self).await
    }
}

#[async_trait]
impl<'a> BatchProducer<SubjectRecord, Payload> for PayloadBuilder<'a> {
    type Error = PayloadError;

    fn stage(&self) -> &'static str {
        "payloads"
    }

    fn describe(&self, item: &SubjectRecord) -> String {
        item.subject_id.clone()
    }

    async fn produce(&mut self, position: usize, subject: &SubjectRecord) -> Result<Payload, PayloadError> {
        let context = self.strategy.build_context(position, subject, self.docs)?;
        Ok(Payload {
            subject_id: subject.subject_id.clone(),
            ground_truth: subject.group.label(),
            test: u8::from(self.test_ids.contains(&subject.subject_id)),
            messages: self.prompts.messages(&context),
            temperature: self.temperature,
        })
    }
}
