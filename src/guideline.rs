//! Three-stage guideline synthesis for the custom strategy.
//!
//! 1. role play: the model explains each source subject's report as if it had
//!    written it;
//! 2. drafting: each explanation becomes a draft interpretation guideline;
//! 3. consolidation: the drafts are merged into one guideline.
//!
//! The result is cached per model. Any failed call aborts the synthesis and
//! leaves no cache behind.

use std::path::{Path, PathBuf};

use crate::dataset::{DatasetError, SnsbIndex, SubjectRecord};
use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};
use crate::prompts::{DRAFT_GUIDELINE_PROMPT, ROLE_PLAY_PROMPT, UNIFIED_GUIDELINE_PROMPT};

pub const DEFAULT_GUIDELINE_TEMPERATURE: f32 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum GuidelineError {
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("{stage} call failed for '{subject}': {source}")]
    Provider {
        stage: &'static str,
        subject: String,
        #[source]
        source: ProviderError,
    },
    #[error("no source subjects to synthesize a guideline from")]
    EmptySource,
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Where a guideline came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuidelineOrigin {
    Cached,
    Synthesized,
}

pub struct GuidelineSynthesizer<'a, G: ChatGateway + ?Sized> {
    gateway: &'a G,
    model: String,
    temperature: f32,
    context_window: Option<u32>,
}

impl<'a, G: ChatGateway + ?Sized> GuidelineSynthesizer<'a, G> {
    pub fn new(gateway: &'a G, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            temperature: DEFAULT_GUIDELINE_TEMPERATURE,
            context_window: None,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn context_window(mut self, num_ctx: u32) -> Self {
        self.context_window = Some(num_ctx);
        self
    }

    /// Return the cached guideline at `cache`, or synthesize and cache it.
    pub async fn load_or_synthesize(
        &self,
        cache: &Path,
        source: &[SubjectRecord],
        docs: &SnsbIndex,
    ) -> Result<(String, GuidelineOrigin), GuidelineError> {
        match std::fs::read_to_string(cache) {
            Ok(text) => {
                tracing::info!(path = %cache.display(), "using cached guideline");
                return Ok((text, GuidelineOrigin::Cached));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(GuidelineError::Io {
                    path: cache.to_path_buf(),
                    source,
                })
            }
        }

        let guideline = self.synthesize(source, docs).await?;

        let io_err = |source: std::io::Error| GuidelineError::Io {
            path: cache.to_path_buf(),
            source,
        };
        if let Some(parent) = cache.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        // Renamed into place so an interrupted write never leaves a partial cache.
        let tmp = cache.with_extension("txt.tmp");
        std::fs::write(&tmp, &guideline).map_err(io_err)?;
        std::fs::rename(&tmp, cache).map_err(io_err)?;
        tracing::info!(path = %cache.display(), chars = guideline.len(), "guideline cached");

        Ok((guideline, GuidelineOrigin::Synthesized))
    }

    /// Run all three stages without touching the cache.
    pub async fn synthesize(
        &self,
        source: &[SubjectRecord],
        docs: &SnsbIndex,
    ) -> Result<String, GuidelineError> {
        if source.is_empty() {
            return Err(GuidelineError::EmptySource);
        }

        // Documents are resolved up front so a missing file fails before any call.
        let documents = source
            .iter()
            .map(|s| -> Result<_, DatasetError> {
                Ok((s.subject_id.as_str(), docs.score(&s.subject_id)?, docs.report(&s.subject_id)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut answers = Vec::with_capacity(documents.len());
        for (i, (subject, score, report)) in documents.iter().enumerate() {
            let prompt =
                ROLE_PLAY_PROMPT.render(&[("snsb_score", score.as_str()), ("snsb_report", report.as_str())]);
            answers.push(self.call("role_play", subject, prompt.to_messages()).await?);
            tracing::info!(stage = "role_play", done = i + 1, total = documents.len(), subject, "progress");
        }

        let mut drafts = Vec::with_capacity(answers.len());
        for (i, ((subject, _, _), answer)) in documents.iter().zip(&answers).enumerate() {
            let prompt = DRAFT_GUIDELINE_PROMPT.render(&[("answer", answer.as_str())]);
            drafts.push(self.call("draft", subject, prompt.to_messages()).await?);
            tracing::info!(stage = "draft", done = i + 1, total = documents.len(), subject, "progress");
        }

        let joined = drafts.join("\n\n");
        let prompt = UNIFIED_GUIDELINE_PROMPT.render(&[("draft_guidelines", joined.as_str())]);
        let guideline = self.call("unify", "*", prompt.to_messages()).await?;
        tracing::info!(stage = "unify", drafts = drafts.len(), "guideline synthesized");

        Ok(guideline)
    }

    async fn call(
        &self,
        stage: &'static str,
        subject: &str,
        messages: Vec<crate::gateway::Message>,
    ) -> Result<String, GuidelineError> {
        let mut req = ChatRequest::new(
            self.model.clone(),
            messages,
            Attribution::new("guideline").with_subject(subject),
        )
        .temperature(self.temperature);
        if let Some(num_ctx) = self.context_window {
            req = req.context_window(num_ctx);
        }
        self.gateway
            .chat(req)
            .await
            .map(|resp| resp.content)
            .map_err(|source| GuidelineError::Provider {
                stage,
                subject: subject.to_string(),
                source,
            })
    }
}
