//! Response fetching: send each payload to the backend, pull the diagnosis out
//! of the reply, and persist one response per subject.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};
use crate::payload::Payload;
use crate::prompts::DIAGNOSIS_MARKER;
use crate::store::{
    fingerprint, lookup, resume_batch, BatchOutcome, BatchProducer, JsonlStore, Keyed, Lookup,
    Slot, StoreError,
};

/// One persisted model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub subject_id: String,
    /// Text after the diagnosis marker.
    pub diagnosis: String,
    pub generated_response: String,
}

impl Keyed for Response {
    fn subject_id(&self) -> &str {
        &self.subject_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    #[error("response has no '### Diagnosis' section")]
    MissingMarker,
}

/// Text following the first diagnosis marker, trimmed.
pub fn extract_diagnosis(text: &str) -> Result<&str, ExtractError> {
    text.split_once(DIAGNOSIS_MARKER)
        .map(|(_, rest)| rest.trim())
        .ok_or(ExtractError::MissingMarker)
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("payload for '{0}' is a sentinel")]
    SentinelPayload(String),
    #[error("no payload for subject '{0}'")]
    MissingPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-position fetch input.
#[derive(Debug, Clone)]
pub struct FetchItem {
    pub subject_id: String,
    pub payload: Option<Payload>,
}

/// Align payload records with the canonical subject order. A subject with
/// neither a payload nor a sentinel at its position is fatal.
pub fn align_payloads(
    subject_ids: &[String],
    payloads: &[Slot<Payload>],
) -> Result<Vec<FetchItem>, FetchError> {
    subject_ids
        .iter()
        .enumerate()
        .map(|(position, id)| match lookup(payloads, position, id) {
            Lookup::Found(p) => Ok(FetchItem {
                subject_id: id.clone(),
                payload: Some(p.clone()),
            }),
            Lookup::Sentinel => Ok(FetchItem {
                subject_id: id.clone(),
                payload: None,
            }),
            Lookup::Missing => Err(FetchError::MissingPayload(id.clone())),
        })
        .collect()
}

pub struct ResponseFetcher<'a, G: ChatGateway + ?Sized> {
    gateway: &'a G,
    model: String,
    context_window: Option<u32>,
}

impl<'a, G: ChatGateway + ?Sized> ResponseFetcher<'a, G> {
    pub fn new(gateway: &'a G, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
            context_window: None,
        }
    }

    pub fn context_window(mut self, num_ctx: u32) -> Self {
        self.context_window = Some(num_ctx);
        self
    }

    pub async fn fetch_all(
        &mut self,
        subject_ids: &[String],
        payloads: &[Slot<Payload>],
        store: &JsonlStore<Response>,
    ) -> Result<BatchOutcome<Response>, FetchError> {
        let items = align_payloads(subject_ids, payloads)?;

        let fp = fingerprint(
            std::iter::once(self.model.as_str()).chain(subject_ids.iter().map(String::as_str)),
        );
        if !store.check_fingerprint(&fp)? {
            tracing::warn!(
                path = %store.path().display(),
                "response cache was written for a different model or subject order"
            );
        }

        Ok(resume_batch(store, &items, self).await?)
    }
}

#[async_trait]
impl<'a, G: ChatGateway + ?Sized> BatchProducer<FetchItem, Response> for ResponseFetcher<'a, G> {
    type Error = FetchError;

    fn stage(&self) -> &'static str {
        "responses"
    }

    fn describe(&self, item: &FetchItem) -> String {
        item.subject_id.clone()
    }

    async fn produce(&mut self, _position: usize, item: &FetchItem) -> Result<Response, FetchError> {
        let payload = item
            .payload
            .as_ref()
            .ok_or_else(|| FetchError::SentinelPayload(item.subject_id.clone()))?;

        let mut req = ChatRequest::new(
            self.model.clone(),
            payload.messages.clone(),
            Attribution::new("fetch").with_subject(&payload.subject_id),
        )
        .temperature(payload.temperature);
        if let Some(num_ctx) = self.context_window {
            req = req.context_window(num_ctx);
        }

        let resp = self.gateway.chat(req).await?;
        let diagnosis = extract_diagnosis(&resp.content)?.to_string();
        tracing::debug!(
            subject = %payload.subject_id,
            output_tokens = resp.output_tokens,
            latency_ms = resp.latency.as_millis() as u64,
            "response received"
        );

        Ok(Response {
            subject_id: payload.subject_id.clone(),
            diagnosis,
            generated_response: resp.content,
        })
    }
}
