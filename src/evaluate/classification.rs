//! Binary classification metrics over extracted diagnoses.

use serde::{Deserialize, Serialize};

use super::EvalError;
use crate::fetch::Response;
use crate::payload::Payload;
use crate::prompts::IMPAIRED_OPTION_MARKER;
use crate::store::{lookup, Lookup, Slot};

/// 1 when the diagnosis names the impaired option, else 0.
pub fn predict(diagnosis: &str) -> u8 {
    u8::from(diagnosis.contains(IMPAIRED_OPTION_MARKER))
}

/// Confusion matrix with group 1 as the positive class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfusionMatrix {
    pub tp: usize,
    pub fp: usize,
    pub tn: usize,
    #[serde(rename = "fn")]
    pub fn_: usize,
}

impl ConfusionMatrix {
    pub fn from_labels(y_true: &[u8], y_pred: &[u8]) -> Self {
        let mut m = Self::default();
        for (&t, &p) in y_true.iter().zip(y_pred) {
            m.record(t, p);
        }
        m
    }

    pub fn record(&mut self, truth: u8, pred: u8) {
        match (truth != 0, pred != 0) {
            (true, true) => self.tp += 1,
            (false, true) => self.fp += 1,
            (false, false) => self.tn += 1,
            (true, false) => self.fn_ += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.tp + self.fp + self.tn + self.fn_
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.tp + self.tn, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.tp, self.tp + self.fp)
    }

    /// Recall of the positive class.
    pub fn sensitivity(&self) -> f64 {
        ratio(self.tp, self.tp + self.fn_)
    }

    pub fn specificity(&self) -> f64 {
        ratio(self.tn, self.tn + self.fp)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.sensitivity());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

pub(crate) fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

/// The persisted classification result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationSummary {
    pub total_samples: usize,
    pub accuracy: f64,
    pub precision: f64,
    pub sensitivity: f64,
    pub specificity: f64,
    pub f1_score: f64,
}

impl From<&ConfusionMatrix> for ClassificationSummary {
    fn from(m: &ConfusionMatrix) -> Self {
        Self {
            total_samples: m.total(),
            accuracy: round4(m.accuracy()),
            precision: round4(m.precision()),
            sensitivity: round4(m.sensitivity()),
            specificity: round4(m.specificity()),
            f1_score: round4(m.f1()),
        }
    }
}

/// Score every test subject. Sentinel positions are excluded with a warning;
/// a subject missing from either store is fatal.
pub fn evaluate_classification(
    subject_ids: &[String],
    payloads: &[Slot<Payload>],
    responses: &[Slot<Response>],
) -> Result<ClassificationSummary, EvalError> {
    let mut matrix = ConfusionMatrix::default();
    let mut excluded = Vec::new();

    for (position, id) in subject_ids.iter().enumerate() {
        let payload = match lookup(payloads, position, id) {
            Lookup::Found(p) => p,
            Lookup::Sentinel => {
                excluded.push(id.as_str());
                continue;
            }
            Lookup::Missing => return Err(EvalError::missing("payloads", id)),
        };
        if payload.test == 0 {
            continue;
        }
        let response = match lookup(responses, position, id) {
            Lookup::Found(r) => r,
            Lookup::Sentinel => {
                excluded.push(id.as_str());
                continue;
            }
            Lookup::Missing => return Err(EvalError::missing("responses", id)),
        };
        matrix.record(payload.ground_truth, predict(&response.diagnosis));
    }

    if !excluded.is_empty() {
        tracing::warn!(
            excluded = excluded.len(),
            subjects = ?excluded,
            "excluded subjects with failed payloads or responses"
        );
    }
    tracing::debug!(?matrix, "confusion matrix");

    Ok(ClassificationSummary::from(&matrix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_example() {
        let m = ConfusionMatrix::from_labels(&[0, 0, 1, 1], &[0, 1, 1, 1]);
        let s = ClassificationSummary::from(&m);
        assert_eq!(s.total_samples, 4);
        assert_eq!(s.accuracy, 0.75);
        assert_eq!(s.precision, 0.6667);
        assert_eq!(s.sensitivity, 1.0);
        assert_eq!(s.specificity, 0.5);
        assert_eq!(s.f1_score, 0.8);
    }

    #[test]
    fn zero_denominators_yield_zero() {
        let m = ConfusionMatrix::from_labels(&[0, 0], &[0, 0]);
        let s = ClassificationSummary::from(&m);
        assert_eq!(s.accuracy, 1.0);
        assert_eq!(s.precision, 0.0);
        assert_eq!(s.sensitivity, 0.0);
        assert_eq!(s.f1_score, 0.0);

        let empty = ClassificationSummary::from(&ConfusionMatrix::default());
        assert_eq!(empty.total_samples, 0);
        assert_eq!(empty.accuracy, 0.0);
        assert_eq!(empty.specificity, 0.0);
    }

    #[test]
    fn prediction_follows_option_marker() {
        assert_eq!(predict("(B) Mild cognitive impairment"), 1);
        assert_eq!(predict("(A) Normal cognition"), 0);
        assert_eq!(predict("unclear"), 0);
    }

    #[test]
    fn summary_has_exactly_six_fields() {
        let s = ClassificationSummary::from(&ConfusionMatrix::default());
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v.as_object().unwrap().len(), 6);
    }

    fn payload(id: &str, truth: u8) -> Slot<Payload> {
        Slot::Filled(Payload {
            subject_id: id.into(),
            ground_truth: truth,
            test: 1,
            messages: vec![],
            temperature: 0.1,
        })
    }

    fn response(id: &str, diagnosis: &str) -> Slot<Response> {
        Slot::Filled(Response {
            subject_id: id.into(),
            diagnosis: diagnosis.into(),
            generated_response: String::new(),
        })
    }

    #[test]
    fn sentinels_are_excluded_and_missing_is_fatal() {
        let ids: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let payloads = vec![payload("a", 1), payload("b", 0), payload("c", 0)];
        let responses = vec![response("a", "(B)"), Slot::Sentinel, response("c", "(A)")];
        let s = evaluate_classification(&ids, &payloads, &responses).unwrap();
        assert_eq!(s.total_samples, 2);
        assert_eq!(s.accuracy, 1.0);

        let short = vec![response("a", "(B)")];
        assert!(matches!(
            evaluate_classification(&ids, &payloads, &short),
            Err(EvalError::MissingRecord { .. })
        ));
    }
}
