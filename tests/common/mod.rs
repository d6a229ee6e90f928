#![allow(dead_code)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use snsb_harness::gateway::{ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError};

/// Write a cohort under `root` in the on-disk layout a run expects.
/// Subjects alternate N000, I000, N001, I001, ...; ids starting with `I` are impaired.
pub fn write_cohort(root: &Path, per_group: usize) -> Vec<String> {
    let processed = root.join("data/processed");
    let scores = processed.join("SNSB/scores");
    let reports = processed.join("SNSB/reports/eng");
    std::fs::create_dir_all(&scores).unwrap();
    std::fs::create_dir_all(&reports).unwrap();

    let mut ids = Vec::new();
    let mut info = String::new();
    for i in 0..per_group {
        for (prefix, group) in [("N", 0u8), ("I", 1u8)] {
            let id = format!("{prefix}{i:03}");
            let line = json!({
                "subject_id": id,
                "name": "redacted",
                "age": 65 + i,
                "gender": if i % 2 == 0 { "F" } else { "M" },
                "education_years": 6 + i,
                "group": group,
            });
            info.push_str(&line.to_string());
            info.push('\n');

            std::fs::write(
                scores.join(format!("{id}.md")),
                format!("| Test | z-score |\n|---|---|\n| SVLT delayed recall | {} |", if group == 1 { "-2.1" } else { "0.3" }),
            )
            .unwrap();
            let verdict = if group == 1 {
                "(B) Mild cognitive impairment"
            } else {
                "(A) Normal cognition"
            };
            std::fs::write(
                reports.join(format!("{id}.md")),
                format!("Rationale for {id}: memory scores reviewed.\n\n{verdict}\n\nSigned."),
            )
            .unwrap();
            ids.push(id);
        }
    }
    std::fs::write(processed.join("info.jsonl"), info).unwrap();
    ids
}

/// Deterministic stand-in for an LLM backend.
///
/// - `fetch` calls answer `(B)` for ids starting with `I`, else `(A)`;
/// - `guideline` calls echo their stage;
/// - `judge` calls prefer response A, except for `unmarked_subjects`, whose
///   verdicts carry no `[RESULT]` tag.
#[derive(Default)]
pub struct ScriptedGateway {
    pub calls: Mutex<Vec<ChatRequest>>,
    /// Subjects whose calls fail with a provider error.
    pub fail_subjects: Vec<String>,
    /// Subjects whose diagnosis replies lack the diagnosis marker and whose
    /// judge replies lack a verdict.
    pub unmarked_subjects: Vec<String>,
}

impl ScriptedGateway {
    pub fn calls_by(&self, caller: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.attribution.caller == caller)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.lock().unwrap().push(req.clone());
        let subject = req.attribution.subject_id.clone().unwrap_or_default();
        if self.fail_subjects.contains(&subject) {
            return Err(ProviderError::provider("scripted", "backend unavailable", false));
        }

        let content = match req.attribution.caller {
            "guideline" => format!("Step for {subject}: compare z-scores against -1.5."),
            "judge" if self.unmarked_subjects.contains(&subject) => {
                "Feedback: Both responses read the scores the same way.".to_string()
            }
            "judge" => "Feedback: Response A ties the rationale to the scores. [RESULT] A".to_string(),
            _ if self.unmarked_subjects.contains(&subject) => {
                "I am not able to give a diagnosis.".to_string()
            }
            _ => {
                let verdict = if subject.starts_with('I') {
                    "(B) Mild cognitive impairment"
                } else {
                    "(A) Normal cognition"
                };
                format!("### Clinical Rationale\nScores reviewed for {subject}.\n\n### Diagnosis\n{verdict}")
            }
        };

        Ok(ChatResponse {
            content,
            input_tokens: 10,
            output_tokens: 5,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

pub fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}
