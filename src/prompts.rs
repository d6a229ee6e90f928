//! Prompt templates for diagnosis, guideline synthesis, and rubric judging.
//!
//! Templates use `{name}` placeholders filled by [`PromptTemplate::render`].

use std::path::Path;

use crate::dataset::SubjectRecord;
use crate::gateway::Message;

// =============================================================================
// Templates
// =============================================================================

/// Rendered prompt ready for LLM.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// A system/user prompt pair with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    pub fn render(&self, vars: &[(&str, &str)]) -> PromptInstance {
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: fill(self.system, vars),
            user: fill(self.user, vars),
        }
    }
}

/// Single-pass placeholder substitution: values are never re-scanned, so text
/// inside a filled value that looks like `{name}` is left alone.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let hit = after.find('}').and_then(|close| {
            let key = &after[..close];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (close, *v))
        });
        match hit {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// =============================================================================
// Diagnosis prompts
// =============================================================================

/// Section header the model must put in front of its final answer.
pub const DIAGNOSIS_MARKER: &str = "### Diagnosis";

/// Substring of the impaired-outcome option.
pub const IMPAIRED_OPTION_MARKER: &str = "(B)";

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a professional neuropsychologist. You are given a subject's demographic information and SNSB-C (Seoul Neuropsychological Screening Battery - Core) test results. Interpret the results and decide which of the following best describes the subject's cognitive level:
- (A) Normal cognition or Subjective cognitive decline
- (B) Mild cognitive impairment, Early stage of dementia, or Alzheimer's disease

Answer in exactly this format:
### Clinical Rationale
<your interpretation of the test results>

### Diagnosis
<(A) or (B) followed by the option text>"#;

pub const DEFAULT_USER_TEMPLATE: &str = "{context}";

/// Loaded system prompt and user template for a run.
#[derive(Debug, Clone)]
pub struct DiagnosisPrompts {
    pub system: String,
    pub user_template: String,
}

impl Default for DiagnosisPrompts {
    fn default() -> Self {
        Self {
            system: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
        }
    }
}

impl DiagnosisPrompts {
    /// Read `system.txt` and `user.txt` from `dir`; each missing file falls back
    /// to the built-in default.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let read = |name: &str, default: &str| -> std::io::Result<String> {
            let path = dir.join(name);
            match std::fs::read_to_string(&path) {
                Ok(text) => Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %path.display(), "prompt file not found, using built-in");
                    Ok(default.to_string())
                }
                Err(e) => Err(e),
            }
        };
        Ok(Self {
            system: read("system.txt", DEFAULT_SYSTEM_PROMPT)?,
            user_template: read("user.txt", DEFAULT_USER_TEMPLATE)?,
        })
    }

    pub fn messages(&self, context: &str) -> Vec<Message> {
        vec![
            Message::system(&self.system),
            Message::user(fill(&self.user_template, &[("context", context)])),
        ]
    }
}

/// Demographics followed by the subject's own score sheet.
pub fn subject_context(subject: &SubjectRecord, score: &str) -> String {
    format!(
        "### Subject information\n\
         Age: {}\n\
         Gender: {}\n\
         Education years: {}\n\n\
         ### SNSB-C Result\n{}",
        subject.age, subject.gender, subject.education_years, score
    )
}

/// One worked example: score sheet, rationale paragraph, diagnosis paragraph.
pub fn worked_example(score: &str, rationale: &str, diagnosis: &str) -> String {
    format!(
        "### SNSB-C Result\n{score}\n\n\
         ### Clinical Rationale\n{rationale}\n\n\
         ### Diagnosis\n{diagnosis}"
    )
}

/// Number examples from 1, each followed by a blank line.
pub fn enumerate_examples(examples: &[String]) -> String {
    examples
        .iter()
        .enumerate()
        .map(|(i, ex)| format!("Example {}.\n{}\n\n", i + 1, ex))
        .collect()
}

// =============================================================================
// Guideline synthesis prompts
// =============================================================================

pub const ROLE_PLAY_PROMPT: PromptTemplate = PromptTemplate {
    slug: "guideline_role_play_v1",
    system: "You are a professional neuropsychologist who has made the given diagnosis. Answer the user's question.",
    user: "### Subject's Neuropsychological Test Results\n\
{snsb_score}\n\n\
### Your Rationale and Diagnosis\n\
{snsb_report}\n\n\
## Question\n\
How did you interpret the test results? What were the decisive factors for the diagnosis?",
};

pub const DRAFT_GUIDELINE_PROMPT: PromptTemplate = PromptTemplate {
    slug: "guideline_draft_v1",
    system: "You are a professional neuropsychologist developing step-by-step guidelines on how to interpret SNSB-C test results to determine the subject's cognitive level.",
    user: "Below is an explanation from a fellow neuropsychologist on why they interpreted the test results in that way and why they made such a diagnosis. \
Based on this, please create step-by-step guidelines for interpreting SNSB-C test results, focusing primarily on how to utilize objective statistical data. \
Do not use your own knowledge or experience; only use the information provided.\n\n\
### Fellow Psychologist's Explanation\n\
{answer}",
};

// Sentence joins without a space are part of the published prompt.
pub const UNIFIED_GUIDELINE_PROMPT: PromptTemplate = PromptTemplate {
    slug: "guideline_unified_v1",
    system: "You are a professional neuropsychologist developing step-by-step guidelines on how to interpret SNSB-C test results to determine the subject's cognitive level falls among the following options:\n\
- (A) Normal cognition or Subjective cognitive decline\n\
- (B) Mild cognitive impairment, Early stage of dementia, or Alzheimer's disease",
    user: "Please consolidate the provided draft guidelines into a step-by-step interpretation of the SNSB-C test results. \
Do not use your own knowledge or experience, only the information provided. \
Organize the content in such a way that no examples from the draft guidelines are omitted.\
Include interpretations for both options (A) and (B) as mentioned above.\
Focus on using objective statistical data for the interpretation. \
Specifically, the method for making the final diagnosis should be described in as much detail as possible, including many different cases. \
Now, please generate the step-by-step guidelines on how to interpret SNSB-C test results to determine the subject's cognitive level\n\n\
### Draft Guidelines\n\
{draft_guidelines}",
};

// =============================================================================
// Rubric judging
// =============================================================================

/// Relative grading: candidate (A) against baseline (B) under one rubric.
pub const RELATIVE_GRADE_PROMPT: PromptTemplate = PromptTemplate {
    slug: "relative_grade_v1",
    system: "You are a fair judge assistant assigned to deliver insightful feedback that compares two responses to the same instruction, based on a given score rubric.",
    user: "###Task Description:\n\
An instruction (might include an Input inside it), two responses to evaluate (denoted as Response A and Response B), a reference answer, and a score rubric representing an evaluation criterion are given.\n\
1. Write detailed feedback that assesses the quality of the two responses strictly based on the given score rubric, not evaluating in general.\n\
2. Make comparisons between Response A, Response B, and the Reference Answer. Do not simply describe each response; compare them directly.\n\
3. After writing the feedback, indicate the better response, either \"A\" or \"B\".\n\
4. The output format should look as follows: \"Feedback: (write a feedback for criteria) [RESULT] (Either \"A\" or \"B\")\"\n\
5. Please do not generate any other opening, closing, and explanations.\n\n\
###Instruction:\n{instruction}\n\n\
###Response A:\n{response_a}\n\n\
###Response B:\n{response_b}\n\n\
###Reference Answer:\n{reference_answer}\n\n\
###Score Rubric:\n{rubric}\n\n\
###Feedback: ",
};
