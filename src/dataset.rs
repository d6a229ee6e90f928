//! Subject metadata, SNSB document lookup, and the stratified source/test split.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Default seed for every sampling decision in a run.
pub const DEFAULT_SEED: u64 = 42;

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: invalid subject record: {source}")]
    Parse {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("duplicate subject id '{0}'")]
    DuplicateSubject(String),
    #[error("source ratio must be within [0, 1], got {0}")]
    InvalidRatio(f64),
    #[error("insufficient population in group {group}: need {requested}, have {available}")]
    InsufficientPopulation {
        group: DiagnosticGroup,
        requested: usize,
        available: usize,
    },
    #[error("no {kind} document for subject '{subject_id}'")]
    MissingDocument {
        kind: DocumentKind,
        subject_id: String,
    },
    #[error("unknown subject '{0}'")]
    UnknownSubject(String),
}

// =============================================================================
// Subjects
// =============================================================================

/// Binary diagnostic label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum DiagnosticGroup {
    /// Normal cognition or subjective cognitive decline.
    Normal,
    /// MCI, early dementia, or Alzheimer's disease.
    Impaired,
}

impl DiagnosticGroup {
    pub const ALL: [DiagnosticGroup; 2] = [DiagnosticGroup::Normal, DiagnosticGroup::Impaired];

    pub fn label(self) -> u8 {
        match self {
            DiagnosticGroup::Normal => 0,
            DiagnosticGroup::Impaired => 1,
        }
    }
}

impl TryFrom<u8> for DiagnosticGroup {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(DiagnosticGroup::Normal),
            1 => Ok(DiagnosticGroup::Impaired),
            other => Err(format!("diagnostic group must be 0 or 1, got {other}")),
        }
    }
}

impl From<DiagnosticGroup> for u8 {
    fn from(g: DiagnosticGroup) -> u8 {
        g.label()
    }
}

impl fmt::Display for DiagnosticGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One line of `info.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub subject_id: String,
    pub age: u32,
    pub gender: String,
    pub education_years: u32,
    pub group: DiagnosticGroup,
}

/// Load subject records in file order. Blank lines are skipped.
pub fn load_subjects(path: impl AsRef<Path>) -> Result<Vec<SubjectRecord>, DatasetError> {
    let path = path.as_ref();
    let io_err = |source: std::io::Error| DatasetError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(io_err)?;

    let mut subjects: Vec<SubjectRecord> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let record: SubjectRecord =
            serde_json::from_str(&line).map_err(|source| DatasetError::Parse {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
        if !seen.insert(record.subject_id.clone()) {
            return Err(DatasetError::DuplicateSubject(record.subject_id));
        }
        subjects.push(record);
    }
    Ok(subjects)
}

// =============================================================================
// Source / test split
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceTestSplit {
    /// Group-0 sample followed by the group-1 sample.
    pub source_ids: Vec<String>,
    /// Every subject, in input order.
    pub test_ids: Vec<String>,
    pub source_per_group: usize,
}

/// Per-group sample size: `round(total * ratio / 2)`.
pub fn source_size_per_group(total: usize, ratio: f64) -> usize {
    (total as f64 * ratio / 2.0).round() as usize
}

/// Stratified split. The test set is never held out: it is always every subject.
pub fn split_source_test(
    subjects: &[SubjectRecord],
    ratio: f64,
    rng: &mut StdRng,
) -> Result<SourceTestSplit, DatasetError> {
    if !(0.0..=1.0).contains(&ratio) || ratio.is_nan() {
        return Err(DatasetError::InvalidRatio(ratio));
    }

    let per_group = source_size_per_group(subjects.len(), ratio);

    let mut source_ids = Vec::with_capacity(per_group * 2);
    for group in DiagnosticGroup::ALL {
        let members: Vec<&str> = subjects
            .iter()
            .filter(|s| s.group == group)
            .map(|s| s.subject_id.as_str())
            .collect();
        if members.len() < per_group {
            return Err(DatasetError::InsufficientPopulation {
                group,
                requested: per_group,
                available: members.len(),
            });
        }
        source_ids.extend(
            members
                .choose_multiple(rng, per_group)
                .map(|id| id.to_string()),
        );
    }

    let test_ids = subjects.iter().map(|s| s.subject_id.clone()).collect();

    tracing::info!(
        source = source_ids.len(),
        per_group,
        test = subjects.len(),
        "sampled source set"
    );

    Ok(SourceTestSplit {
        source_ids,
        test_ids,
        source_per_group: per_group,
    })
}

// =============================================================================
// SNSB documents
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Score,
    Report,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Score => f.write_str("score"),
            DocumentKind::Report => f.write_str("report"),
        }
    }
}

/// Report split into its two leading paragraphs.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSections<'a> {
    pub rationale: &'a str,
    pub diagnosis: &'a str,
}

/// Split a report on blank lines. The first paragraph is the rationale and the
/// second the diagnosis; anything after is ignored.
pub fn split_report(report: &str) -> Option<ReportSections<'_>> {
    let mut parts = report.split("\n\n");
    let rationale = parts.next()?;
    let diagnosis = parts.next()?;
    Some(ReportSections {
        rationale,
        diagnosis,
    })
}

/// File-name index over the score and report directories, built once per run.
#[derive(Debug, Clone, Default)]
pub struct SnsbIndex {
    scores: BTreeMap<String, PathBuf>,
    reports: BTreeMap<String, PathBuf>,
}

impl SnsbIndex {
    pub fn build(scores_dir: &Path, reports_dir: &Path) -> Result<Self, DatasetError> {
        Ok(Self {
            scores: scan_dir(scores_dir)?,
            reports: scan_dir(reports_dir)?,
        })
    }

    fn table(&self, kind: DocumentKind) -> &BTreeMap<String, PathBuf> {
        match kind {
            DocumentKind::Score => &self.scores,
            DocumentKind::Report => &self.reports,
        }
    }

    /// Resolve a document path: exact file-stem match first, then the first
    /// file name (in sorted order) that starts with the subject id.
    pub fn path(&self, kind: DocumentKind, subject_id: &str) -> Option<&Path> {
        let table = self.table(kind);
        if let Some(p) = table.get(subject_id) {
            return Some(p);
        }
        table
            .iter()
            .find(|(name, _)| name.starts_with(subject_id))
            .map(|(_, p)| p.as_path())
    }

    pub fn read(&self, kind: DocumentKind, subject_id: &str) -> Result<String, DatasetError> {
        let path = self
            .path(kind, subject_id)
            .ok_or_else(|| DatasetError::MissingDocument {
                kind,
                subject_id: subject_id.to_string(),
            })?;
        std::fs::read_to_string(path).map_err(|source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn score(&self, subject_id: &str) -> Result<String, DatasetError> {
        self.read(DocumentKind::Score, subject_id)
    }

    pub fn report(&self, subject_id: &str) -> Result<String, DatasetError> {
        self.read(DocumentKind::Report, subject_id)
    }

    /// Index keys (file stems) for one document kind.
    pub fn keys(&self, kind: DocumentKind) -> impl Iterator<Item = &str> {
        self.table(kind).keys().map(String::as_str)
    }
}

/// Map file stem -> path for every regular file in `dir`. A missing directory is an empty table.
fn scan_dir(dir: &Path) -> Result<BTreeMap<String, PathBuf>, DatasetError> {
    let mut out = BTreeMap::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(dir = %dir.display(), "document directory not found");
            return Ok(out);
        }
        Err(source) => {
            return Err(DatasetError::Io {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    for entry in entries {
        let entry = entry.map_err(|source| DatasetError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        out.insert(stem.to_string(), path);
    }
    Ok(out)
}

// =============================================================================
// Consistency check
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConsistencyReport {
    pub subjects: usize,
    pub missing_scores: Vec<String>,
    pub missing_reports: Vec<String>,
    /// Reports with fewer than two paragraphs.
    pub malformed_reports: Vec<String>,
    /// Score or report files whose stem matches no subject.
    pub orphan_documents: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_scores.is_empty()
            && self.missing_reports.is_empty()
            && self.malformed_reports.is_empty()
            && self.orphan_documents.is_empty()
    }
}

/// Cross-check `info.jsonl` against the score and report directories.
pub fn check_consistency(
    subjects: &[SubjectRecord],
    index: &SnsbIndex,
) -> Result<ConsistencyReport, DatasetError> {
    let mut report = ConsistencyReport {
        subjects: subjects.len(),
        ..Default::default()
    };

    for subject in subjects {
        let id = subject.subject_id.as_str();
        if index.path(DocumentKind::Score, id).is_none() {
            report.missing_scores.push(id.to_string());
        }
        if index.path(DocumentKind::Report, id).is_none() {
            report.missing_reports.push(id.to_string());
            continue;
        }
        let text = index.report(id)?;
        if split_report(&text).is_none() {
            report.malformed_reports.push(id.to_string());
        }
    }

    for kind in [DocumentKind::Score, DocumentKind::Report] {
        for key in index.keys(kind) {
            if !subjects.iter().any(|s| key.starts_with(&s.subject_id)) {
                report.orphan_documents.push(format!("{kind}:{key}"));
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn subject(id: &str, group: DiagnosticGroup) -> SubjectRecord {
        SubjectRecord {
            subject_id: id.to_string(),
            age: 70,
            gender: "F".to_string(),
            education_years: 12,
            group,
        }
    }

    fn cohort(normal: usize, impaired: usize) -> Vec<SubjectRecord> {
        let mut out = Vec::new();
        for i in 0..normal {
            out.push(subject(&format!("N{i:03}"), DiagnosticGroup::Normal));
        }
        for i in 0..impaired {
            out.push(subject(&format!("I{i:03}"), DiagnosticGroup::Impaired));
        }
        out
    }

    #[test]
    fn group_round_trips_as_integer() {
        let s: SubjectRecord = serde_json::from_str(
            r#"{"subject_id":"a","age":71,"gender":"M","education_years":9,"group":1,"name":"x"}"#,
        )
        .unwrap();
        assert_eq!(s.group, DiagnosticGroup::Impaired);
        assert!(serde_json::to_string(&s).unwrap().contains(r#""group":1"#));
        assert!(serde_json::from_str::<DiagnosticGroup>("2").is_err());
    }

    #[test]
    fn load_subjects_rejects_repeated_id() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("info.jsonl");
        let line = |id: &str| {
            format!(r#"{{"subject_id":"{id}","age":70,"gender":"F","education_years":12,"group":0}}"#)
        };
        std::fs::write(&path, [line("a"), String::new(), line("b"), line("a")].join("\n")).unwrap();

        let err = load_subjects(&path).unwrap_err();
        assert!(matches!(err, DatasetError::DuplicateSubject(id) if id == "a"));

        std::fs::write(&path, [line("a"), line("b")].join("\n")).unwrap();
        assert_eq!(load_subjects(&path).unwrap().len(), 2);
    }

    #[test]
    fn per_group_size_rounds_half_away_from_zero() {
        assert_eq!(source_size_per_group(10, 0.2), 1);
        assert_eq!(source_size_per_group(30, 0.1), 2);
        assert_eq!(source_size_per_group(100, 0.1), 5);
        assert_eq!(source_size_per_group(10, 0.0), 0);
    }

    #[test]
    fn split_is_stratified_and_reproducible() {
        let subjects = cohort(20, 20);
        let a = split_source_test(&subjects, 0.2, &mut StdRng::seed_from_u64(DEFAULT_SEED)).unwrap();
        let b = split_source_test(&subjects, 0.2, &mut StdRng::seed_from_u64(DEFAULT_SEED)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.source_ids.len(), 8);
        assert!(a.source_ids[..4].iter().all(|id| id.starts_with('N')));
        assert!(a.source_ids[4..].iter().all(|id| id.starts_with('I')));
        assert_eq!(a.test_ids.len(), 40);
        assert_eq!(a.test_ids[0], "N000");
    }

    #[test]
    fn split_fails_loudly_on_small_group() {
        let subjects = cohort(18, 1);
        let err = split_source_test(&subjects, 0.4, &mut StdRng::seed_from_u64(1)).unwrap_err();
        assert!(matches!(
            err,
            DatasetError::InsufficientPopulation {
                group: DiagnosticGroup::Impaired,
                requested: 4,
                available: 1
            }
        ));
    }

    #[test]
    fn split_rejects_bad_ratio() {
        let subjects = cohort(2, 2);
        assert!(matches!(
            split_source_test(&subjects, 1.5, &mut StdRng::seed_from_u64(1)),
            Err(DatasetError::InvalidRatio(_))
        ));
    }

    #[test]
    fn report_split_takes_first_two_paragraphs() {
        let r = split_report("why\nmore why\n\n(A) Normal\n\nappendix").unwrap();
        assert_eq!(r.rationale, "why\nmore why");
        assert_eq!(r.diagnosis, "(A) Normal");
        assert!(split_report("single paragraph").is_none());
    }

    #[test]
    fn index_prefers_exact_stem_then_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let scores = dir.path().join("scores");
        std::fs::create_dir_all(&scores).unwrap();
        std::fs::write(scores.join("1001.md"), "exact").unwrap();
        std::fs::write(scores.join("10010.md"), "longer").unwrap();
        std::fs::write(scores.join("2002_SNSB.md"), "prefixed").unwrap();

        let index = SnsbIndex::build(&scores, &dir.path().join("missing")).unwrap();
        assert_eq!(index.score("1001").unwrap(), "exact");
        assert_eq!(index.score("2002").unwrap(), "prefixed");
        assert!(matches!(
            index.report("1001"),
            Err(DatasetError::MissingDocument {
                kind: DocumentKind::Report,
                ..
            })
        ));
    }
}
