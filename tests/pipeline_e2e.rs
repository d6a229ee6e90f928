mod common;

use common::{line_count, write_cohort, ScriptedGateway};
use snsb_harness::config::{RunConfig, Strategy};
use snsb_harness::evaluate::{ClassificationSummary, EvaluationReport};
use snsb_harness::payload::Payload;
use snsb_harness::store::{BatchStatus, JsonlStore};
use snsb_harness::runner;

fn config(root: &std::path::Path) -> RunConfig {
    RunConfig {
        root: root.to_path_buf(),
        source_ratio: 0.2,
        model: "scripted".into(),
        ..Default::default()
    }
}

fn summary(report: &EvaluationReport) -> &ClassificationSummary {
    match report {
        EvaluationReport::Classification(s) => s,
        other => panic!("expected classification report, got {other:?}"),
    }
}

#[tokio::test]
async fn zero_shot_run_covers_every_subject_and_reruns_as_noop() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = config(dir.path());
    let paths = config.paths();

    let gateway = ScriptedGateway::default();
    let outcome = runner::run(&config, &gateway).await.unwrap();

    assert_eq!(outcome.prefix, "zeroshot-scripted");
    assert_eq!(outcome.payloads.status, BatchStatus::Fresh);
    assert_eq!(outcome.responses.produced, 10);
    assert_eq!(line_count(&paths.payloads), 10);
    assert_eq!(line_count(&paths.responses), 10);
    assert_eq!(line_count(&paths.eval_results), 1);

    let s = summary(&outcome.report);
    assert_eq!(s.total_samples, 10);
    assert_eq!(s.accuracy, 1.0);
    assert_eq!(s.f1_score, 1.0);
    assert_eq!(gateway.calls_by("fetch"), 10);

    let rerun_gateway = ScriptedGateway::default();
    let rerun = runner::run(&config, &rerun_gateway).await.unwrap();
    assert_eq!(rerun.payloads.status, BatchStatus::AlreadyComplete);
    assert_eq!(rerun.responses.status, BatchStatus::AlreadyComplete);
    assert_eq!(rerun_gateway.total_calls(), 0);
    assert_eq!(summary(&rerun.report), s);
}

#[tokio::test]
async fn payloads_follow_subject_order_and_carry_labels() {
    let dir = tempfile::tempdir().unwrap();
    let ids = write_cohort(dir.path(), 5);
    let config = config(dir.path());

    runner::run(&config, &ScriptedGateway::default()).await.unwrap();

    let payloads: Vec<Payload> = JsonlStore::<Payload>::new(config.paths().payloads)
        .load()
        .unwrap()
        .into_iter()
        .filter_map(|s| s.as_filled().cloned())
        .collect();
    let order: Vec<&str> = payloads.iter().map(|p| p.subject_id.as_str()).collect();
    assert_eq!(order, ids.iter().map(String::as_str).collect::<Vec<_>>());

    for p in &payloads {
        assert_eq!(p.ground_truth, u8::from(p.subject_id.starts_with('I')));
        assert_eq!(p.test, 1);
        assert_eq!(p.messages.len(), 2);
        assert!(p.messages[1].content.starts_with("### Subject information\nAge: "));
        assert!((p.temperature - 0.1).abs() < f32::EPSILON);
    }
}

#[tokio::test]
async fn interrupted_fetch_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = config(dir.path());
    let paths = config.paths();

    runner::run(&config, &ScriptedGateway::default()).await.unwrap();

    // Keep the first four responses and drop the terminal evaluation.
    let text = std::fs::read_to_string(&paths.responses).unwrap();
    let kept: String = text.lines().take(4).map(|l| format!("{l}\n")).collect();
    std::fs::write(&paths.responses, kept).unwrap();
    std::fs::remove_file(&paths.eval_results).unwrap();

    let gateway = ScriptedGateway::default();
    let outcome = runner::run(&config, &gateway).await.unwrap();
    assert_eq!(outcome.payloads.status, BatchStatus::AlreadyComplete);
    assert_eq!(outcome.responses.status, BatchStatus::Resumed { from: 4 });
    assert_eq!(gateway.calls_by("fetch"), 6);
    assert_eq!(line_count(&paths.responses), 10);
    assert_eq!(summary(&outcome.report).total_samples, 10);
}

#[tokio::test]
async fn failed_and_unparseable_replies_are_excluded() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = config(dir.path());
    let paths = config.paths();

    let gateway = ScriptedGateway {
        fail_subjects: vec!["I002".into()],
        unmarked_subjects: vec!["N004".into()],
        ..Default::default()
    };
    let outcome = runner::run(&config, &gateway).await.unwrap();

    assert_eq!(outcome.responses.failed, 2);
    assert_eq!(line_count(&paths.responses), 10);
    let text = std::fs::read_to_string(&paths.responses).unwrap();
    assert_eq!(text.lines().filter(|l| *l == "{}").count(), 2);
    assert_eq!(summary(&outcome.report).total_samples, 8);
}

#[tokio::test]
async fn subject_without_documents_is_carried_as_sentinel() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = config(dir.path());
    let paths = config.paths();
    std::fs::remove_file(paths.scores_dir.join("N003.md")).unwrap();

    let gateway = ScriptedGateway::default();
    let outcome = runner::run(&config, &gateway).await.unwrap();

    assert_eq!(outcome.payloads.failed, 1);
    assert_eq!(outcome.responses.failed, 1);
    assert_eq!(gateway.calls_by("fetch"), 9);
    assert_eq!(line_count(&paths.payloads), 10);
    assert_eq!(line_count(&paths.responses), 10);

    let payloads = JsonlStore::<Payload>::new(&paths.payloads).load().unwrap();
    let sentinels: Vec<usize> = payloads
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_sentinel())
        .map(|(i, _)| i)
        .collect();
    // N003 is the seventh subject in cohort order.
    assert_eq!(sentinels, vec![6]);
    assert_eq!(summary(&outcome.report).total_samples, 9);
}

#[tokio::test]
async fn fingerprint_sidecar_is_untouched_by_complete_reruns() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = config(dir.path());
    let sidecar = {
        let mut name = config.paths().payloads.into_os_string();
        name.push(".fingerprint");
        std::path::PathBuf::from(name)
    };

    runner::run(&config, &ScriptedGateway::default()).await.unwrap();
    let recorded = std::fs::read_to_string(&sidecar).unwrap();

    // Same payload file, different temperature: reused with a warning each time.
    let warmer = RunConfig {
        temperature: 0.7,
        model: "warmer".into(),
        ..config.clone()
    };
    for _ in 0..2 {
        let outcome = runner::run(&warmer, &ScriptedGateway::default()).await.unwrap();
        assert_eq!(outcome.payloads.status, BatchStatus::AlreadyComplete);
        assert_eq!(std::fs::read_to_string(&sidecar).unwrap(), recorded);
    }
}

#[tokio::test]
async fn few_shot_payloads_embed_balanced_examples() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = RunConfig {
        strategy: Strategy::FewShot,
        num_examples: 2,
        ..config(dir.path())
    };
    let paths = config.paths();
    assert!(paths.payloads.ends_with("data/payloads/fewshot2.jsonl"));

    let outcome = runner::run(&config, &ScriptedGateway::default()).await.unwrap();
    assert_eq!(outcome.prefix, "fewshot2-scripted");

    let payloads = JsonlStore::<Payload>::new(&paths.payloads).load().unwrap();
    assert_eq!(payloads.len(), 10);
    for slot in &payloads {
        let p = slot.as_filled().expect("payload built");
        let user = &p.messages[1].content;
        assert!(user.starts_with("### Examples\nExample 1.\n"));
        assert!(user.contains("Example 2.\n"));
        assert!(!user.contains("Example 3."));
        assert!(user.contains("(A) Normal cognition"));
        assert!(user.contains("(B) Mild cognitive impairment"));
        assert!(user.contains("### Subject information"));
    }
}

#[tokio::test]
async fn few_shot_prompts_are_identical_after_resume() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = RunConfig {
        strategy: Strategy::FewShot,
        num_examples: 2,
        ..config(dir.path())
    };
    let paths = config.paths();

    runner::run(&config, &ScriptedGateway::default()).await.unwrap();
    let full = std::fs::read_to_string(&paths.payloads).unwrap();

    let kept: String = full.lines().take(3).map(|l| format!("{l}\n")).collect();
    std::fs::write(&paths.payloads, kept).unwrap();
    runner::run(&config, &ScriptedGateway::default()).await.unwrap();

    assert_eq!(std::fs::read_to_string(&paths.payloads).unwrap(), full);
}

#[tokio::test]
async fn odd_shot_count_is_rejected_before_any_io() {
    let dir = tempfile::tempdir().unwrap();
    write_cohort(dir.path(), 5);
    let config = RunConfig {
        strategy: Strategy::FewShot,
        num_examples: 3,
        ..config(dir.path())
    };
    let err = runner::run(&config, &ScriptedGateway::default()).await.unwrap_err();
    assert!(matches!(err, runner::RunError::Config(_)));
    assert!(!config.paths().payloads.exists());
}
