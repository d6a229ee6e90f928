#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use snsb_harness::config::{
    Baseline, ReportLanguage, RunConfig, Strategy, DEFAULT_CONTEXT_WINDOW, DEFAULT_MODEL,
    DEFAULT_SOURCE_RATIO, DEFAULT_TEMPERATURE,
};
use snsb_harness::dataset::{check_consistency, load_subjects, DiagnosticGroup, SnsbIndex, DEFAULT_SEED};
use snsb_harness::evaluate::EvalMode;
use snsb_harness::gateway::openai::OpenAiAdapter;
use snsb_harness::gateway::{
    Backend, BackendKind, GatewayConfig, ProviderError, ProviderGateway, TracingUsageSink,
};
use snsb_harness::guideline::{GuidelineOrigin, DEFAULT_GUIDELINE_TEMPERATURE};
use snsb_harness::runner::{self, RunData};

#[derive(Parser)]
#[command(name = "snsb", version, about = "SNSB-C LLM diagnosis evaluation harness")]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build payloads, fetch responses and evaluate them
    Run {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long, value_enum, default_value = "zeroshot")]
        strategy: CliStrategy,

        /// Few-shot example count: 1 or an even number
        #[arg(long, default_value_t = 0)]
        num_examples: usize,

        #[arg(long, value_enum, default_value = "clf")]
        eval: CliEvalMode,

        /// Earlier run the rubric judge compares against
        #[arg(long, value_enum, default_value = "zeroshot")]
        baseline: CliBaseline,

        /// Judge model for rubric evaluation (defaults to --model)
        #[arg(long)]
        judge_model: Option<String>,
    },
    /// Print the seeded source/test split
    Split {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Cross-check info.jsonl against the SNSB score and report files
    Validate {
        #[command(flatten)]
        data: DataArgs,
    },
    /// Synthesize (or load the cached) interpretation guideline
    Guideline {
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        model: ModelArgs,

        #[arg(long, default_value_t = DEFAULT_GUIDELINE_TEMPERATURE)]
        guideline_temperature: f32,
    },
}

#[derive(Args, Debug)]
struct DataArgs {
    /// Directory holding data/, prompts/ and results/
    #[arg(long, default_value = ".")]
    root: PathBuf,

    #[arg(long, default_value_t = DEFAULT_SOURCE_RATIO)]
    source_ratio: f64,

    #[arg(long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    #[arg(long, value_enum, default_value = "eng")]
    report_language: CliLanguage,
}

#[derive(Args, Debug)]
struct ModelArgs {
    #[arg(long, value_enum, default_value = "ollama")]
    backend: CliBackend,

    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    temperature: f32,

    /// Context window requested from the backend (Ollama num_ctx)
    #[arg(long, default_value_t = DEFAULT_CONTEXT_WINDOW)]
    context_window: u32,

    /// OpenAI API key (defaults to OPENAI_API_KEY)
    #[arg(long)]
    api_key: Option<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliStrategy {
    Zeroshot,
    Fewshot,
    Custom,
}

impl From<CliStrategy> for Strategy {
    fn from(s: CliStrategy) -> Self {
        match s {
            CliStrategy::Zeroshot => Strategy::ZeroShot,
            CliStrategy::Fewshot => Strategy::FewShot,
            CliStrategy::Custom => Strategy::Custom,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliBackend {
    Openai,
    Ollama,
    Vllm,
}

impl From<CliBackend> for BackendKind {
    fn from(b: CliBackend) -> Self {
        match b {
            CliBackend::Openai => BackendKind::OpenAi,
            CliBackend::Ollama => BackendKind::Ollama,
            CliBackend::Vllm => BackendKind::Vllm,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliEvalMode {
    Clf,
    Rubric,
}

impl From<CliEvalMode> for EvalMode {
    fn from(m: CliEvalMode) -> Self {
        match m {
            CliEvalMode::Clf => EvalMode::Classification,
            CliEvalMode::Rubric => EvalMode::Rubric,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliBaseline {
    Zeroshot,
    Fewshot1,
    Fewshot2,
}

impl From<CliBaseline> for Baseline {
    fn from(b: CliBaseline) -> Self {
        match b {
            CliBaseline::Zeroshot => Baseline::ZeroShot,
            CliBaseline::Fewshot1 => Baseline::FewShot1,
            CliBaseline::Fewshot2 => Baseline::FewShot2,
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliLanguage {
    Eng,
    Kor,
}

impl From<CliLanguage> for ReportLanguage {
    fn from(l: CliLanguage) -> Self {
        match l {
            CliLanguage::Eng => ReportLanguage::Eng,
            CliLanguage::Kor => ReportLanguage::Kor,
        }
    }
}

impl DataArgs {
    fn apply(&self, config: &mut RunConfig) {
        config.root = self.root.clone();
        config.source_ratio = self.source_ratio;
        config.seed = self.seed;
        config.report_language = self.report_language.into();
    }
}

impl ModelArgs {
    fn apply(&self, config: &mut RunConfig) {
        config.backend = self.backend.into();
        config.model = self.model.clone();
        config.temperature = self.temperature;
        config.context_window = self.context_window;
    }

    fn gateway(&self) -> Result<ProviderGateway<TracingUsageSink>, ProviderError> {
        let sink = Arc::new(TracingUsageSink);
        match (self.backend, &self.api_key) {
            (CliBackend::Openai, Some(key)) => Ok(ProviderGateway::with_config(
                Backend::OpenAiCompatible(OpenAiAdapter::openai_with_key(key.clone())?),
                sink,
                GatewayConfig::default(),
            )),
            (backend, _) => ProviderGateway::from_env(backend.into(), sink),
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            data,
            model,
            strategy,
            num_examples,
            eval,
            baseline,
            judge_model,
        } => {
            let mut config = RunConfig {
                strategy: strategy.into(),
                num_examples,
                eval_mode: eval.into(),
                baseline: baseline.into(),
                judge_model,
                ..Default::default()
            };
            data.apply(&mut config);
            model.apply(&mut config);

            let gateway = model.gateway()?;
            let outcome = runner::run(&config, &gateway).await?;

            tracing::info!(
                prefix = %outcome.prefix,
                payloads = ?outcome.payloads,
                responses = ?outcome.responses,
                "run finished"
            );
            println!("{}", serde_json::to_string_pretty(&outcome.report)?);
        }
        Commands::Split { data } => {
            let mut config = RunConfig::default();
            data.apply(&mut config);
            let run_data = RunData::load(&config)?;
            let split = &run_data.split;

            let source = run_data.source_subjects();
            let count = |group: DiagnosticGroup| source.iter().filter(|s| s.group == group).count();
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "source_ids": split.source_ids,
                    "source_per_group": split.source_per_group,
                    "source_normal": count(DiagnosticGroup::Normal),
                    "source_impaired": count(DiagnosticGroup::Impaired),
                    "test_count": split.test_ids.len(),
                }))?
            );
        }
        Commands::Validate { data } => {
            let mut config = RunConfig::default();
            data.apply(&mut config);
            let paths = config.paths();
            let subjects = load_subjects(&paths.info)?;
            let index = SnsbIndex::build(&paths.scores_dir, &paths.reports_dir)?;
            let report = check_consistency(&subjects, &index)?;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_consistent() {
                return Err("dataset is inconsistent".into());
            }
        }
        Commands::Guideline {
            data,
            model,
            guideline_temperature,
        } => {
            let mut config = RunConfig {
                strategy: Strategy::Custom,
                guideline_temperature,
                ..Default::default()
            };
            data.apply(&mut config);
            model.apply(&mut config);

            let run_data = RunData::load(&config)?;
            let gateway = model.gateway()?;
            let (guideline, origin) = runner::load_guideline(&config, &run_data, &gateway).await?;
            if origin == GuidelineOrigin::Cached {
                eprintln!("[guideline] loaded from {}", run_data.paths.guideline.display());
            } else {
                eprintln!("[guideline] written to {}", run_data.paths.guideline.display());
            }
            println!("{guideline}");
        }
    }

    Ok(())
}
