use std::process::ExitCode;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

use content_packager::config::ConfigLoader;
use content_packager::error::PipelineError;
use content_packager::metadata::FileMetadata;
use content_packager::output::{JsonOutput, ProcessReport, ProcessResult, VerifyResult};
use content_packager::pipeline::Pipeline;
use content_packager::settings::Settings;

#[derive(Parser)]
#[command(name = "cpack")]
#[command(about = "Download, validate and convert content files into content-addressed storage")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run locators through the download, convert and metadata stages")]
    Process(ProcessArgs),
    #[command(about = "Check that stored files still match their content hash")]
    Verify(VerifyArgs),
}

#[derive(Args)]
struct ProcessArgs {
    #[arg(required = true)]
    locators: Vec<String>,

    #[arg(long)]
    language: Option<String>,

    #[arg(long = "subtitle-lang")]
    subtitle_langs: Vec<String>,

    #[arg(long)]
    compress: bool,

    #[arg(long)]
    max_height: Option<u32>,

    #[arg(long = "set", value_name = "KEY=VALUE")]
    assignments: Vec<String>,

    #[arg(long)]
    skip_cache: bool,

    #[arg(long, default_value_t = 1)]
    jobs: usize,
}

#[derive(Args)]
struct VerifyArgs {
    #[arg(required = true)]
    filenames: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<PipelineError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &PipelineError) -> u8 {
    match error {
        PipelineError::InvalidLocator(_)
        | PipelineError::NoHandler(_)
        | PipelineError::NoDownloadResult(_)
        | PipelineError::SourceRead { .. }
        | PipelineError::UnsupportedFormat(_)
        | PipelineError::InvalidFile { .. }
        | PipelineError::MissingEntry { .. }
        | PipelineError::MissingLanguage { .. }
        | PipelineError::ConfigRead(_) => 2,
        PipelineError::Http(_)
        | PipelineError::Timeout(_)
        | PipelineError::HttpStatus { .. }
        | PipelineError::ToolFailure { .. }
        | PipelineError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let pipeline = Pipeline::from_config(&config)?;

    match cli.command {
        Commands::Process(args) => run_process(&pipeline, args),
        Commands::Verify(args) => run_verify(&pipeline, args),
    }
}

fn call_settings(args: &ProcessArgs) -> Result<Settings, PipelineError> {
    let mut settings = Settings::new();
    if let Some(language) = &args.language {
        settings.insert("language", language.as_str());
    }
    if !args.subtitle_langs.is_empty() {
        let languages = args
            .subtitle_langs
            .iter()
            .map(|lang| Value::String(lang.clone()))
            .collect::<Vec<_>>();
        settings.insert("subtitle_languages", Value::Array(languages));
    }
    if args.compress {
        settings.insert("compress", true);
    }
    if let Some(max_height) = args.max_height {
        settings.insert("max_height", max_height);
    }
    for assignment in &args.assignments {
        let (key, value) = Settings::parse_assignment(assignment)?;
        settings.insert(&key, value);
    }
    Ok(settings)
}

type Outcome = Result<Vec<FileMetadata>, PipelineError>;

/// Independent locators share the pipeline across `jobs` scoped threads.
fn process_all(
    pipeline: &Pipeline,
    locators: &[String],
    settings: &Settings,
    skip_cache: bool,
    jobs: usize,
) -> Vec<Outcome> {
    let next = AtomicUsize::new(0);
    let outcomes = Mutex::new(
        locators
            .iter()
            .map(|_| None)
            .collect::<Vec<Option<Outcome>>>(),
    );
    thread::scope(|scope| {
        for _ in 0..jobs.clamp(1, locators.len().max(1)) {
            scope.spawn(|| {
                loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(locator) = locators.get(index) else {
                        break;
                    };
                    let outcome = pipeline.execute(locator, settings, skip_cache);
                    let mut guard = outcomes
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    guard[index] = Some(outcome);
                }
            });
        }
    });
    outcomes
        .into_inner()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .into_iter()
        .map(|outcome| {
            outcome.unwrap_or_else(|| {
                Err(PipelineError::Filesystem("worker exited early".to_string()))
            })
        })
        .collect()
}

fn run_process(pipeline: &Pipeline, args: ProcessArgs) -> miette::Result<()> {
    let settings = call_settings(&args)?;
    info!(locators = args.locators.len(), jobs = args.jobs, "processing");
    let outcomes = process_all(
        pipeline,
        &args.locators,
        &settings,
        args.skip_cache,
        args.jobs,
    );

    let mut first_error: Option<PipelineError> = None;
    let mut results = Vec::with_capacity(outcomes.len());
    for (locator, outcome) in args.locators.iter().zip(outcomes) {
        match outcome {
            Ok(files) => results.push(ProcessResult {
                locator: locator.clone(),
                files,
                error: None,
            }),
            Err(err) => {
                results.push(ProcessResult {
                    locator: locator.clone(),
                    files: Vec::new(),
                    error: Some(err.to_string()),
                });
                // operational failures outrank per-file ones
                let replace = match &first_error {
                    None => true,
                    Some(current) => current.kind().is_per_file() && !err.kind().is_per_file(),
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }
    }
    let report = ProcessReport {
        results,
        failed: pipeline.failed().snapshot(),
    };
    JsonOutput::print_process(&report).into_diagnostic()?;
    match first_error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn run_verify(pipeline: &Pipeline, args: VerifyArgs) -> miette::Result<()> {
    let storage = &pipeline.workspace().storage;
    let mut results = Vec::with_capacity(args.filenames.len());
    for filename in &args.filenames {
        let name = storage.normalize_locator(filename);
        results.push(VerifyResult {
            path: storage.path_for(&name).to_string(),
            valid: pipeline.verify(&name)?,
            filename: name,
        });
    }
    JsonOutput::print_verify(&results).into_diagnostic()?;
    if results.iter().any(|result| !result.valid) {
        return Err(miette::Report::msg("one or more stored files failed verification"));
    }
    Ok(())
}
