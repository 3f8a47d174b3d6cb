use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_sc_fetch::app::{App, BatchOptions, DownloadOptions, ProgressSink};
use kira_sc_fetch::config::{ConfigLoader, ConfigOverrides, ResolvedConfig};
use kira_sc_fetch::domain::{GeoSampleAccession, GeoSeriesAccession, SingleCellDataType};
use kira_sc_fetch::error::KiraError;
use kira_sc_fetch::geo::{GeoClient, GeoHttpClient, SoftDirClient};
use kira_sc_fetch::orchestrator::GeoSingleCellDetector;
use kira_sc_fetch::output::{JsonOutput, OutputMode, TextOutput};
use kira_sc_fetch::retry::RetryPolicy;
use kira_sc_fetch::summary::RetryClass;

#[derive(Parser)]
#[command(name = "kira-scf")]
#[command(about = "Detect and download single-cell data from GEO supplementary files")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    non_interactive: bool,

    /// Alias of --non-interactive.
    #[arg(long, global = true)]
    json: bool,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, global = true)]
    config: Option<String>,

    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[arg(long, global = true)]
    retry_delay_ms: Option<u64>,

    #[arg(long, global = true)]
    fetch_threads: Option<usize>,

    #[arg(long, global = true)]
    download_dir: Option<String>,

    /// Read `{GSE}_family.soft[.gz]` from this directory instead of GEO.
    #[arg(long, global = true)]
    soft_dir: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Report single-cell data types and samples of GEO series")]
    Detect(DetectArgs),
    #[command(about = "Download single-cell data of GEO series")]
    Download(DownloadArgs),
    #[command(about = "Print the loader configuration of downloaded data")]
    LoaderConfig(LoaderConfigArgs),
    #[command(about = "Parse cell type assignment files against the samples of a series")]
    CellTypes(CellTypesArgs),
}

#[derive(Args)]
struct DetectArgs {
    #[arg(required = true)]
    accessions: Vec<String>,
}

#[derive(Args)]
struct DownloadArgs {
    #[arg(required = true)]
    accessions: Vec<String>,

    #[arg(long, value_enum)]
    data_type: Option<SingleCellDataType>,

    /// Download this supplementary file; requires --data-type.
    #[arg(long, requires = "data_type")]
    supplementary_file: Option<String>,

    /// Only keep these samples, comma-separated.
    #[arg(long, value_delimiter = ',')]
    sample: Vec<String>,

    #[arg(long)]
    skip_download: bool,

    #[arg(long)]
    summary: Option<PathBuf>,

    #[arg(long, requires = "summary")]
    resume: bool,

    /// Outcome classes to attempt again, comma-separated.
    #[arg(long, value_enum, value_delimiter = ',', requires = "resume")]
    retry: Vec<RetryClass>,
}

#[derive(Args)]
struct LoaderConfigArgs {
    accession: String,
}

#[derive(Args)]
struct CellTypesArgs {
    accession: String,

    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::NoDataFound(_)
        | KiraError::InvalidAccession(_)
        | KiraError::InvalidSampleAccession(_) => 2,
        KiraError::TransientIo(_)
        | KiraError::Http(_)
        | KiraError::HttpStatus { .. }
        | KiraError::GeoStatus { .. }
        | KiraError::RetriesExhausted { .. } => 3,
        KiraError::Unsupported(_) | KiraError::AmbiguousMatch(_) => 4,
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
    let output_mode = if cli.non_interactive || cli.json {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let overrides = ConfigOverrides {
        max_retries: cli.config.max_retries,
        retry_delay_ms: cli.config.retry_delay_ms,
        fetch_threads: cli.config.fetch_threads,
        download_dir: cli.config.download_dir.clone(),
    };
    let resolved = ConfigLoader::resolve(cli.config.config.as_deref(), &overrides)?;
    let detector = GeoSingleCellDetector::from_config(&resolved)?;

    match &cli.config.soft_dir {
        Some(dir) => {
            let app = App::new(SoftDirClient::new(dir.as_str()), detector);
            run_command(cli.command, app, output_mode)
        }
        None => {
            let geo = GeoHttpClient::new(retry_policy(&resolved))?;
            let app = App::new(geo, detector);
            run_command(cli.command, app, output_mode)
        }
    }
}

fn retry_policy(config: &ResolvedConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_retries,
        std::time::Duration::from_millis(config.retry_delay_ms),
    )
}

fn progress_sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Interactive => &TextOutput,
        OutputMode::NonInteractive => &JsonOutput,
    }
}

fn parse_series(accessions: &[String]) -> Result<Vec<GeoSeriesAccession>, KiraError> {
    accessions.iter().map(|value| value.parse()).collect()
}

fn run_command<G: GeoClient>(
    command: Commands,
    app: App<G>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let sink = progress_sink(output_mode);
    match command {
        Commands::Detect(args) => {
            let accessions = parse_series(&args.accessions)?;
            let results = accessions
                .iter()
                .map(|accession| app.detect(accession, sink))
                .collect::<Result<Vec<_>, _>>()?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_detect(&results).into_diagnostic()?,
                OutputMode::Interactive => TextOutput::print_detect(&results),
            }
            Ok(())
        }
        Commands::Download(args) => run_download(args, app, output_mode, sink),
        Commands::LoaderConfig(args) => {
            let accession: GeoSeriesAccession = args.accession.parse()?;
            let config = app.loader_config(&accession, sink)?;
            match output_mode {
                OutputMode::NonInteractive => {
                    JsonOutput::print_loader_config(&config).into_diagnostic()?
                }
                OutputMode::Interactive => TextOutput::print_loader_config(&config),
            }
            Ok(())
        }
        Commands::CellTypes(args) => {
            let accession: GeoSeriesAccession = args.accession.parse()?;
            let result = app.cell_types(&accession, &args.files, sink)?;
            match output_mode {
                OutputMode::NonInteractive => JsonOutput::print_cell_types(&result).into_diagnostic()?,
                OutputMode::Interactive => TextOutput::print_cell_types(&result),
            }
            Ok(())
        }
    }
}

fn run_download<G: GeoClient>(
    args: DownloadArgs,
    app: App<G>,
    output_mode: OutputMode,
    sink: &dyn ProgressSink,
) -> miette::Result<()> {
    let accessions = parse_series(&args.accessions)?;
    let single = accessions.len() == 1 && args.summary.is_none();
    if accessions.len() > 1 && (args.supplementary_file.is_some() || !args.sample.is_empty()) {
        return Err(KiraError::InvalidConfig(
            "--supplementary-file and --sample need a single accession".to_string(),
        )
        .into());
    }
    let samples = args
        .sample
        .iter()
        .map(|value| value.parse::<GeoSampleAccession>())
        .collect::<Result<Vec<_>, _>>()?;
    let options = DownloadOptions {
        data_type: args.data_type,
        supplementary_file: args.supplementary_file,
        samples,
        skip_download: args.skip_download,
    };

    if single {
        let result = app.download(&accessions[0], &options, sink)?;
        match output_mode {
            OutputMode::NonInteractive => JsonOutput::print_download(&result).into_diagnostic()?,
            OutputMode::Interactive => TextOutput::print_download(&result),
        }
        return Ok(());
    }

    let batch = BatchOptions {
        summary: args.summary,
        resume: args.resume,
        retry: args.retry,
    };
    let result = app.download_batch(&accessions, &options, &batch, sink)?;
    match output_mode {
        OutputMode::NonInteractive => JsonOutput::print_batch(&result).into_diagnostic()?,
        OutputMode::Interactive => TextOutput::print_batch(&result),
    }
    Ok(())
}
