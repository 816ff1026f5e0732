use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use firegrid::app::{Pipeline, UnifyOptions};
use firegrid::config::ConfigLoader;
use firegrid::domain::{DateRange, parse_date};
use firegrid::error::FiregridError;
use firegrid::output::{
    ConsoleProgress, JsonOutput, OutputMode, print_tabularize_summary, print_unify_summary,
};

#[derive(Parser)]
#[command(name = "firegrid")]
#[command(about = "Wildfire data unification: one grid, one calendar, one feature table")]
#[command(version, author)]
struct Cli {
    /// Print results as JSON and suppress progress output.
    #[arg(long, global = true, alias = "json")]
    non_interactive: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Regrid and align all sources into a new archive version")]
    Unify(UnifyArgs),
    #[command(about = "Flatten an archive version into partitioned feature tables")]
    Tabularize(TabularizeArgs),
}

#[derive(Args)]
struct RangeArgs {
    /// First day, YYYY-MM-DD.
    #[arg(long)]
    start: String,

    /// Last day (inclusive), YYYY-MM-DD.
    #[arg(long)]
    end: String,

    #[arg(long)]
    config: Option<String>,
}

impl RangeArgs {
    fn range(&self) -> Result<DateRange, FiregridError> {
        DateRange::new(parse_date(&self.start)?, parse_date(&self.end)?)
    }
}

#[derive(Args)]
struct UnifyArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Comma-separated source names; all configured sources when omitted.
    #[arg(long, value_delimiter = ',')]
    sources: Option<Vec<String>>,
}

#[derive(Args)]
struct TabularizeArgs {
    #[command(flatten)]
    range: RangeArgs,

    /// Prediction horizon in days.
    #[arg(long)]
    horizon: Option<u32>,

    /// Archive version; the latest when omitted.
    #[arg(long)]
    version: Option<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<FiregridError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &FiregridError) -> u8 {
    match error {
        FiregridError::Configuration(_)
        | FiregridError::MissingConfig
        | FiregridError::ConfigRead(_)
        | FiregridError::ConfigParse(_)
        | FiregridError::InvalidSource(_)
        | FiregridError::InvalidDateRange(_)
        | FiregridError::ArchiveNotFound(_) => 2,
        FiregridError::SchemaConflict(_) => 3,
        FiregridError::ConflictResolutionAmbiguity { .. } => 4,
        FiregridError::PartialFailure(_) => 5,
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
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    match cli.command {
        Commands::Unify(args) => run_unify(args, output_mode),
        Commands::Tabularize(args) => run_tabularize(args, output_mode),
    }
}

fn run_unify(args: UnifyArgs, output_mode: OutputMode) -> miette::Result<()> {
    let range = args.range.range()?;
    let config = ConfigLoader::resolve(args.range.config.as_deref())?;
    let pipeline = Pipeline::new(config);
    let options = UnifyOptions {
        range,
        sources: args.sources,
    };

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = pipeline.unify(&options, &JsonOutput)?;
            JsonOutput::print_unify(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = pipeline.unify(&options, &ConsoleProgress::new())?;
            print_unify_summary(&result);
            result
        }
    };
    if result.is_partial() {
        return Err(FiregridError::PartialFailure(result.failures.len()).into());
    }
    Ok(())
}

fn run_tabularize(args: TabularizeArgs, output_mode: OutputMode) -> miette::Result<()> {
    let range = args.range.range()?;
    let config = ConfigLoader::resolve(args.range.config.as_deref())?;
    let pipeline = Pipeline::new(config);

    let result = match output_mode {
        OutputMode::NonInteractive => {
            let result = pipeline.tabularize(
                &range,
                args.horizon,
                args.version.as_deref(),
                None,
                &JsonOutput,
            )?;
            JsonOutput::print_tabularize(&result).into_diagnostic()?;
            result
        }
        OutputMode::Interactive => {
            let result = pipeline.tabularize(
                &range,
                args.horizon,
                args.version.as_deref(),
                None,
                &ConsoleProgress::new(),
            )?;
            print_tabularize_summary(&result);
            result
        }
    };
    if result.is_partial() {
        return Err(FiregridError::PartialFailure(result.failures.len()).into());
    }
    Ok(())
}
