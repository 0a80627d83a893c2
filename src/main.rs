//! Ruleflow CLI
//!
//! ```bash
//! ruleflow run flow.rules
//! ruleflow ls flow.rules type=bam --format csv --output bams.csv
//! ruleflow dot flow.rules | dot -Tpng -o graph.png
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use ruleflow::tabular::{self, Format};
use ruleflow::Settings;
use std::io::Write as _;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ruleflow", version, about = "Content-addressed workflow engine")]
struct Cli {
    /// Directory to store working results (overrides configuration)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the rules in a rule file
    Run {
        /// Rule file to execute
        rule_file: PathBuf,
    },
    /// List the artifacts visible after a read-only replay
    Ls {
        /// Rule file defining the session
        rule_file: PathBuf,
        /// Property filters, e.g. type=bam
        filters: Vec<String>,
        #[arg(long, value_enum, default_value_t = OutputFormat::Brief)]
        format: OutputFormat,
        /// Group brief output by this field instead of "type"
        #[arg(long)]
        groupby: Option<String>,
        /// Comma-separated fields to keep
        #[arg(long)]
        select: Option<String>,
        /// Write the listing to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Emit the rule/artifact dependency graph in Graphviz DOT form
    Dot {
        /// Rule file defining the graph
        rule_file: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Brief,
    Json,
    Csv,
    CsvNoHead,
}

impl From<OutputFormat> for Format {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Brief => Format::Brief,
            OutputFormat::Json => Format::Json,
            OutputFormat::Csv => Format::Csv,
            OutputFormat::CsvNoHead => Format::CsvNoHead,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load().context("loading settings")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("ruleflow={}", settings.logging.level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let state_dir = cli.dir.unwrap_or_else(|| settings.state_dir.clone());

    match cli.command {
        Command::Run { rule_file } => {
            let stats = ruleflow::run_rules_in_file(&state_dir, &rule_file)?;
            println!("{stats}");
            if stats.failed_completions > 0 {
                bail!("{} rule application(s) failed", stats.failed_completions);
            }
        }
        Command::Ls {
            rule_file,
            filters,
            format,
            groupby,
            select,
            output,
        } => {
            let filters = parse_filters(&filters)?;
            let export = ruleflow::replay_and_export(&state_dir, &rule_file)?;

            let rows: Vec<tabular::Row> = export
                .artifacts
                .iter()
                .map(|artifact| tabular::artifact_row(artifact, &export.files))
                .collect();
            let mut rows = tabular::filter_rows(rows, &filters);
            if let Some(fields) = select {
                let fields: Vec<String> = fields.split(',').map(str::to_string).collect();
                rows = tabular::select(&rows, &fields);
            }
            let listing = tabular::render(&rows, format.into(), groupby.as_deref());

            match output {
                Some(path) => {
                    let mut file = std::fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    file.write_all(listing.as_bytes())?;
                }
                None => print!("{listing}"),
            }
        }
        Command::Dot { rule_file } => {
            let export = ruleflow::replay_and_export(&state_dir, &rule_file)?;
            print!("{}", export.graph.to_dot());
        }
    }
    Ok(())
}

fn parse_filters(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((name, value)) => Ok((name.to_string(), value.to_string())),
            None => bail!("filter {arg:?} is not of the form property=value"),
        })
        .collect()
}
