#![deny(unused_variables)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::error::Error;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process;

use ratecard::config::PipelineConfig;
use ratecard::fit::model::ModelRegistry;
use ratecard::pipeline::{ErrorKind, PipelineError, TrainingOutcome, TrainingPipeline};
use ratecard::prepare::schema::columns;
use ratecard::prepare::warehouse::CsvWarehouse;
use ratecard::serve::service::{Comparison, Prediction, RateService};
use ratecard::serve::similarity::Histogram;

#[derive(Parser)]
#[command(
    name = "ratecard",
    about = "Interest-rate prediction and applicant comparison for consumer lending",
    long_about = "Trains a cross-validated LASSO feature ranking and a small reduced model \
                  from a warehouse of historical loan applications, then predicts rates and \
                  compares new applicants against similar historical ones."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the offline pipeline and publish a model
    #[command(about = "Train and publish a model (outputs: model.toml, reference.tsv)")]
    Train(TrainArgs),

    /// Predict the interest rate for one applicant
    Predict(QueryArgs),

    /// Histogram of rates paid by the most similar historical applicants
    #[command(about = "Compare an applicant with similar historical ones (outputs: TSV histogram)")]
    Compare(CompareArgs),

    /// Answer predict + compare for applicants read from stdin until EOF
    Interactive(ModelArgs),

    /// Write the default configuration to a TOML file
    InitConfig {
        #[arg(value_name = "PATH", default_value = "ratecard.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Display version information
    Version,
}

#[derive(Args)]
struct TrainArgs {
    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory of table extracts, overriding [warehouse].root
    #[arg(long, value_name = "DIR")]
    warehouse: Option<PathBuf>,

    /// Table name, overriding [warehouse].table
    #[arg(long)]
    table: Option<String>,

    /// Model registry directory, overriding [artifact].registry
    #[arg(long, value_name = "DIR")]
    registry: Option<PathBuf>,

    /// Model name, overriding [artifact].name
    #[arg(long)]
    name: Option<String>,

    /// Version to publish as; the next free v<N> when omitted
    #[arg(long)]
    version: Option<String>,

    /// How many ranked features to print
    #[arg(long, default_value_t = 10)]
    top: usize,

    /// Hide the cross-validation progress bar
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct ModelArgs {
    #[arg(long, value_name = "DIR", default_value = "models")]
    registry: PathBuf,

    #[arg(long, default_value = "interest-rate")]
    name: String,

    /// Published version; the latest when omitted
    #[arg(long)]
    version: Option<String>,
}

#[derive(Args)]
struct QueryArgs {
    #[command(flatten)]
    model: ModelArgs,

    /// Loan term, e.g. "36" or "36 months"
    #[arg(long)]
    term: Option<String>,

    /// Aggregate credit utilization, e.g. "55" or "55%"
    #[arg(long)]
    all_util: Option<String>,

    /// Bank-card utilization
    #[arg(long)]
    bc_util: Option<String>,

    /// Bank-card open-to-buy amount
    #[arg(long)]
    bc_open_to_buy: Option<String>,

    /// Any other model input as NAME=VALUE (repeatable)
    #[arg(long = "value", value_name = "NAME=VALUE")]
    values: Vec<String>,
}

#[derive(Args)]
struct CompareArgs {
    #[command(flatten)]
    query: QueryArgs,

    /// Neighbourhood size; the model's default when omitted
    #[arg(long)]
    k: Option<usize>,

    /// Write the histogram here instead of stdout
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();
    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Predict(args)) => predict(args),
        Some(Commands::Compare(args)) => compare(args),
        Some(Commands::Interactive(args)) => interactive(args),
        Some(Commands::InitConfig { path, force }) => init_config(&path, force),
        Some(Commands::Version) => {
            println!("ratecard {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        let code = match e.downcast_ref::<PipelineError>().map(PipelineError::kind) {
            Some(ErrorKind::Configuration) => 2,
            Some(ErrorKind::InsufficientData) => 3,
            Some(ErrorKind::MissingValue) => 4,
            Some(ErrorKind::Numerical) => 5,
            Some(ErrorKind::Io) | None => 1,
        };
        process::exit(code);
    }
}

fn train(args: TrainArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load(path).map_err(PipelineError::from)?,
        None => PipelineConfig::default(),
    };
    if let Some(root) = args.warehouse {
        config.warehouse.root = root;
    }
    if let Some(table) = args.table {
        config.warehouse.table = table;
    }
    if let Some(registry) = args.registry {
        config.artifact.registry = registry;
    }
    if let Some(name) = args.name {
        config.artifact.name = name;
    }
    if let Some(version) = args.version {
        config.artifact.version = Some(version);
    }
    if args.quiet {
        config.selection.show_progress = false;
    }

    println!(
        "Training from table '{}' in {}",
        config.warehouse.table,
        config.warehouse.root.display()
    );
    let warehouse = CsvWarehouse::new(&config.warehouse.root)
        .with_separator(config.warehouse.separator as u8);
    let pipeline = TrainingPipeline::new(config)?;
    let outcome = pipeline.run(&warehouse)?;
    print_training_summary(&outcome, args.top);

    let artifact = &pipeline.config().artifact;
    let registry = ModelRegistry::new(&artifact.registry);
    let published = outcome.publish(&registry, &artifact.name, artifact.version.as_deref())?;
    println!(
        "Published '{}' version '{}' to {}",
        published.name,
        published.version,
        published.directory.display()
    );
    Ok(())
}

fn print_training_summary(outcome: &TrainingOutcome, top: usize) {
    let rows = &outcome.rows;
    println!(
        "Rows: {} fetched, {} labelled, {} train / {} test, {} used for selection, {} reference",
        rows.fetched, rows.labelled, rows.train, rows.test, rows.selection, rows.reference
    );

    println!("\nCross-validated penalty path ({} folds):", outcome.selection.folds);
    println!("{:>12}  {:>9}  {:>9}  {:>7}  {:>7}", "lambda", "rmse", "se", "r2", "nonzero");
    for m in outcome.selection.metrics.iter().rev() {
        println!(
            "{:>12.4e}  {:>9.4}  {:>9.4}  {:>7.4}  {:>7}",
            m.lambda, m.rmse, m.rmse_std_error, m.r_squared, m.nonzero
        );
    }
    if let Some(best) = outcome.selection.best_lambda() {
        println!("Best lambda: {best:.4e}");
    }
    if let Some(one_se) = outcome.selection.one_se_lambda() {
        println!("One-SE lambda: {one_se:.4e}");
    }
    for v in &outcome.selection.violations {
        println!(
            "WARNING: '{}' dropped at {:.4e} and reappeared at {:.4e}",
            v.feature, v.dropped_at, v.reappeared_at
        );
    }

    println!("\nFeature ranking (order of entry as lambda decreases):");
    for (i, rank) in outcome.selection.feature_ranking().iter().take(top).enumerate() {
        println!(
            "{:>3}. {:<28} enters at {:.4e} (coef {:+.4})",
            i + 1,
            rank.feature,
            rank.entry_lambda,
            rank.coefficient
        );
    }

    let (intercept, raw) = outcome.reduced.model.raw_coefficients();
    println!("\nReduced model ({}):", outcome.reduced.target);
    println!("  intercept {intercept:+.6}");
    for c in &raw {
        println!("  {:<28} {:+.6}", c.feature, c.coefficient);
    }
    println!(
        "Held-out: RMSE {:.4}, R^2 {:.4} over {} rows",
        outcome.holdout.rmse, outcome.holdout.r_squared, outcome.holdout.rows
    );
}

fn load_service(args: &ModelArgs) -> Result<RateService, Box<dyn Error>> {
    let registry = ModelRegistry::new(&args.registry);
    Ok(RateService::from_registry(
        &registry,
        &args.name,
        args.version.as_deref(),
    )?)
}

fn form_pairs(args: &QueryArgs) -> Result<Vec<(String, String)>, Box<dyn Error>> {
    let mut pairs = Vec::new();
    for (name, value) in [
        (columns::TERM, &args.term),
        (columns::ALL_UTIL, &args.all_util),
        (columns::BC_UTIL, &args.bc_util),
        (columns::BC_OPEN_TO_BUY, &args.bc_open_to_buy),
    ] {
        if let Some(value) = value {
            pairs.push((name.to_string(), value.clone()));
        }
    }
    for entry in &args.values {
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| format!("--value expects NAME=VALUE, got '{entry}'"))?;
        pairs.push((name.trim().to_string(), value.to_string()));
    }
    Ok(pairs)
}

fn parse_query(
    service: &RateService,
    args: &QueryArgs,
) -> Result<ratecard::serve::vector::ReducedFeatureVector, Box<dyn Error>> {
    let pairs = form_pairs(args)?;
    let form: Vec<(&str, &str)> = pairs
        .iter()
        .map(|(n, v)| (n.as_str(), v.as_str()))
        .collect();
    Ok(service.parse_form(&form)?)
}

fn predict(args: QueryArgs) -> Result<(), Box<dyn Error>> {
    let service = load_service(&args.model)?;
    let vector = parse_query(&service, &args)?;
    match service.predict(&vector) {
        Prediction::Available { predicted_rate } => {
            println!("predicted_rate\t{predicted_rate:.4}");
            Ok(())
        }
        Prediction::Unavailable { reason } => Err(reason.into()),
    }
}

fn write_histogram(histogram: &Histogram, output: Option<&Path>) -> Result<(), Box<dyn Error>> {
    match output {
        Some(path) => {
            histogram.write_tsv(std::fs::File::create(path)?)?;
            println!("Histogram written to {}", path.display());
        }
        None => histogram.write_tsv(io::stdout().lock())?,
    }
    Ok(())
}

fn compare(args: CompareArgs) -> Result<(), Box<dyn Error>> {
    let service = load_service(&args.query.model)?;
    let vector = parse_query(&service, &args.query)?;
    match service.compare(&vector, args.k) {
        Comparison::Available(histogram) => write_histogram(&histogram, args.output.as_deref()),
        Comparison::Unavailable { reason } => Err(reason.into()),
    }
}

fn interactive(args: ModelArgs) -> Result<(), Box<dyn Error>> {
    let service = load_service(&args)?;
    let features = service.features().to_vec();
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    let mut stdout = io::stdout();

    println!("Enter {} per applicant; end input to quit.", features.join(", "));
    'applicants: loop {
        let mut answers = Vec::with_capacity(features.len());
        for feature in &features {
            print!("{feature}: ");
            stdout.flush()?;
            match lines.next() {
                Some(line) => answers.push(line?),
                None => break 'applicants,
            }
        }
        let form: Vec<(&str, &str)> = features
            .iter()
            .zip(&answers)
            .map(|(f, a)| (f.as_str(), a.as_str()))
            .collect();
        let vector = match service.parse_form(&form) {
            Ok(vector) => vector,
            Err(e) => {
                println!("Cannot use this applicant: {e}");
                continue;
            }
        };
        match service.predict(&vector) {
            Prediction::Available { predicted_rate } => {
                println!("Predicted rate: {predicted_rate:.2}")
            }
            Prediction::Unavailable { reason } => println!("Prediction unavailable: {reason}"),
        }
        match service.compare(&vector, None) {
            Comparison::Available(histogram) => {
                println!(
                    "Rates of the {} most similar applicants:",
                    service.defaults().k
                );
                for bin in histogram.bins().filter(|b| b.count > 0) {
                    println!("  {:>6.2} - {:<6.2} {}", bin.lower, bin.upper, bin.count);
                }
            }
            Comparison::Unavailable { reason } => println!("Comparison unavailable: {reason}"),
        }
    }
    println!();
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<(), Box<dyn Error>> {
    if path.exists() && !force {
        return Err(format!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        )
        .into());
    }
    PipelineConfig::default().save(path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}
