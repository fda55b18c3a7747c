#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;

use npc_harness::config::{load_config_from_path, HarnessConfig};
use npc_harness::consistency::CombinerRegistry;
use npc_harness::coverage::{coverage, render_coverage_csv, render_coverage_markdown};
use npc_harness::dataset::{load_dataset_from_path, Dataset};
use npc_harness::evaluation::{
    barplot_series, csv_field, performance_rows, render_evaluation_markdown,
    render_time_requirements_csv, time_requirements, write_barplot_series, write_performance_csv,
    CentroidAdapter, EvaluationDriver, EvaluationObserver, JsonlUnitObserver, RunStamp,
};
use npc_harness::features::FeatureSettings;
use npc_harness::hierarchy::{
    load_hierarchy_from_path, write_hierarchy_to_path, HierarchyGraph, Layer,
};
use npc_harness::split::StratifiedSplitPlanner;

#[derive(Parser)]
#[command(name = "npc", version, about = "Natural-product classifier harness")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report how much of the label hierarchy a dataset covers
    DagCoverage {
        #[arg(long)]
        dataset: PathBuf,
        /// Hierarchy JSON; derived from the dataset labels when omitted
        #[arg(long)]
        hierarchy: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = TableFormat::Md)]
        format: TableFormat,
        /// Write the table here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compare feature sets over nested holdouts, then on the test split
    FeatureSetsEvaluation(EvaluationArgs),
    /// Write label distribution tables for an external plotting tool
    Visualize {
        #[arg(long)]
        dataset: PathBuf,
        #[arg(long)]
        output_directory: PathBuf,
        #[arg(long, default_value = "png")]
        image_format: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum TableFormat {
    Csv,
    Md,
}

#[derive(Args)]
struct EvaluationArgs {
    #[arg(long)]
    dataset: PathBuf,
    #[arg(long)]
    hierarchy: Option<PathBuf>,
    /// JSON run configuration; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    holdouts: Option<usize>,
    #[arg(long)]
    test_size: Option<f64>,
    #[arg(long)]
    validation_size: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    concurrency: Option<usize>,
    /// Path score combiner (product, geometric_mean, arithmetic_mean, minimum)
    #[arg(long)]
    combiner: Option<String>,
    #[arg(long, default_value = "performance.csv")]
    performance_path: PathBuf,
    #[arg(long, default_value = "training")]
    training_directory: PathBuf,
    #[arg(long, default_value = "barplots")]
    barplot_directory: PathBuf,
    /// One JSON line per finished unit
    #[arg(long)]
    trace: Option<PathBuf>,
    #[command(flatten)]
    include: IncludeFlags,
    /// Include every cataloged fingerprint family
    #[arg(long)]
    include_all: bool,
    /// Include a dataset feature set by name, cataloged or not
    #[arg(long = "include-feature")]
    include_feature: Vec<String>,
}

#[derive(Args, Default)]
struct IncludeFlags {
    #[arg(long)]
    include_autocorrelation: bool,
    #[arg(long)]
    include_atom_pair: bool,
    #[arg(long)]
    include_avalon: bool,
    #[arg(long)]
    include_extended_connectivity: bool,
    #[arg(long)]
    include_functional_groups: bool,
    #[arg(long)]
    include_ghose_crippen: bool,
    #[arg(long)]
    include_laggner: bool,
    #[arg(long)]
    include_layered: bool,
    #[arg(long)]
    include_lingo: bool,
    #[arg(long)]
    include_maccs: bool,
    #[arg(long)]
    include_minhashed: bool,
    #[arg(long)]
    include_minhashed_atom_pair: bool,
    #[arg(long)]
    include_molecular_quantum_numbers: bool,
    #[arg(long)]
    include_pattern: bool,
    #[arg(long)]
    include_pubchem: bool,
    #[arg(long)]
    include_rdkit: bool,
    #[arg(long)]
    include_smiles_extended_connectivity: bool,
    #[arg(long)]
    include_topological_torsion: bool,
    #[arg(long)]
    include_van_der_waals_surface_area: bool,
}

impl IncludeFlags {
    fn selected(&self) -> Vec<&'static str> {
        [
            ("autocorrelation", self.include_autocorrelation),
            ("atom_pair", self.include_atom_pair),
            ("avalon", self.include_avalon),
            ("extended_connectivity", self.include_extended_connectivity),
            ("functional_groups", self.include_functional_groups),
            ("ghose_crippen", self.include_ghose_crippen),
            ("laggner", self.include_laggner),
            ("layered", self.include_layered),
            ("lingo", self.include_lingo),
            ("maccs", self.include_maccs),
            ("minhashed", self.include_minhashed),
            ("minhashed_atom_pair", self.include_minhashed_atom_pair),
            ("molecular_quantum_numbers", self.include_molecular_quantum_numbers),
            ("pattern", self.include_pattern),
            ("pubchem", self.include_pubchem),
            ("rdkit", self.include_rdkit),
            (
                "smiles_extended_connectivity",
                self.include_smiles_extended_connectivity,
            ),
            ("topological_torsion", self.include_topological_torsion),
            (
                "van_der_waals_surface_area",
                self.include_van_der_waals_surface_area,
            ),
        ]
        .into_iter()
        .filter_map(|(name, on)| on.then_some(name))
        .collect()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::DagCoverage {
            dataset,
            hierarchy,
            format,
            out,
        } => {
            let dataset = load_dataset_from_path(&dataset)?;
            let graph = load_or_derive_hierarchy(hierarchy.as_deref(), &dataset)?;
            let report = coverage(&graph, &dataset);
            let rendered = match format {
                TableFormat::Csv => render_coverage_csv(&report),
                TableFormat::Md => render_coverage_markdown(&report),
            };
            match out {
                Some(path) => std::fs::write(path, rendered)?,
                None => print!("{rendered}"),
            }
        }
        Commands::FeatureSetsEvaluation(args) => run_evaluation(args).await?,
        Commands::Visualize {
            dataset,
            output_directory,
            image_format,
        } => {
            let dataset = load_dataset_from_path(&dataset)?;
            write_label_distributions(&dataset, &output_directory, &image_format)?;
        }
    }

    Ok(())
}

fn load_or_derive_hierarchy(
    path: Option<&Path>,
    dataset: &Dataset,
) -> Result<HierarchyGraph, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(load_hierarchy_from_path(path)?),
        None => {
            tracing::info!("no hierarchy given; deriving it from the dataset labels");
            Ok(dataset.derive_hierarchy()?)
        }
    }
}

async fn run_evaluation(args: EvaluationArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)?,
        None => HarnessConfig::default(),
    };
    if let Some(holdouts) = args.holdouts {
        config.split.holdouts = holdouts;
    }
    if let Some(test_size) = args.test_size {
        config.split.test_size = test_size;
    }
    if let Some(validation_size) = args.validation_size {
        config.split.validation_size = validation_size;
    }
    if let Some(seed) = args.seed {
        config.split.seed = seed;
    }
    if let Some(concurrency) = args.concurrency {
        config.evaluation.concurrency = concurrency;
    }
    if let Some(combiner) = &args.combiner {
        config.evaluation.combiner = combiner.clone();
    }
    config.validate()?;

    let mut settings = config.feature_settings()?;
    for name in args.include.selected() {
        settings = settings.include(name)?;
    }
    if args.include_all {
        settings = settings.include_all();
    }
    let feature_sets = selected_feature_sets(&settings, &args.include_feature);
    if feature_sets.is_empty() {
        return Err("no feature sets selected; pass --include-<feature-set>, --include-feature or --include-all".into());
    }

    let dataset = Arc::new(load_dataset_from_path(&args.dataset)?);
    let graph = Arc::new(load_or_derive_hierarchy(args.hierarchy.as_deref(), &dataset)?);
    let assignment = Arc::new(StratifiedSplitPlanner::new(config.split)?.plan(&dataset)?);
    let options = config.evaluation_options(&CombinerRegistry::default())?;
    let combiner_name = config.evaluation.combiner.clone();

    std::fs::create_dir_all(&args.training_directory)?;
    write_hierarchy_to_path(&graph, args.training_directory.join("hierarchy.json"))?;
    std::fs::write(
        args.training_directory.join("split.json"),
        serde_json::to_string_pretty(assignment.as_ref())?,
    )?;

    let driver = EvaluationDriver::new(
        Arc::new(CentroidAdapter),
        graph,
        dataset,
        Arc::clone(&assignment),
        options,
    );
    let stamp = RunStamp::new(
        config.split.seed,
        driver.split_fingerprint(),
        driver.adapter_name(),
        combiner_name,
    );
    tracing::info!(
        run_id = %stamp.run_id,
        feature_sets = ?feature_sets,
        split = %stamp.split_fingerprint,
        "feature-set evaluation"
    );

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; finishing running units");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let (trace_sink, trace_worker) = match &args.trace {
        Some(path) => {
            let (sink, worker) = JsonlUnitObserver::new(path)?;
            (Some(sink), Some(worker))
        }
        None => (None, None),
    };
    let observer = trace_sink.as_ref().map(|s| s as &dyn EvaluationObserver);

    let sweep = driver
        .evaluate_holdouts(&feature_sets, observer, Some(cancel.as_ref()))
        .await?;
    std::fs::write(
        args.training_directory.join("holdouts.json"),
        serde_json::to_string_pretty(&sweep)?,
    )?;
    std::fs::write(
        args.training_directory.join("time_requirements.csv"),
        render_time_requirements_csv(&time_requirements(&sweep)),
    )?;

    let report = driver.evaluate_test_with_observer(sweep, observer).await?;

    drop(trace_sink);
    if let Some(worker) = trace_worker {
        worker.join()?;
    }

    let rows = performance_rows(&report);
    write_performance_csv(&args.performance_path, &rows)?;
    let written = write_barplot_series(&args.barplot_directory, &barplot_series(&rows))?;
    std::fs::write(
        args.training_directory.join("report.md"),
        render_evaluation_markdown(&report, &stamp),
    )?;
    std::fs::write(
        args.training_directory.join("run.json"),
        serde_json::to_string_pretty(&stamp)?,
    )?;

    println!(
        "wrote {} performance rows to {} and {} barplot tables to {}",
        rows.len(),
        args.performance_path.display(),
        written.len(),
        args.barplot_directory.display()
    );
    let failed = report.sweep.failures().len() + report.test_failures.len();
    if failed > 0 {
        eprintln!("{failed} units failed; see report.md");
    }
    Ok(())
}

/// Catalog flags in catalog order, then extra dataset feature sets as given.
fn selected_feature_sets(settings: &FeatureSettings, extra: &[String]) -> Vec<String> {
    let mut selected: Vec<String> = settings.iter_included().map(str::to_string).collect();
    for name in extra {
        if !selected.contains(name) {
            selected.push(name.clone());
        }
    }
    selected
}

#[derive(Serialize)]
struct VisualizationManifest<'a> {
    dataset: &'a str,
    samples: usize,
    image_format: &'a str,
    generated_at: chrono::DateTime<chrono::Utc>,
    tables: Vec<String>,
}

fn write_label_distributions(
    dataset: &Dataset,
    directory: &Path,
    image_format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(directory)?;
    let support = dataset.label_support();
    let mut tables = Vec::new();
    for layer in Layer::ALL {
        let mut counts: Vec<(&str, usize)> = support
            .iter()
            .filter(|((l, _), _)| *l == layer)
            .map(|((_, label), count)| (*label, *count))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let mut out = String::from("label,samples\n");
        for (label, count) in &counts {
            out.push_str(&format!("{},{count}\n", csv_field(label)));
        }
        let file_name = format!("{}_distribution.csv", layer.plural());
        std::fs::write(directory.join(&file_name), out)?;
        tables.push(file_name);
    }

    let unlabeled: BTreeMap<&str, usize> = Layer::ALL
        .iter()
        .map(|&layer| {
            let missing = dataset
                .samples
                .iter()
                .filter(|s| s.labels[layer].is_empty())
                .count();
            (layer.plural(), missing)
        })
        .collect();
    tracing::info!(?unlabeled, "samples without labels per layer");

    let manifest = VisualizationManifest {
        dataset: &dataset.name,
        samples: dataset.len(),
        image_format,
        generated_at: chrono::Utc::now(),
        tables,
    };
    std::fs::write(
        directory.join("manifest.json"),
        serde_json::to_string_pretty(&manifest)?,
    )?;
    println!("wrote label distributions to {}", directory.display());
    Ok(())
}
