mod diagnostic_format;

use clap::{Args, Parser, Subcommand};
use hostembed_core::{
    checkpoint, gradcheck_serialized_lookup, lookup, Coordinator, DeviceConfig, EmbeddingError,
    EmbeddingTable, HostStore, IndexBatch, Initializer, LookupOptions, OptimizerSpec,
    PartitionStrategy, Result, SeededRng, Tensor,
};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "hostembed_cli",
    version,
    about = "Host-resident embedding tables with serialized lookup"
)]
struct Cli {
    /// Device configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "hostembed_core=debug" (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Look up ids in a demo table whose row i is filled with i
    Lookup(LookupArgs),
    /// Train a host-resident table towards random targets with SGD
    Train(TrainArgs),
    /// Finite-difference check of the serialized lookup gradient
    Gradcheck(GradcheckArgs),
    /// Print and verify a checkpoint directory
    Inspect { dir: PathBuf },
}

#[derive(Args, Debug)]
struct LookupArgs {
    #[arg(long, default_value_t = 8)]
    rows: usize,
    #[arg(long, default_value_t = 2)]
    width: usize,
    /// Serialization factor; defaults to the config's choice for `rows`
    #[arg(long)]
    factor: Option<usize>,
    #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
    ids: Vec<i64>,
    /// Shape of the id batch; defaults to a flat batch
    #[arg(long, value_delimiter = ',')]
    shape: Option<Vec<usize>>,
    /// Reject out-of-range ids instead of clipping them
    #[arg(long)]
    no_clip: bool,
}

#[derive(Args, Debug)]
struct TrainArgs {
    #[arg(long, default_value_t = 16)]
    rows: usize,
    #[arg(long, default_value_t = 4)]
    width: usize,
    #[arg(long, default_value_t = 100)]
    steps: usize,
    #[arg(long, default_value_t = 2.0)]
    learning_rate: f32,
    #[arg(long, default_value_t = 8)]
    batch: usize,
    #[arg(long, default_value = "TOKEN")]
    strategy: String,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    /// Write the trained table to this checkpoint directory
    #[arg(long)]
    save: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct GradcheckArgs {
    #[arg(long, default_value_t = 8)]
    rows: usize,
    #[arg(long, default_value_t = 3)]
    width: usize,
    #[arg(long, default_value_t = 4)]
    factor: usize,
    #[arg(long, value_delimiter = ',', default_value = "0,3,3,7,5")]
    ids: Vec<i64>,
}

fn init_tracing(log_level: Option<&str>) {
    let filter = match log_level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn format_rows(rows: &[f32], width: usize) -> Vec<String> {
    rows.chunks(width.max(1))
        .map(|row| {
            let cells: Vec<String> = row.iter().map(|v| format!("{}", v)).collect();
            format!("[{}]", cells.join(", "))
        })
        .collect()
}

fn lookup_demo(config: &DeviceConfig, args: &LookupArgs) -> Result<()> {
    let values: Vec<f32> = (0..args.rows)
        .flat_map(|r| std::iter::repeat(r as f32).take(args.width))
        .collect();
    let table = EmbeddingTable::new(
        "demo",
        &[args.rows, args.width],
        "f32",
        &Initializer::Values { values },
    )?;

    let factor = match args.factor {
        Some(factor) => factor,
        None => config.pick_serialization_factor(args.rows)?,
    };
    let ids = match &args.shape {
        Some(shape) => IndexBatch::new(shape, args.ids.clone())?,
        None => IndexBatch::flat(args.ids.clone()),
    };
    let options = LookupOptions {
        serialization_factor: factor,
        clip_indices: config.clip_indices && !args.no_clip,
    };

    let out = lookup(&table, &ids, &options)?;
    println!("Table: {}", table.signature());
    println!("Serialization factor: {}", factor);
    println!("Ids: {:?} (shape {:?})", ids.data, ids.shape());
    println!("Output shape: {:?}", out.shape());
    for (id, row) in ids.data.iter().zip(format_rows(&out.to_vec(), args.width)) {
        println!("  {} -> {}", id, row);
    }
    println!("✓ LOOKUP OK");
    Ok(())
}

fn train_demo(config: &DeviceConfig, args: &TrainArgs) -> Result<()> {
    let strategy: PartitionStrategy = args.strategy.parse()?;
    let optimizer = OptimizerSpec::sgd(args.learning_rate)?;
    let mut coordinator = Coordinator::new(HostStore::new(config.replicas));
    let handle = coordinator.create_host_embedding(
        "train",
        &[args.rows, args.width],
        "f32",
        strategy,
        Some(optimizer),
        Some(&Initializer::Normal {
            mean: 0.0,
            std: 0.1,
            seed: args.seed,
        }),
    )?;

    let mut rng = SeededRng::new(args.seed ^ 0x5eed);
    let targets = Array2::from_shape_fn((args.rows, args.width), |_| rng.gen_range(-1.0, 1.0));
    let options = LookupOptions {
        clip_indices: config.clip_indices,
        ..LookupOptions::default()
    };

    println!("Training host embedding {} with {}", handle.name(), strategy);
    println!("Loss = mean((lookup(ids) - target[ids])^2)");
    println!("Seed: {}\n", args.seed);

    let mut final_loss = 0.0;
    for step in 0..args.steps {
        let ids: Vec<i64> = (0..args.batch)
            .map(|_| rng.gen_index(args.rows) as i64)
            .collect();
        let batch = IndexBatch::flat(ids.clone());
        let out = coordinator.lookup(&handle, &batch, &options)?;
        let rows = out.rows_view()?;

        let mut grad = Array2::<f32>::zeros((ids.len(), args.width));
        let mut loss = 0.0;
        let scale = 1.0 / (ids.len() * args.width) as f32;
        for (i, &id) in ids.iter().enumerate() {
            for c in 0..args.width {
                let diff = rows[[i, c]] - targets[[id as usize, c]];
                loss += diff * diff * scale;
                grad[[i, c]] = 2.0 * diff * scale;
            }
        }
        coordinator.apply_gradients(&handle, &batch, &Tensor::from_rows(grad), &options)?;

        if step < 5 || step % 20 == 0 || step + 1 == args.steps {
            println!("Step {}: loss = {:.6}", step, loss);
        }
        final_loss = loss;
    }
    println!("\nFinal loss: {:.6}", final_loss);
    tracing::info!(steps = args.steps, final_loss, "training finished");

    if let Some(dir) = &args.save {
        let manifest = coordinator.channel().save(dir)?;
        println!("Saved checkpoint to {} (sha256 {})", dir.display(), manifest.weights_sha256);
    }
    Ok(())
}

fn gradcheck_demo(args: &GradcheckArgs) -> Result<()> {
    println!("Running gradient check...");
    let report = gradcheck_serialized_lookup(args.rows, args.width, args.factor, &args.ids)?;
    println!(
        "checked {} elements: max numeric error {:.6}, max autodiff error {:.6}",
        report.checked, report.max_numeric_error, report.max_autodiff_error
    );
    if report.passed {
        println!("✓ GRADCHECK PASSED");
        Ok(())
    } else {
        println!("✗ GRADCHECK FAILED");
        Err(EmbeddingError::argument(
            "gradcheck",
            format!(
                "max error {:.6} exceeds tolerance",
                report.max_numeric_error.max(report.max_autodiff_error)
            ),
        ))
    }
}

fn inspect_checkpoint(dir: &Path) -> Result<()> {
    let manifest = checkpoint::read_manifest(dir)?;
    println!("Checkpoint {} (version {})", dir.display(), manifest.version);
    println!("weights sha256: {}", manifest.weights_sha256);
    let tables = checkpoint::load_tables(dir)?;
    for (descriptor, table) in &tables {
        println!("  {}  digest {}", descriptor.signature(), checkpoint::table_digest(table));
    }
    println!("✓ CHECKPOINT OK ({} tables)", tables.len());
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    let config = match DeviceConfig::load_or_default(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => diagnostic_format::fail(&err),
    };

    let result = match &cli.command {
        Command::Lookup(args) => lookup_demo(&config, args),
        Command::Train(args) => train_demo(&config, args),
        Command::Gradcheck(args) => gradcheck_demo(args),
        Command::Inspect { dir } => inspect_checkpoint(dir),
    };
    if let Err(err) = result {
        diagnostic_format::fail(&err);
    }
}
