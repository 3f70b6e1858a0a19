//! Benchmark and validation driver for the attention backward kernel.
//!
//! Usage:
//!   evoattn-bench run --batch 4 --heads 8 --queries 256 --keys 256
//!   evoattn-bench run --dtype f16 --bias both --json
//!   evoattn-bench validate --dtype bf16 --queries 100 --keys 70
//!   evoattn-bench workspace --dtype f16 --block-i 64 --block-j 64

use std::{error::Error, time::Instant};

use clap::{Args, Parser, Subcommand};
use evoattn_common::{BiasMode, DType};
use evoattn_kernel::{
    AttentionBackwardConfig, AttentionShape, LaunchReport,
    api::attention_backward_with_report,
    reference::reference_backward,
    problem::{OutputsData, ProblemData, ProblemDims, RefBackend},
    workspace_size,
};
use evoattn_tiles::element::Element;
use half::{bf16, f16};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "evoattn-bench", about = "Evoformer attention backward benchmark")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Time the kernel on random inputs.
    Run {
        #[command(flatten)]
        problem: ProblemArgs,

        #[arg(long, default_value = "1")]
        warmup: usize,

        #[arg(long, default_value = "3")]
        repeats: usize,

        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Compare the kernel against the unfused reference.
    Validate {
        #[command(flatten)]
        problem: ProblemArgs,

        #[arg(long, default_value = "false")]
        json: bool,
    },
    /// Print the workspace the launch would need.
    Workspace {
        #[command(flatten)]
        problem: ProblemArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct ProblemArgs {
    #[arg(long, default_value = "1")]
    batch: usize,

    #[arg(long, default_value = "4")]
    heads: usize,

    #[arg(long, default_value = "128")]
    queries: usize,

    #[arg(long, default_value = "128")]
    keys: usize,

    #[arg(long, default_value = "32")]
    head_dim: usize,

    /// Defaults to `head_dim`.
    #[arg(long)]
    head_dim_value: Option<usize>,

    /// Batches sharing one pair bias.
    #[arg(long, default_value = "1")]
    group_size: usize,

    #[arg(long, value_enum, default_value_t = DType::F32)]
    dtype: DType,

    #[arg(long, value_enum, default_value_t = BiasMode::None)]
    bias: BiasMode,

    /// Also compute the bias gradients.
    #[arg(long, default_value = "false")]
    bias_grads: bool,

    #[arg(long, default_value = "64")]
    block_i: usize,

    #[arg(long, default_value = "64")]
    block_j: usize,

    #[arg(long, default_value = "128")]
    max_head_dim: usize,

    #[arg(long, default_value = "0.0")]
    dropout: f32,

    #[arg(long, default_value = "0")]
    seed: u64,
}

impl ProblemArgs {
    fn dims(&self) -> ProblemDims {
        ProblemDims::new(self.batch, self.heads, self.queries, self.keys, self.head_dim)
            .with_value_dim(self.head_dim_value.unwrap_or(self.head_dim))
            .with_group_size(self.group_size)
    }

    fn config(&self) -> AttentionBackwardConfig {
        AttentionBackwardConfig::new()
            .with_block_i(self.block_i)
            .with_block_j(self.block_j)
            .with_max_head_dim(self.max_head_dim)
            .with_dropout_prob(self.dropout)
            .with_dropout_seed(self.seed)
            .with_dtype(self.dtype)
    }
}

#[derive(Serialize)]
struct BenchResult {
    dtype: DType,
    bias: BiasMode,
    shape: ShapeSummary,
    block_i: usize,
    block_j: usize,
    time_ms: f64,
    /// Attention scores processed per second.
    throughput: f64,
    report: LaunchReport,
}

#[derive(Serialize)]
struct ValidateResult {
    dtype: DType,
    bias: BiasMode,
    shape: ShapeSummary,
    max_abs_diff: Vec<(&'static str, f32)>,
}

#[derive(Serialize)]
struct ShapeSummary {
    batch: usize,
    heads: usize,
    num_queries: usize,
    num_keys: usize,
    head_dim: usize,
    head_dim_value: usize,
    group_size: usize,
}

impl From<AttentionShape> for ShapeSummary {
    fn from(s: AttentionShape) -> Self {
        Self {
            batch: s.batch,
            heads: s.heads,
            num_queries: s.num_queries,
            num_keys: s.num_keys,
            head_dim: s.head_dim,
            head_dim_value: s.head_dim_value,
            group_size: s.group_size,
        }
    }
}

fn bench<E: Element>(
    args: &ProblemArgs,
    warmup: usize,
    repeats: usize,
) -> Result<(f64, LaunchReport), Box<dyn Error>> {
    let device = Default::default();
    let config = args.config();
    let problem = ProblemData::random::<E>(args.dims(), args.bias, args.seed);
    let inputs = problem.inputs::<E, RefBackend>(&config, args.bias_grads, &device)?;

    for _ in 0..warmup {
        attention_backward_with_report(inputs.clone(), &config)?;
    }

    let mut total = 0.0;
    let mut report = None;
    for iteration in 0..repeats.max(1) {
        let start = Instant::now();
        let (_, r) = attention_backward_with_report(inputs.clone(), &config)?;
        let elapsed = start.elapsed().as_secs_f64();
        debug!(iteration, elapsed_ms = elapsed * 1000.0, "backward done");
        total += elapsed;
        report = Some(r);
    }
    let report = report.ok_or("no timed iteration")?;
    Ok((total / repeats.max(1) as f64 * 1000.0, report))
}

fn validate<E: Element>(args: &ProblemArgs) -> Result<Vec<(&'static str, f32)>, Box<dyn Error>> {
    let device = Default::default();
    let config = args.config();
    let problem = ProblemData::random::<E>(args.dims(), args.bias, args.seed);
    let inputs = problem.inputs::<E, RefBackend>(&config, args.bias_grads, &device)?;

    let (tested, _) = attention_backward_with_report(inputs.clone(), &config)?;
    let expected = reference_backward(inputs, &config)?;
    let tested = OutputsData::from_outputs(tested)?;
    let expected = OutputsData::from_outputs(expected)?;
    Ok(tested.max_abs_diff(&expected))
}

fn run(
    args: &ProblemArgs,
    warmup: usize,
    repeats: usize,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    info!(dtype = %args.dtype, bias = %args.bias, "benchmarking");
    let (time_ms, report) = match args.dtype {
        DType::F32 => bench::<f32>(args, warmup, repeats)?,
        DType::F16 => bench::<f16>(args, warmup, repeats)?,
        DType::BF16 => bench::<bf16>(args, warmup, repeats)?,
    };

    let shape = args.dims().shape();
    let scores = (shape.units() * shape.scores_per_head()) as f64;
    let result = BenchResult {
        dtype: args.dtype,
        bias: args.bias,
        shape: shape.into(),
        block_i: args.block_i,
        block_j: args.block_j,
        time_ms,
        throughput: scores / (time_ms / 1000.0),
        report,
    };

    if json {
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("Evoformer Attention Backward");
        println!("============================");
        println!("Dtype: {}, Bias: {}", args.dtype, args.bias);
        println!(
            "Batch: {}, Heads: {}, Queries: {}, Keys: {}, Head dim: {}",
            shape.batch, shape.heads, shape.num_queries, shape.num_keys, shape.head_dim
        );
        println!(
            "Tiles: {}x{}, Registers: {}, Units: {}, Groups: {}",
            args.block_i,
            args.block_j,
            result.report.plan.output_in_registers,
            result.report.units,
            result.report.groups
        );
        println!("Workspace: {} bytes", result.report.workspace_bytes);
        println!();
        println!("Time: {time_ms:.2} ms");
        println!("Throughput: {:.0} scores/s", result.throughput);
    }
    Ok(())
}

fn run_validate(args: &ProblemArgs, json: bool) -> Result<(), Box<dyn Error>> {
    let diffs = match args.dtype {
        DType::F32 => validate::<f32>(args)?,
        DType::F16 => validate::<f16>(args)?,
        DType::BF16 => validate::<bf16>(args)?,
    };

    if json {
        let result = ValidateResult {
            dtype: args.dtype,
            bias: args.bias,
            shape: args.dims().shape().into(),
            max_abs_diff: diffs,
        };
        println!("{}", serde_json::to_string(&result)?);
    } else {
        println!("Max abs diff vs reference ({}):", args.dtype);
        for (name, diff) in diffs {
            println!("  {name:<12} {diff:.3e}");
        }
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Command::Run {
            problem,
            warmup,
            repeats,
            json,
        } => run(&problem, warmup, repeats, json),
        Command::Validate { problem, json } => run_validate(&problem, json),
        Command::Workspace { problem } => {
            let bytes = workspace_size(&problem.config(), &problem.dims().shape());
            println!("{bytes}");
            Ok(())
        }
    }
}
