use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use quantgate::{
    calibration::{self, CalibrationDataset, CalibrationSource},
    compare::{compare_outputs, ComparisonReport},
    compile::{self, compile_model},
    descriptor::Dtype,
    dump,
    simulate::{validate_inputs, ArtifactSimulator},
    CalibrateMethod, CanonicalGraph, CompileConfig, CompiledArtifact, FineTunePolicy, Layout,
    NamedTensor, PreprocessSpec, QdqBackend, QuantConfig, ReferenceExecutor,
};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a model's I/O contract and graph summary.
    Inspect {
        /// Path to the ONNX model.
        #[arg(short, long, env)]
        model: PathBuf,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Calibrate a model and compile it into a quantized artifact.
    Compile(CompileArgs),

    /// Execute a compiled artifact on one image and dump its tensors.
    Simulate {
        /// Path to the compiled artifact.
        #[arg(short, long, env)]
        artifact: PathBuf,

        /// Image to feed, resized to the artifact's input contract.
        #[arg(short, long, env)]
        image: PathBuf,

        /// Directory receiving the input and output tensor dumps.
        #[arg(short, long, env)]
        dump_dir: PathBuf,
    },

    /// Score previously dumped artifact outputs against the float reference.
    Compare {
        /// Path to the ONNX model the artifact was compiled from.
        #[arg(short, long, env)]
        model: PathBuf,

        /// Path to the compiled artifact.
        #[arg(short, long, env)]
        artifact: PathBuf,

        /// Directory holding the dumps a simulate run left behind.
        #[arg(short, long, env)]
        dump_dir: PathBuf,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Compile, simulate and compare in one go.
    Run {
        #[command(flatten)]
        compile: CompileArgs,

        /// Image to feed, resized to the artifact's input contract.
        #[arg(short, long, env)]
        image: PathBuf,

        /// Directory receiving the input and output tensor dumps.
        #[arg(short, long, env)]
        dump_dir: PathBuf,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

#[derive(clap::Args)]
struct CompileArgs {
    /// Path to the ONNX model.
    #[arg(short, long, env)]
    model: PathBuf,

    /// Where to write the compiled artifact.
    #[arg(short, long, env)]
    output: PathBuf,

    /// Backend target id.
    #[arg(short, long, env, default_value = QdqBackend::TARGET)]
    target: String,

    /// Concrete input shape (e.g. 1,3,320,320).
    #[arg(long, env, value_delimiter = ',', default_value = "1,3,320,320")]
    input_shape: Vec<usize>,

    /// Bake preprocessing into the artifact with this raw input dtype.
    /// Without it, inputs go to the graph untouched.
    #[arg(long, env, value_enum)]
    input_type: Option<RawInputType>,

    /// Raw input value range, two comma-separated bounds.
    #[arg(long, env, value_delimiter = ',', default_value = "0,255")]
    input_range: Vec<f32>,

    /// Per-channel mean subtracted during preprocessing.
    #[arg(long, env, value_delimiter = ',', default_value = "0,0,0")]
    mean: Vec<f32>,

    /// Per-channel divisor applied during preprocessing.
    #[arg(long, env, value_delimiter = ',', default_value = "1,1,1")]
    std: Vec<f32>,

    /// Layout of raw inputs.
    #[arg(long, env, value_enum, default_value = "nchw")]
    input_layout: Layout,

    /// Layout of artifact outputs.
    #[arg(long, env, value_enum, default_value = "nchw")]
    output_layout: Layout,

    /// Activation bit-width.
    #[arg(long, env, default_value_t = 8)]
    activation_bits: u32,

    /// Weight bit-width.
    #[arg(long, env, default_value_t = 8)]
    weight_bits: u32,

    /// Calibration method.
    #[arg(long, env, value_enum, default_value = "kld")]
    method: CalibrateMethod,

    /// Weight fine-tuning policy.
    #[arg(long, env, value_enum, default_value = "no-fine-tune")]
    finetune: FineTunePolicy,

    /// Directory of calibration images. Omitted, calibration falls back to
    /// synthetic samples drawn from the input range.
    #[arg(long, env)]
    calib_dir: Option<PathBuf>,

    /// Declared calibration sample count, must match the dataset.
    #[arg(long, env, default_value_t = 3)]
    samples_count: usize,
}

/// Raw dtypes an artifact boundary can accept.
#[derive(Clone, Copy, ValueEnum)]
enum RawInputType {
    U8,
    F32,
}

impl RawInputType {
    fn dtype(self) -> Dtype {
        match self {
            Self::U8 => Dtype::U8,
            Self::F32 => Dtype::F32,
        }
    }
}

impl CompileArgs {
    fn preprocess(&self) -> anyhow::Result<Option<PreprocessSpec>> {
        let Some(input_type) = self.input_type else {
            return Ok(None);
        };
        let &[lo, hi] = self.input_range.as_slice() else {
            anyhow::bail!("--input-range takes exactly two values, lo,hi");
        };
        Ok(Some(PreprocessSpec {
            input_dtype: input_type.dtype(),
            input_range: (lo, hi),
            mean: self.mean.clone(),
            std: self.std.clone(),
            layout: self.input_layout,
        }))
    }
}

fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .compact()
        .with_level(true)
        .with_file(false)
        .with_line_number(false)
        .with_target(false)
        .without_time()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Setting up logging failed")?;

    match Args::parse().command {
        Command::Inspect { model, json } => inspect(&model, json),
        Command::Compile(args) => {
            let graph = load_graph(&args.model, &[args.input_shape.clone()])?;
            compile_cmd(&graph, &args)?;
            Ok(())
        }
        Command::Simulate {
            artifact,
            image,
            dump_dir,
        } => {
            let artifact = CompiledArtifact::read(&artifact)?;
            simulate_cmd(&artifact, &image, &dump_dir)?;
            Ok(())
        }
        Command::Compare {
            model,
            artifact,
            dump_dir,
            json,
        } => {
            let artifact = CompiledArtifact::read(&artifact)?;
            let graph = load_graph(&model, &envelope_shapes(&artifact)?)?;
            let report = compare_cmd(&graph, &artifact, &dump_dir)?;
            print_report(&report, json)
        }
        Command::Run {
            compile,
            image,
            dump_dir,
            json,
        } => {
            let graph = load_graph(&compile.model, &[compile.input_shape.clone()])?;
            let artifact = compile_cmd(&graph, &compile)?;
            simulate_cmd(&artifact, &image, &dump_dir)?;
            let report = compare_cmd(&graph, &artifact, &dump_dir)?;
            print_report(&report, json)
        }
    }
}

fn load_graph(model: &Path, input_shapes: &[Vec<usize>]) -> anyhow::Result<CanonicalGraph> {
    let bytes =
        std::fs::read(model).with_context(|| format!("reading model {}", model.display()))?;
    info!("loaded {} ({} bytes)", model.display(), bytes.len());
    Ok(CanonicalGraph::new(bytes, input_shapes)?)
}

fn resolve_backend(target: &str) -> anyhow::Result<QdqBackend> {
    match target {
        QdqBackend::TARGET => Ok(QdqBackend),
        other => anyhow::bail!("unknown target {other}, available: {}", QdqBackend::TARGET),
    }
}

fn inspect(model: &Path, json: bool) -> anyhow::Result<()> {
    let bytes =
        std::fs::read(model).with_context(|| format!("reading model {}", model.display()))?;
    let (descriptor, summary) = quantgate::inspect(&bytes)?;

    if json {
        let report = serde_json::json!({
            "summary": summary,
            "io": descriptor,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    println!(
        "{} (ir {}, opset {}, producer {}, {} nodes)",
        model.display(),
        summary.ir_version,
        summary.opset,
        if summary.producer.is_empty() {
            "unknown"
        } else {
            summary.producer.as_str()
        },
        summary.node_count
    );
    for input in descriptor.inputs() {
        println!("  input  {:<24} {} {}", input.name(), input.dtype(), input.shape_string());
    }
    for output in descriptor.outputs() {
        println!("  output {:<24} {} {}", output.name(), output.dtype(), output.shape_string());
    }
    Ok(())
}

fn compile_cmd(graph: &CanonicalGraph, args: &CompileArgs) -> anyhow::Result<CompiledArtifact> {
    let backend = resolve_backend(&args.target)?;
    let config = CompileConfig {
        target: args.target.clone(),
        input_shapes: vec![args.input_shape.clone()],
        preprocess: args.preprocess()?,
        output_layout: args.output_layout,
    };
    let quant = QuantConfig {
        activation_bits: args.activation_bits,
        weight_bits: args.weight_bits,
        method: args.method,
        finetune: args.finetune,
        samples_count: args.samples_count,
    };

    let contract = compile::input_contract(&config, graph)?;
    let source = match &args.calib_dir {
        Some(dir) => CalibrationSource::ImageDir(dir.clone()),
        None => CalibrationSource::Synthetic {
            count: args.samples_count,
        },
    };
    let dataset = CalibrationDataset::build(&source, &contract, &mut rand::thread_rng())
        .context("building the calibration dataset")?;

    let artifact = compile_model(&backend, graph, &config, &quant, &dataset)?;
    artifact.write(&args.output)?;
    Ok(artifact)
}

fn simulate_cmd(
    artifact: &CompiledArtifact,
    image: &Path,
    dump_dir: &Path,
) -> anyhow::Result<()> {
    let backend = resolve_backend(&artifact.target)?;
    let loaded = backend.load(artifact)?;
    let contract = artifact.input_contract()?;
    let raw = calibration::load_image(image, &contract)
        .with_context(|| format!("loading {}", image.display()))?;

    let result = loaded.run(&[raw.clone()])?;
    let input_name = artifact
        .io
        .input(0)
        .map(|i| i.name().to_string())
        .unwrap_or_else(|| "input".into());
    dump::write_input(dump_dir, &NamedTensor::new(input_name, raw))?;
    dump::write_outputs(dump_dir, &result)?;
    info!("simulation done, tensors in {}", dump_dir.display());
    Ok(())
}

fn compare_cmd(
    graph: &CanonicalGraph,
    artifact: &CompiledArtifact,
    dump_dir: &Path,
) -> anyhow::Result<ComparisonReport> {
    let raw = dump::read_input(dump_dir)?;
    validate_inputs(artifact.io.inputs(), std::slice::from_ref(&raw.value))?;

    let reference = ReferenceExecutor::new(graph)?;
    let expected = reference.infer(
        std::slice::from_ref(&raw.value),
        artifact.preprocess.as_ref(),
    )?;
    let dumped = dump::read_outputs(dump_dir, artifact.io.outputs())?;
    Ok(compare_outputs(&expected, &dumped)?)
}

fn envelope_shapes(artifact: &CompiledArtifact) -> anyhow::Result<Vec<Vec<usize>>> {
    artifact
        .io
        .inputs()
        .iter()
        .map(|input| {
            input.concrete_shape().with_context(|| {
                format!("artifact input {} is not concrete", input.name())
            })
        })
        .collect()
}

fn print_report(report: &ComparisonReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report.render());
    }
    Ok(())
}
