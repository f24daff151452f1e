use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Local;
use clap::Parser;
use tracing::{error, info, warn};

use nano_parallel::config::{RunConfig, DEFAULT_SYSTEM_PROMPT};
use nano_parallel::engine::{resolve_model, CandleEngine, Engine, HfTokenizer, Sampler};
use nano_parallel::io::{load_prompts, write_results, OutputFormat};
use nano_parallel::logging::{self, LogFormat};
use nano_parallel::{run_parallel, Result, RunReport};

#[derive(Parser, Debug)]
#[command(name = "nano-parallel")]
#[command(about = "Serve many simulated clients from one model with continuous batching")]
struct Args {
    /// Model directory or HuggingFace model ID
    #[arg(short, long)]
    model: Option<String>,

    /// Hub revision
    #[arg(long)]
    revision: Option<String>,

    /// Input file with prompts, one per line
    #[arg(short = 'f', long = "file")]
    prompt_file: PathBuf,

    /// Save results to this file
    #[arg(short = 'o', long = "output-file")]
    output_file: Option<PathBuf>,

    /// Result file format: text or json
    #[arg(long, default_value = "text")]
    output_format: String,

    /// JSON run configuration; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// File with a custom system prompt
    #[arg(long)]
    system_file: Option<PathBuf>,

    /// Number of concurrent clients
    #[arg(long = "n-parallel", visible_alias = "np")]
    n_parallel: Option<usize>,

    /// Maximum number of prompts to process
    #[arg(long = "n-sequences", visible_alias = "ns")]
    n_sequences: Option<usize>,

    /// Admit new prompts while other clients are generating
    #[arg(long, conflicts_with = "no_cont_batching")]
    cont_batching: bool,

    /// Only admit new prompts when the whole pool is idle
    #[arg(long)]
    no_cont_batching: bool,

    /// Maximum batch chunk size per decode call
    #[arg(short = 'b', long = "batch-size")]
    n_batch: Option<usize>,

    /// Context size in cache cells
    #[arg(short = 'c', long = "ctx-size")]
    ctx_size: Option<usize>,

    /// Prompt + generated token budget per client (0 = unlimited)
    #[arg(short = 'n', long)]
    n_predict: Option<usize>,

    /// Sampling temperature (0 = greedy)
    #[arg(long)]
    temp: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    repeat_penalty: Option<f32>,

    /// Base RNG seed; each client adds its slot id
    #[arg(long)]
    seed: Option<u64>,

    /// Marker that ends a response
    #[arg(short = 'r', long)]
    reverse_prompt: Option<String>,

    /// Log cache occupancy before every tick
    #[arg(long)]
    dump_kv_cache: bool,

    /// Run on CPU even if an accelerator is available
    #[arg(long)]
    cpu: bool,

    /// Weight dtype: f32, f16 or bf16
    #[arg(long)]
    dtype: Option<String>,

    /// Log filter (overrides RUST_LOG), e.g. "debug"
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: pretty or json
    #[arg(long, default_value = "pretty")]
    log_format: String,
}

impl Args {
    /// Build the run configuration: defaults, then the config file, then flags.
    fn run_config(&self) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::from_file(path)?,
            None => RunConfig::default(),
        };

        let scheduler = &mut config.scheduler;
        if let Some(n) = self.n_parallel {
            scheduler.n_parallel = n;
        }
        if let Some(n) = self.n_sequences {
            scheduler.n_sequences = n;
        }
        if self.cont_batching {
            scheduler.cont_batching = true;
        }
        if self.no_cont_batching {
            scheduler.cont_batching = false;
        }
        if let Some(n) = self.n_batch {
            scheduler.n_batch = n;
        }
        if let Some(n) = self.n_predict {
            scheduler.n_predict = Some(n).filter(|&n| n > 0);
        }
        if let Some(marker) = &self.reverse_prompt {
            scheduler.reverse_prompt = Some(marker.clone()).filter(|m| !m.is_empty());
        }
        if self.dump_kv_cache {
            scheduler.dump_kv_cache = true;
        }

        let sampling = &mut config.sampling;
        if let Some(t) = self.temp {
            sampling.temperature = t;
        }
        if let Some(k) = self.top_k {
            sampling.top_k = k;
        }
        if let Some(p) = self.top_p {
            sampling.top_p = p;
        }
        if let Some(p) = self.repeat_penalty {
            sampling.repeat_penalty = p;
        }
        if self.seed.is_some() {
            sampling.seed = self.seed;
        }

        let engine = &mut config.engine;
        if let Some(model) = &self.model {
            engine.model = model.clone();
        }
        if let Some(revision) = &self.revision {
            engine.revision = revision.clone();
        }
        if let Some(n) = self.ctx_size {
            engine.n_ctx = n;
        }
        if self.cpu {
            engine.cpu = true;
        }
        if let Some(dtype) = &self.dtype {
            engine.dtype = dtype.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Result file format; an unknown name is a configuration error.
    fn output_format(&self) -> Result<OutputFormat> {
        self.output_format.parse()
    }
}

/// Everything loaded before the first tick.
struct Setup {
    config: RunConfig,
    output_format: OutputFormat,
    engine: CandleEngine,
    tokenizer: HfTokenizer,
    prompts: Vec<String>,
    system_prompt: String,
}

fn setup(args: &Args) -> Result<Setup> {
    let config = args.run_config()?;
    let output_format = args.output_format()?;

    let prompts = load_prompts(&args.prompt_file)?;
    info!(
        n_prompts = prompts.len(),
        n_parallel = config.scheduler.n_parallel,
        "processing prompts sequentially (not randomly)"
    );

    let system_prompt = match &args.system_file {
        Some(path) => std::fs::read_to_string(path)?,
        None => DEFAULT_SYSTEM_PROMPT.to_string(),
    };

    let files = resolve_model(&config.engine.model, &config.engine.revision)?;
    let tokenizer = HfTokenizer::from_file(&files.tokenizer)?;
    let mut engine = CandleEngine::load(&files, &config.engine)?;
    for eos in ["</s>", "<|eot_id|>", "<|im_end|>", "<|endoftext|>"] {
        if let Some(id) = tokenizer.token_id(eos) {
            engine.add_end_of_generation(id);
        }
    }

    Ok(Setup {
        config,
        output_format,
        engine,
        tokenizer,
        prompts,
        system_prompt,
    })
}

fn teardown(args: &Args, setup: &Setup, report: &RunReport) {
    let scheduler = &setup.config.scheduler;
    let summary = &report.summary;

    info!(
        "run parameters as of {}",
        Local::now().format("%Y-%m-%d %H:%M:%S")
    );
    info!(
        "n_parallel = {}, n_sequences = {}, cont_batching = {}, system tokens = {}",
        scheduler.n_parallel,
        scheduler.n_sequences.min(setup.prompts.len()),
        scheduler.cont_batching,
        report.n_system
    );
    info!("External prompt file: {}", args.prompt_file.display());
    info!("Model and path used:  {}", setup.config.engine.model);

    info!(
        "Total prompt tokens: {:6}, speed: {:5.2} t/s",
        summary.n_prompt_tokens,
        summary.prompt_speed()
    );
    info!(
        "Total gen tokens:    {:6}, speed: {:5.2} t/s",
        summary.n_gen_tokens,
        summary.gen_speed()
    );
    info!(
        "Total speed (AVG):   {:6}  speed: {:5.2} t/s",
        "",
        summary.total_speed()
    );
    info!("Cache misses:        {:6}", summary.n_cache_miss);

    let perf = setup.engine.perf();
    info!(
        decode_calls = perf.n_decode_calls,
        eval_tokens = perf.n_eval_tokens,
        "eval time = {:.2} ms / {} tokens ({:.2} tokens per second)",
        perf.eval_time.as_secs_f64() * 1e3,
        perf.n_eval_tokens,
        perf.tokens_per_second()
    );

    if let Some(path) = &args.output_file {
        if let Err(e) = write_results(path, setup.output_format, &report.records, summary) {
            warn!(path = %path.display(), error = %e, "failed to write results");
        }
    }
}

fn run(args: &Args) -> Result<()> {
    let mut setup = setup(args)?;
    let config = setup.config.clone();

    let report = run_parallel(
        &mut setup.engine,
        &setup.tokenizer,
        &setup.system_prompt,
        setup.prompts.clone(),
        &config.scheduler,
        |slot_id| Sampler::for_slot(&config.sampling, slot_id),
    )?;

    teardown(args, &setup, &report);
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let format: LogFormat = match args.log_format.parse() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(args.log_level.as_deref(), format);

    info!("nano-parallel v{}", env!("CARGO_PKG_VERSION"));

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            ExitCode::FAILURE
        }
    }
}
