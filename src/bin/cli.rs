//! Command-line interface for qwen2-rs.
//!
//! Tokenization stays outside this tool: prompts go in and come out as token ids.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use qwen2::sampling::SamplingConfig;
use qwen2::tensor::DeviceType;
use qwen2::weights::{self, names::OUTPUT_EMBEDDING, NameRouter, SafetensorsFile};
use qwen2::{GenerationConfig, ModelMeta, Session, SessionConfig, TokenId};

/// qwen2-rs: checkpoint inspection and token-level generation
#[derive(Parser)]
#[command(name = "qwen2-cli", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the model descriptor and the tensors in a checkpoint directory.
    Inspect {
        /// Directory holding config.json and *.safetensors shards.
        model_dir: PathBuf,
    },

    /// Extend a prompt of token ids and print the resulting sequence.
    Generate {
        /// Directory holding config.json and *.safetensors shards.
        model_dir: PathBuf,

        /// Comma-separated prompt token ids, e.g. 1,9,2.
        #[arg(long, value_delimiter = ',', required = true)]
        tokens: Vec<TokenId>,

        /// Maximum number of tokens to append.
        #[arg(long, default_value_t = 128)]
        max_new_tokens: usize,

        /// Top-k truncation (1 = greedy, 0 = off).
        #[arg(long, default_value_t = 1)]
        top_k: i32,

        /// Nucleus probability mass (1.0 = off).
        #[arg(long, default_value_t = 0.8)]
        top_p: f32,

        /// Softmax temperature (<= 0 = greedy).
        #[arg(long, default_value_t = 0.8)]
        temperature: f32,

        /// RNG seed (0 = seed from the clock).
        #[arg(long, default_value_t = 0)]
        seed: u64,

        /// Recompute the full context on every step.
        #[arg(long)]
        no_kv_cache: bool,

        /// Device to run on.
        #[arg(long, default_value = "cpu")]
        device: DeviceType,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Inspect { model_dir } => cmd_inspect(&model_dir),
        Command::Generate {
            model_dir,
            tokens,
            max_new_tokens,
            top_k,
            top_p,
            temperature,
            seed,
            no_kv_cache,
            device,
        } => {
            let config = GenerationConfig {
                max_new_tokens,
                sampling: SamplingConfig {
                    top_k,
                    top_p,
                    temperature,
                    seed,
                },
            };
            let session_config = SessionConfig {
                model_path: model_dir,
                device,
                kv_cache: !no_kv_cache,
                ..SessionConfig::default()
            };
            cmd_generate(&session_config, &tokens, &config)
        }
    }
}

fn cmd_inspect(model_dir: &Path) -> anyhow::Result<()> {
    let config_path = model_dir.join("config.json");
    let meta = ModelMeta::from_file(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;

    println!("Model Descriptor:");
    println!("  Precision:   {}", meta.dtype);
    println!("  Layers:      {}", meta.num_layers);
    println!("  Hidden:      {}", meta.hidden_size);
    println!("  Heads:       {}/{} (Q/KV)", meta.num_heads, meta.num_kv_heads);
    println!("  Head dim:    {}", meta.head_dim);
    println!("  FFN:         {}", meta.intermediate_size);
    println!("  Vocab:       {}", meta.vocab_size);
    println!("  Context:     {}", meta.max_seq_len);
    println!("  RMS eps:     {:e}", meta.rms_norm_eps);
    println!("  RoPE theta:  {}", meta.rope_theta);
    if meta.eos_tokens.is_empty() {
        println!("  EOS:         none");
    } else {
        println!("  EOS:         {:?}", meta.eos_tokens);
    }
    println!(
        "  Params:      ~{:.1}M, KV cache {:.1} MB at full context",
        meta.estimated_params() as f64 / 1e6,
        meta.kv_cache_bytes() as f64 / 1e6
    );
    println!();

    let files = weights::discover_weight_files(model_dir)?;
    let router = NameRouter::new();
    let mut routed = 0usize;
    let mut ignored = Vec::new();
    let mut has_output_embedding = false;

    println!("Safetensors files ({}):", files.len());
    for file in &files {
        let sf = SafetensorsFile::open(file)
            .with_context(|| format!("opening {}", file.display()))?;
        let names = sf.tensor_names();
        let name = file.file_name().unwrap_or_default().to_string_lossy();
        println!("  {name}: {} tensors", names.len());

        for tensor in names {
            has_output_embedding |= tensor == OUTPUT_EMBEDDING;
            if router.route(tensor).is_some() {
                routed += 1;
            } else {
                ignored.push(tensor.to_string());
            }
        }
    }

    println!();
    println!("Routed tensors:  {routed}");
    println!("Ignored tensors: {}", ignored.len());
    for name in ignored.iter().take(10) {
        println!("  {name}");
    }
    if ignored.len() > 10 {
        println!("  ... and {} more", ignored.len() - 10);
    }
    println!(
        "Output embedding: {}",
        if has_output_embedding {
            "present"
        } else {
            "tied to input embedding"
        }
    );
    Ok(())
}

fn cmd_generate(
    session_config: &SessionConfig,
    prompt: &[TokenId],
    config: &GenerationConfig,
) -> anyhow::Result<()> {
    if prompt.is_empty() {
        bail!("--tokens must name at least one token id");
    }

    let mut session = Session::load_cpu(session_config)
        .with_context(|| format!("loading {}", session_config.model_path.display()))?;
    let generation = session.generate_detailed(prompt, config)?;

    let ids: Vec<String> = generation.tokens.iter().map(|t| t.to_string()).collect();
    println!("{}", ids.join(","));
    eprintln!(
        "{} new tokens, stop: {:?}, {:.1} tok/s",
        generation.new_tokens().len(),
        generation.stop_reason,
        generation.stats.tokens_per_second
    );
    Ok(())
}
