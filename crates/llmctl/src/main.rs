//! Control CLI for the llmcore inference engine
//!
//! Stands in for the host shell: inspect model files, run one-shot
//! generations, or chat through the engine's prompt endpoint.

use std::io::{self, BufRead, Write};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use llmcore::engine::{Engine, EngineConfig};
use llmcore::generate::GenerationConfig;
use llmcore::gguf::GgufFile;
use llmcore::model::LoadConfig;
use llmcore::sampling::SamplingParams;

#[derive(Parser)]
#[command(name = "llmctl", version, about = "Control CLI for the llmcore inference engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a model file's metadata and tensor directory
    Info {
        /// Path to a GGUF model file
        model: String,
        /// Also list every tensor
        #[arg(long)]
        tensors: bool,
    },
    /// Run a single prompt through the model
    Run {
        /// Path to a GGUF model file
        model: String,
        /// The prompt text
        #[arg(short, long)]
        prompt: String,
        /// Maximum tokens to generate
        #[arg(short = 'n', long, default_value_t = 128)]
        max_tokens: usize,
        /// Sampling temperature; 0 selects greedy decoding
        #[arg(long, default_value_t = 0.0)]
        temperature: f32,
        #[arg(long, default_value_t = 40)]
        top_k: usize,
        #[arg(long, default_value_t = 0.9)]
        top_p: f32,
        /// PRNG seed for reproducible sampling; 0 draws from the OS
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Materialize zero placeholders for missing tensors
        #[arg(long)]
        allow_missing: bool,
    },
    /// Interactive prompt loop over the engine's control surface
    Chat {
        /// Path to a GGUF model file
        model: String,
        #[arg(short = 'n', long, default_value_t = 128)]
        max_tokens: usize,
        #[arg(long, default_value_t = 0.8)]
        temperature: f32,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("llmctl: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Info { model, tensors } => info(&model, tensors),
        Command::Run {
            model,
            prompt,
            max_tokens,
            temperature,
            top_k,
            top_p,
            seed,
            allow_missing,
        } => {
            let config = EngineConfig {
                load: LoadConfig {
                    allow_missing_tensors: allow_missing,
                    ..Default::default()
                },
                generation: GenerationConfig {
                    max_tokens,
                    sampling: SamplingParams {
                        temperature,
                        top_k,
                        top_p,
                        seed,
                    },
                    ..Default::default()
                },
            };
            let engine = Engine::load(&model, config)?;
            engine.submit_prompt(&prompt)?;
            let response = engine
                .await_response(std::time::Duration::from_secs(600))?
                .unwrap_or_default();
            println!("{response}");
            Ok(())
        }
        Command::Chat {
            model,
            max_tokens,
            temperature,
        } => {
            let config = EngineConfig {
                load: LoadConfig::default(),
                generation: GenerationConfig {
                    max_tokens,
                    sampling: SamplingParams::balanced().temperature(temperature),
                    ..Default::default()
                },
            };
            let engine = Engine::load(&model, config)?;
            chat(&engine)
        }
    }
}

fn info(path: &str, list_tensors: bool) -> Result<(), Box<dyn std::error::Error>> {
    let data = std::fs::read(path)?;
    let file = GgufFile::parse(&data)?;

    println!("gguf version {}", file.header.version);
    println!(
        "{} tensors, {} metadata keys, data region at {}",
        file.header.tensor_count, file.header.metadata_count, file.data_region_start
    );
    println!();
    for (key, value) in &file.metadata {
        match value.as_array() {
            Some(items) => println!("  {key} = [{} items]", items.len()),
            None => println!("  {key} = {value:?}"),
        }
    }
    if list_tensors {
        println!();
        for t in &file.tensors {
            println!(
                "  {:40} dims {:?} dtype {} offset {}",
                t.name,
                &t.ne[..t.n_dims as usize],
                t.dtype_id,
                t.offset
            );
        }
    }
    Ok(())
}

fn chat(engine: &Engine) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", engine.status_text());
    println!("Type a prompt and press enter; empty line quits.\n");

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        match line {
            "/status" => println!("{}", engine.status_text()),
            "/stats" => println!("{}", engine.stats_text()),
            prompt => {
                engine.submit_prompt(prompt)?;
                match engine.await_response(std::time::Duration::from_secs(600))? {
                    Some(response) => println!("{response}"),
                    None => println!("(no response)"),
                }
            }
        }
    }
    Ok(())
}
