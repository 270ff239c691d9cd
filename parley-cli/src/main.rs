//! Parley CLI - interactive chat REPL over a local model

use std::io::{self, BufRead, Write};

use anyhow::Result;
use clap::Parser;
use parley_core::{Engine, EngineConfig, GenerationConfig, Message};
use tracing::Level;

const SYSTEM_PROMPT: &str = "You are a helpful assistant. Keep replies concise. \
When an action is required, reply with a function call as JSON: \
{\"name\": \"function_name\", \"arguments\": {\"param\": \"value\"}}";

/// Chat with a local LLM.
#[derive(Parser)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Model to load: a HuggingFace model id or a local directory
    model: String,

    /// Context size in tokens
    #[arg(long = "ctx", default_value_t = 4096)]
    ctx: usize,

    /// Layers to offload to the accelerator (0 = CPU only)
    #[arg(long = "gpu", default_value_t = 35)]
    gpu: i32,

    /// Sampling temperature
    #[arg(long = "temp", default_value_t = 0.7)]
    temp: f32,

    /// Nucleus sampling threshold
    #[arg(long = "top-p", default_value_t = 0.9)]
    top_p: f32,

    /// Top-k sampling cutoff
    #[arg(long = "top-k", default_value_t = 40)]
    top_k: i32,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::WARN).init();

    let cli = Cli::parse();

    println!("=== parley ===");
    println!("Loading model: {}", cli.model);
    println!("Context size: {}", cli.ctx);
    println!();

    let config = EngineConfig {
        model_path: cli.model,
        n_ctx: cli.ctx,
        n_gpu_layers: cli.gpu,
        ..Default::default()
    };
    let mut engine = Engine::new(config)?;

    println!("Model loaded.");
    println!("{}", engine.model_info());
    println!();
    println!("Type 'quit' to exit, 'clear' to reset the conversation.");
    println!();

    let gen_config = GenerationConfig {
        temperature: cli.temp,
        top_p: cli.top_p,
        top_k: cli.top_k,
        ..Default::default()
    };

    let mut messages = vec![Message::system(SYSTEM_PROMPT)];

    let stdin = io::stdin();
    loop {
        print!("User: ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "quit" | "exit" => break,
            "clear" | "reset" => {
                messages.clear();
                messages.push(Message::system(SYSTEM_PROMPT));
                engine.clear_cache();
                println!("Conversation cleared.\n");
                continue;
            }
            "stats" => {
                let stats = engine.stats();
                println!("Stats:");
                println!("  Tokens generated: {}", stats.tokens_generated);
                println!("  Generation time: {:.1}ms", stats.generation_time_ms);
                println!("  Tokens/sec: {:.1}", stats.tokens_per_second);
                println!(
                    "  Context usage: {}/{}\n",
                    engine.context_usage(),
                    engine.max_context()
                );
                continue;
            }
            _ => {}
        }

        messages.push(Message::user(input));

        print!("Assistant: ");
        io::stdout().flush()?;

        let response = engine.generate_stream(
            &messages,
            |piece, is_end| {
                if !is_end {
                    print!("{piece}");
                    let _ = io::stdout().flush();
                }
            },
            &gen_config,
        )?;
        println!("\n");

        if let Some(call) = engine.parse_function_call(&response) {
            println!("[Function Call] {}({})\n", call.name, call.arguments);
        }

        messages.push(Message::assistant(response));

        let stats = engine.stats();
        println!(
            "[{:.1} tokens/s, {}/{} ctx]\n",
            stats.tokens_per_second,
            engine.context_usage(),
            engine.max_context()
        );
    }

    println!("Goodbye!");
    Ok(())
}
