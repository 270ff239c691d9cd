//! Example: stream one chat reply from a local model
//!
//! Run with:
//!   cargo run --example chat -- --model HuggingFaceTB/SmolLM2-135M --prompt "Hello!"

use std::io::Write;

use parley_core::{Engine, EngineConfig, GenerationConfig, Message};

fn main() -> parley_core::Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let model = args
        .iter()
        .position(|a| a == "--model")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("HuggingFaceTB/SmolLM2-135M");
    let prompt = args
        .iter()
        .position(|a| a == "--prompt")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("Tell me something interesting about rivers.");

    println!("Model: {model}");
    println!("Prompt: {prompt}");
    println!();

    let mut engine = Engine::new(EngineConfig::with_model(model))?;

    let messages = vec![
        Message::system("You are a helpful assistant."),
        Message::user(prompt),
    ];

    println!("---");
    engine.generate_stream(
        &messages,
        |piece, is_end| {
            if !is_end {
                print!("{piece}");
                let _ = std::io::stdout().flush();
            }
        },
        &GenerationConfig::default(),
    )?;
    println!("\n---");

    let stats = engine.stats();
    println!(
        "{} tokens in {:.0}ms ({:.1} tok/s)",
        stats.tokens_generated, stats.generation_time_ms, stats.tokens_per_second
    );

    Ok(())
}
