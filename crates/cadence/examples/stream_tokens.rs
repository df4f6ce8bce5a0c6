//! Streaming generation through the engine.
//!
//! Builds a small random model, registers it, streams tokens to stdout and
//! prints the JSON result. Run with `RUST_LOG=debug` to see per-step logs.

use anyhow::Result;
use cadence::prelude::*;
use candle_core::Device;
use std::io::Write;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    println!("cadence {} (available: {})", cadence::version(), cadence::is_available());

    let engine = Engine::builder().max_tokens(24).build()?;

    let config = ModelConfig {
        num_hidden_layers: 4,
        sliding_window: Some(8),
        sliding_window_pattern: Some(2),
        ..ModelConfig::default()
    };
    let weights = WeightMap::random(&config, 2024, &Device::Cpu)?;
    let handle = engine.load_model(config, &weights)?;
    println!("Loaded {}", handle);

    // Greedy, streamed on the blocking pool
    let result = engine
        .generate(handle, &[1, 2, 3])
        .temperature(0.0)
        .on_token(|id| {
            print!("{} ", id);
            let _ = std::io::stdout().flush();
            true
        })
        .execute_async()
        .await?;
    println!();
    println!("{}", result.to_json()?);

    // Seeded sampling with a repetition penalty
    let result = engine
        .generate(handle, &[1, 2, 3])
        .temperature(0.9)
        .top_p(0.95)
        .repetition_penalty(1.3, 16)
        .seed(7)
        .execute()?;
    println!("{}", result.to_json()?);

    // Unknown handles report through the result
    engine.unload_model(handle);
    let result = engine.generate(handle, &[1]).execute_to_result();
    println!("{}", result.to_json()?);

    Ok(())
}
