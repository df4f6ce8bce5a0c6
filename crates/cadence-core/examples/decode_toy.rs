//! Decode with a seeded toy model, step by step and through `generate`.
//!
//! ```text
//! cargo run -p cadence-core --example decode_toy
//! RUST_LOG=cadence_core=debug cargo run -p cadence-core --example decode_toy
//! ```

use anyhow::Result;
use candle_core::Device;
use cadence_core::prelude::*;
use std::sync::Arc;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Gemma-style mix: alternating sliding/global layers, shared KV on the
    // last two, soft-capped logits and an 8-bit cache for global layers.
    let config = ModelConfig {
        num_hidden_layers: 6,
        sliding_window: Some(16),
        sliding_window_pattern: Some(3),
        num_kv_shared_layers: 2,
        kv_bits: Some(8),
        kv_group_size: Some(8),
        attn_logit_softcapping: Some(50.0),
        final_logit_softcapping: Some(30.0),
        ..ModelConfig::default()
    };
    for layer in config.layer_configs()? {
        println!(
            "layer {}: {:?}, cache {:?}, kv from {:?}",
            layer.index, layer.attention, layer.cache, layer.kv_source
        );
    }

    let weights = WeightMap::random(&config, 42, &Device::Cpu)?;
    let model = Arc::new(Transformer::from_weights(config, &weights)?);

    // Manual loop: prefill once, then feed the arg-max back
    let mut session = model.create_session()?;
    let mut logits = session.step(StepInput::Prefill(&[1, 2, 3, 4]))?;
    let mut manual = Vec::new();
    for _ in 0..8 {
        let token = cadence_core::sampling::argmax(&logits.to_vec1::<f32>()?);
        manual.push(token);
        logits = session.step(StepInput::Token(token))?;
    }
    println!("manual:   {:?} (offset {})", manual, session.offset());

    // Same thing through generate
    let mut session = model.create_session()?;
    let output = session.generate(&[1, 2, 3, 4], &GenerateConfig::greedy(8), |_| true)?;
    println!(
        "generate: {:?} ({}, {:.1} tok/s)",
        output.tokens, output.finish_reason, output.tokens_per_second
    );

    // Sampled, with a stop token taken from the greedy run
    let mut session = model.create_session()?;
    let config = GenerateConfig {
        max_tokens: 32,
        sampling: SamplingParams {
            temperature: 0.8,
            top_p: 0.9,
            top_k: 20,
            repetition_penalty: Some(1.2),
            seed: Some(3),
            ..SamplingParams::default()
        },
        stop_tokens: vec![manual[3]],
    };
    let output = session.generate(&[5, 6], &config, |token| {
        print!("{} ", token);
        true
    })?;
    println!("\nsampled:  {} tokens, {}", output.token_count, output.finish_reason);

    Ok(())
}
