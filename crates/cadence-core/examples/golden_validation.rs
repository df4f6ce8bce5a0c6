//! Record or replay golden token sequences for a seeded toy model.
//!
//! ```text
//! # record
//! cargo run -p cadence-core --example golden_validation -- record golden.json
//! # replay
//! cargo run -p cadence-core --example golden_validation -- check golden.json
//! ```
//!
//! The model is rebuilt from the seed stored in the file, so a replay fails
//! only when the forward pass itself changed.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use cadence_core::model::{ModelConfig, Transformer, WeightMap};
use cadence_core::session::{GoldenCase, GoldenTestHarness, GoldenTestable};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;

/// Golden file contents.
#[derive(Debug, Serialize, Deserialize)]
struct GoldenFile {
    seed: u64,
    config: ModelConfig,
    cases: Vec<JsonCase>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JsonCase {
    name: String,
    prompt: Vec<u32>,
    expected: Vec<u32>,
}

fn build(seed: u64, config: &ModelConfig) -> Result<Arc<Transformer>> {
    let weights = WeightMap::random(config, seed, &Device::Cpu)?;
    Ok(Arc::new(Transformer::from_weights(config.clone(), &weights)?))
}

fn record(path: &str) -> Result<()> {
    let seed = 1234;
    let config = ModelConfig {
        num_hidden_layers: 4,
        sliding_window: Some(6),
        sliding_window_pattern: Some(2),
        ..ModelConfig::default()
    };
    let model = build(seed, &config)?;
    let mut session = model.create_session()?;

    let prompts: [(&str, Vec<u32>); 3] = [
        ("single_token", vec![1]),
        ("short_prompt", vec![1, 2, 3]),
        ("past_window", (0..12).collect()),
    ];
    let mut cases = Vec::new();
    for (name, prompt) in prompts {
        let expected = session.generate_greedy(&prompt, 16)?;
        println!("{}: {:?}", name, expected);
        cases.push(JsonCase {
            name: name.to_string(),
            prompt,
            expected,
        });
    }

    let file = GoldenFile { seed, config, cases };
    fs::write(path, serde_json::to_string_pretty(&file)?).with_context(|| format!("writing {}", path))?;
    println!("wrote {} cases to {}", file.cases.len(), path);
    Ok(())
}

fn check(path: &str) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
    let file: GoldenFile = serde_json::from_str(&text)?;
    let model = build(file.seed, &file.config)?;

    let mut harness = GoldenTestHarness::new();
    for case in file.cases {
        harness.add_case(GoldenCase::greedy(case.name, case.prompt, case.expected));
    }
    let summary = model.create_session()?.run_golden_tests(&harness);
    print!("{}", summary);
    if !summary.all_passed() {
        bail!("{} of {} golden cases failed", summary.total() - summary.passed(), summary.total());
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    match (args.get(1).map(String::as_str), args.get(2)) {
        (Some("record"), Some(path)) => record(path),
        (Some("check"), Some(path)) => check(path),
        _ => bail!("usage: golden_validation <record|check> <file.json>"),
    }
}
