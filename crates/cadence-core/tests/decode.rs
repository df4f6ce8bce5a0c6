//! Full-model decoding properties on seeded toy models.

use cadence_core::prelude::*;
use candle_core::{Device, Tensor};
use std::sync::Arc;
use std::thread;

fn build(config: ModelConfig, seed: u64) -> Arc<Transformer> {
    let weights = WeightMap::random(&config, seed, &Device::Cpu).unwrap();
    Arc::new(Transformer::from_weights(config, &weights).unwrap())
}

fn max_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar()
        .unwrap()
}

/// Logits of the whole prompt in one pass vs. one token at a time.
fn assert_prefill_matches_decode(config: ModelConfig, prompt: &[u32]) {
    let model = build(config, 17);

    let mut bulk = model.new_caches().unwrap();
    let full = model.forward(prompt, &mut bulk).unwrap();

    let mut stepwise = model.new_caches().unwrap();
    let rows: Vec<Tensor> = prompt
        .iter()
        .map(|&id| model.forward(&[id], &mut stepwise).unwrap())
        .collect();
    let rows = Tensor::cat(&rows, 0).unwrap();

    let diff = max_diff(&full, &rows);
    assert!(diff < 1e-3, "prefill and decode logits differ by {}", diff);
    for (a, b) in bulk.iter().zip(&stepwise) {
        assert_eq!(a.offset(), prompt.len());
        assert_eq!(b.offset(), prompt.len());
    }
}

const PROMPT: [u32; 10] = [3, 14, 15, 9, 26, 5, 35, 8, 9, 7];

#[test]
fn growing_cache_prefill_matches_decode() {
    assert_prefill_matches_decode(ModelConfig::default(), &PROMPT);
}

#[test]
fn rotating_cache_prefill_matches_decode() {
    // Every layer slides over 4 positions, less than the prompt
    let config = ModelConfig {
        sliding_window: Some(4),
        ..ModelConfig::default()
    };
    let layers = config.layer_configs().unwrap();
    assert!(layers
        .iter()
        .all(|l| l.cache == CacheConfig::Rotating { max_size: 4, keep: 0 }));
    assert_prefill_matches_decode(config, &PROMPT);
}

#[test]
fn quantized_cache_prefill_matches_decode() {
    let config = ModelConfig {
        kv_bits: Some(8),
        kv_group_size: Some(8),
        ..ModelConfig::default()
    };
    assert_prefill_matches_decode(config, &PROMPT);
}

#[test]
fn mixed_model_prefill_matches_decode() {
    let config = ModelConfig {
        num_hidden_layers: 4,
        sliding_window: Some(3),
        sliding_window_pattern: Some(2),
        rope_local_base_freq: Some(10_000.0),
        num_experts: Some(4),
        num_experts_per_tok: Some(2),
        decoder_sparse_step: 2,
        ..ModelConfig::default()
    };
    assert_prefill_matches_decode(config, &PROMPT);
}

#[test]
fn shared_sliding_caches_survive_multi_turn_generation() {
    // Layers 0 and 2 slide over 3 positions, 1 and 3 are global;
    // layers 2 and 3 read the caches of layers 0 and 1
    let config = ModelConfig {
        num_hidden_layers: 4,
        sliding_window: Some(3),
        sliding_window_pattern: Some(2),
        num_kv_shared_layers: 2,
        ..ModelConfig::default()
    };
    let layers = config.layer_configs().unwrap();
    assert_eq!(layers[2].kv_source, Some(0));
    assert_eq!(layers[3].kv_source, Some(1));

    let model = build(config, 11);
    let mut session = model.create_session().unwrap();
    assert_eq!(session.caches().len(), 2);

    let first = session
        .generate(&PROMPT, &GenerateConfig::greedy(6), |_| true)
        .unwrap();
    assert_eq!(first.token_count, 6);
    let second = session
        .generate(&[4, 2, 6], &GenerateConfig::greedy(5), |_| true)
        .unwrap();
    assert_eq!(second.token_count, 5);

    let expected = PROMPT.len() + first.token_count + 3 + second.token_count;
    assert_eq!(session.offset(), expected);
    assert_eq!(session.history().len(), expected);
    for cache in session.caches() {
        assert_eq!(cache.offset(), expected);
        let (keys, values) = cache.state().unwrap().unwrap();
        assert_eq!(keys.dims()[2], cache.len());
        assert_eq!(values.dims()[2], cache.len());
    }
    let window = &session.caches()[0];
    assert_eq!(window.len(), 3);
    assert_eq!(
        window.state_layout().positions(),
        vec![expected - 3, expected - 2, expected - 1]
    );
}

#[test]
fn greedy_generation_is_reproducible_end_to_end() {
    let model = build(ModelConfig::default(), 0);
    let config = GenerateConfig::greedy(5);

    let runs: Vec<Vec<u32>> = (0..3)
        .map(|_| {
            let mut session = model.create_session().unwrap();
            let output = session.generate(&[1, 2, 3], &config, |_| true).unwrap();
            assert_eq!(output.finish_reason, FinishReason::Length);
            assert!(session.caches().iter().all(|c| c.offset() == 8));
            output.tokens
        })
        .collect();

    assert_eq!(runs[0].len(), 5);
    assert!(runs.iter().all(|r| r == &runs[0]));
}

#[test]
fn sessions_run_concurrently_on_one_model() {
    let model = build(ModelConfig::default(), 3);
    let expected = {
        let mut session = model.create_session().unwrap();
        session
            .generate(&[1, 2, 3], &GenerateConfig::greedy(6), |_| true)
            .unwrap()
            .tokens
    };

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let model = Arc::clone(&model);
            thread::spawn(move || {
                let mut session = model.create_session().unwrap();
                session
                    .generate(&[1, 2, 3], &GenerateConfig::greedy(6), |_| true)
                    .unwrap()
                    .tokens
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), expected);
    }
}

#[test]
fn config_json_drives_layer_layout() {
    let json = r#"{
        "vocab_size": 64,
        "hidden_size": 32,
        "intermediate_size": 64,
        "num_attention_heads": 4,
        "num_key_value_heads": 2,
        "num_hidden_layers": 3,
        "head_dim": 8,
        "layer_types": ["sliding_attention", "sliding_attention", "full_attention"],
        "sliding_window": 4,
        "max_kv_size": 16,
        "rope_scaling": {"rope_type": "linear", "factor": 2.0},
        "eos_token_id": 0,
        "model_type": "llama"
    }"#;
    let config = ModelConfig::from_json(json).unwrap();
    let layers = config.layer_configs().unwrap();
    assert_eq!(layers[0].cache, CacheConfig::Rotating { max_size: 4, keep: 0 });
    assert_eq!(layers[2].cache, CacheConfig::Rotating { max_size: 16, keep: 4 });

    let model = build(config, 5);
    assert_eq!(model.eos_token_ids(), &[0]);
    let mut session = model.create_session().unwrap();
    let output = session
        .generate(&PROMPT, &GenerateConfig::greedy(20), |_| true)
        .unwrap();
    // Either EOS was sampled or the budget ran out
    assert!(!output.tokens.contains(&0));
    assert_eq!(session.offset(), PROMPT.len() + output.token_count);
}
