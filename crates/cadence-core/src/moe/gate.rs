//! Softmax top-k gating.

use super::switch::SwitchGlu;
use crate::error::{CadenceError, Result};
use candle_core::{DType, Tensor, D};

/// Experts and mixing weights chosen for each token.
#[derive(Debug, Clone)]
pub struct Routing {
    /// `u32` `[tokens, k]`, highest probability first.
    pub indices: Tensor,
    /// `f32` `[tokens, k]`.
    pub scores: Tensor,
}

/// Pick the `k` most probable experts per token from router logits `[tokens, experts]`.
///
/// Ties go to the lower expert id. With `normalize`, the kept
/// probabilities are rescaled to sum to one.
pub fn top_k_routing(logits: &Tensor, k: usize, normalize: bool) -> Result<Routing> {
    let (tokens, num_experts) = logits.dims2()?;
    if k == 0 || k > num_experts {
        return Err(CadenceError::config(format!(
            "cannot route to {} of {} experts",
            k, num_experts
        )));
    }
    let probs = candle_nn::ops::softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let rows = probs.to_vec2::<f32>()?;

    let mut indices = Vec::with_capacity(tokens * k);
    let mut scores = Vec::with_capacity(tokens * k);
    for row in &rows {
        let mut ranked: Vec<usize> = (0..num_experts).collect();
        ranked.sort_by(|&a, &b| row[b].total_cmp(&row[a]));
        let top = &ranked[..k];
        let total: f32 = top.iter().map(|&e| row[e]).sum();
        for &e in top {
            indices.push(e as u32);
            scores.push(if normalize { row[e] / total } else { row[e] });
        }
    }

    let device = logits.device();
    Ok(Routing {
        indices: Tensor::from_vec(indices, (tokens, k), device)?,
        scores: Tensor::from_vec(scores, (tokens, k), device)?,
    })
}

/// Router plus experts: `sum_k score_k * expert_k(x)`.
#[derive(Debug, Clone)]
pub struct MoeBlock {
    /// `[experts, hidden]`
    router: Tensor,
    experts: SwitchGlu,
    top_k: usize,
    norm_topk_prob: bool,
}

impl MoeBlock {
    /// Create a block. `router` is `[experts, hidden]`.
    pub fn new(router: Tensor, experts: SwitchGlu, top_k: usize, norm_topk_prob: bool) -> Result<Self> {
        let (num_experts, hidden) = router.dims2()?;
        if num_experts != experts.num_experts() || hidden != experts.hidden_size() {
            return Err(CadenceError::ShapeMismatch(format!(
                "router {:?} does not match {} experts of width {}",
                router.dims(),
                experts.num_experts(),
                experts.hidden_size()
            )));
        }
        if top_k == 0 || top_k > num_experts {
            return Err(CadenceError::config(format!(
                "num_experts_per_tok {} must be in 1..={}",
                top_k, num_experts
            )));
        }
        Ok(Self {
            router,
            experts,
            top_k,
            norm_topk_prob,
        })
    }

    /// Experts per token.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Route `x` (`[..., hidden]`) and mix the expert outputs.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dims = x.dims().to_vec();
        let hidden = self.experts.hidden_size();
        let flat = x.reshape(((), hidden))?;

        let logits = flat.matmul(&self.router.t()?)?;
        let routing = top_k_routing(&logits, self.top_k, self.norm_topk_prob)?;

        // [tokens, k, hidden] weighted by [tokens, k, 1]
        let expert_out = self.experts.forward(&flat, &routing.indices)?;
        let weights = routing.scores.to_dtype(expert_out.dtype())?.unsqueeze(2)?;
        let mixed = expert_out.broadcast_mul(&weights)?.sum(1)?;
        Ok(mixed.reshape(dims)?)
    }
}
