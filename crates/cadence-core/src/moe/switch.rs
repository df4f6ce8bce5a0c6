//! SwiGLU experts dispatched by routing indices.
//!
//! Two dispatch strategies produce the same result:
//!
//! - **Per token**: gather each assignment's expert weights and run one
//!   batched matmul chain. Cheap for a handful of assignments (decode).
//! - **Sorted**: stable-sort assignments by expert, gather the tokens, run
//!   one dense matmul chain per non-empty expert, then scatter rows back
//!   through the inverse permutation. Wins once many tokens share experts
//!   (prefill).

use crate::error::{CadenceError, Result};
use candle_core::{DType, Tensor};
use candle_nn::ops::silu;
use tracing::trace;

/// Assignment count at which [`Dispatch::Auto`] switches to the sorted path.
pub const SORT_THRESHOLD: usize = 64;

/// How assignments are batched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// Per token below [`SORT_THRESHOLD`] assignments, sorted at or above.
    #[default]
    Auto,
    /// Gather weights per assignment.
    PerToken,
    /// Group assignments by expert.
    Sorted,
}

impl Dispatch {
    /// Concrete strategy for `assignments` routed (token, expert) pairs.
    pub fn resolve(self, assignments: usize) -> Self {
        match self {
            Self::Auto if assignments >= SORT_THRESHOLD => Self::Sorted,
            Self::Auto => Self::PerToken,
            other => other,
        }
    }
}

/// Stacked SwiGLU experts.
#[derive(Debug, Clone)]
pub struct SwitchGlu {
    /// `[experts, intermediate, hidden]`
    gate_proj: Tensor,
    /// `[experts, intermediate, hidden]`
    up_proj: Tensor,
    /// `[experts, hidden, intermediate]`
    down_proj: Tensor,
    /// Gate pre-activations are clamped to `[-limit, limit]`.
    limit: Option<f64>,
    num_experts: usize,
    hidden_size: usize,
}

impl SwitchGlu {
    /// Create from stacked expert weights.
    pub fn new(
        gate_proj: Tensor,
        up_proj: Tensor,
        down_proj: Tensor,
        limit: Option<f64>,
    ) -> Result<Self> {
        let (num_experts, intermediate, hidden_size) = gate_proj.dims3()?;
        if up_proj.dims() != gate_proj.dims()
            || down_proj.dims() != [num_experts, hidden_size, intermediate]
        {
            return Err(CadenceError::ShapeMismatch(format!(
                "expert weights gate {:?} up {:?} down {:?}",
                gate_proj.dims(),
                up_proj.dims(),
                down_proj.dims()
            )));
        }
        Ok(Self {
            gate_proj,
            up_proj,
            down_proj,
            limit,
            num_experts,
            hidden_size,
        })
    }

    /// Number of experts.
    pub fn num_experts(&self) -> usize {
        self.num_experts
    }

    /// Hidden dimension.
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// `x`: `[tokens, hidden]`, `indices`: `[tokens, k]` -> `[tokens, k, hidden]`.
    pub fn forward(&self, x: &Tensor, indices: &Tensor) -> Result<Tensor> {
        self.forward_with(x, indices, Dispatch::Auto)
    }

    /// Like [`SwitchGlu::forward`] with an explicit dispatch strategy.
    pub fn forward_with(&self, x: &Tensor, indices: &Tensor, dispatch: Dispatch) -> Result<Tensor> {
        let (tokens, hidden) = x.dims2()?;
        let (index_rows, k) = indices.dims2()?;
        if hidden != self.hidden_size || index_rows != tokens {
            return Err(CadenceError::ShapeMismatch(format!(
                "experts expect [tokens, {}] with matching indices, got x {:?} indices {:?}",
                self.hidden_size,
                x.dims(),
                indices.dims()
            )));
        }
        if tokens == 0 || k == 0 {
            return Err(CadenceError::EmptyInput(
                "expert dispatch needs at least one assignment".to_string(),
            ));
        }

        let experts = indices.to_dtype(DType::U32)?.flatten_all()?.to_vec1::<u32>()?;
        if let Some(bad) = experts.iter().find(|&&e| e as usize >= self.num_experts) {
            return Err(CadenceError::InvalidInput(format!(
                "expert id {} out of range for {} experts",
                bad, self.num_experts
            )));
        }

        let out = match dispatch.resolve(experts.len()) {
            Dispatch::Sorted => self.sorted(x, &experts, k)?,
            _ => self.per_token(x, &experts, k)?,
        };
        Ok(out.reshape((tokens, k, hidden))?)
    }

    fn activate(&self, gate: &Tensor, up: &Tensor) -> Result<Tensor> {
        let gate = match self.limit {
            Some(limit) => gate.clamp(-limit, limit)?,
            None => gate.clone(),
        };
        Ok((silu(&gate)? * up)?)
    }

    /// Returns `[assignments, hidden]` in assignment order.
    fn per_token(&self, x: &Tensor, experts: &[u32], k: usize) -> Result<Tensor> {
        let n = experts.len();
        let device = x.device();
        let expert_ids = Tensor::from_vec(experts.to_vec(), n, device)?;
        let token_ids: Vec<u32> = (0..n).map(|a| (a / k) as u32).collect();
        let token_ids = Tensor::from_vec(token_ids, n, device)?;

        // [n, 1, hidden]
        let xs = x.index_select(&token_ids, 0)?.unsqueeze(1)?;
        let w_gate = self.gate_proj.index_select(&expert_ids, 0)?;
        let w_up = self.up_proj.index_select(&expert_ids, 0)?;
        let w_down = self.down_proj.index_select(&expert_ids, 0)?;

        let gate = xs.matmul(&w_gate.t()?)?;
        let up = xs.matmul(&w_up.t()?)?;
        let act = self.activate(&gate, &up)?;
        let out = act.matmul(&w_down.t()?)?;
        Ok(out.squeeze(1)?)
    }

    /// Returns `[assignments, hidden]` in assignment order.
    fn sorted(&self, x: &Tensor, experts: &[u32], k: usize) -> Result<Tensor> {
        let n = experts.len();
        let device = x.device();

        // Stable: assignments of one expert keep token order
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by_key(|&a| experts[a]);

        let mut counts = vec![0usize; self.num_experts];
        for &e in experts {
            counts[e as usize] += 1;
        }

        let token_ids: Vec<u32> = order.iter().map(|&a| (a / k) as u32).collect();
        let xs = x.index_select(&Tensor::from_vec(token_ids, n, device)?, 0)?;

        let mut chunks = Vec::new();
        let mut start = 0;
        for (expert, &count) in counts.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let chunk = xs.narrow(0, start, count)?;
            let gate = chunk.matmul(&self.gate_proj.get(expert)?.t()?)?;
            let up = chunk.matmul(&self.up_proj.get(expert)?.t()?)?;
            let act = self.activate(&gate, &up)?;
            chunks.push(act.matmul(&self.down_proj.get(expert)?.t()?)?);
            start += count;
        }
        trace!(
            assignments = n,
            active_experts = chunks.len(),
            "sorted expert dispatch"
        );

        let grouped = Tensor::cat(&chunks, 0)?;
        let mut inverse = vec![0u32; n];
        for (sorted_pos, &assignment) in order.iter().enumerate() {
            inverse[assignment] = sorted_pos as u32;
        }
        Ok(grouped.index_select(&Tensor::from_vec(inverse, n, device)?, 0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn experts(num: usize, hidden: usize, inter: usize, limit: Option<f64>) -> SwitchGlu {
        let device = Device::Cpu;
        SwitchGlu::new(
            Tensor::randn(0f32, 0.5, (num, inter, hidden), &device).unwrap(),
            Tensor::randn(0f32, 0.5, (num, inter, hidden), &device).unwrap(),
            Tensor::randn(0f32, 0.5, (num, hidden, inter), &device).unwrap(),
            limit,
        )
        .unwrap()
    }

    fn routing(tokens: usize, k: usize, pick: impl Fn(usize, usize) -> u32) -> Tensor {
        let ids: Vec<u32> = (0..tokens)
            .flat_map(|t| (0..k).map(move |j| (t, j)))
            .map(|(t, j)| pick(t, j))
            .collect();
        Tensor::from_vec(ids, (tokens, k), &Device::Cpu).unwrap()
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

    #[test]
    fn auto_dispatch_threshold() {
        assert_eq!(Dispatch::Auto.resolve(SORT_THRESHOLD - 1), Dispatch::PerToken);
        assert_eq!(Dispatch::Auto.resolve(SORT_THRESHOLD), Dispatch::Sorted);
        assert_eq!(Dispatch::PerToken.resolve(1000), Dispatch::PerToken);
    }

    #[test]
    fn sorted_equals_per_token() {
        let moe = experts(8, 16, 24, None);
        let x = Tensor::randn(0f32, 1.0, (40, 16), &Device::Cpu).unwrap();
        // Experts 6 and 7 never used
        let idx = routing(40, 2, |t, j| ((t * 5 + j * 3) % 6) as u32);

        let a = moe.forward_with(&x, &idx, Dispatch::PerToken).unwrap();
        let b = moe.forward_with(&x, &idx, Dispatch::Sorted).unwrap();
        assert_eq!(a.dims(), &[40, 2, 16]);
        // Accumulation order differs between the paths
        assert!(max_diff(&a, &b) < 1e-4);
    }

    /// `down . (silu(gate . x) * up . x)` for one token and one expert.
    fn dense_expert(moe: &SwitchGlu, x: &Tensor, expert: usize) -> Tensor {
        let gate = x.matmul(&moe.gate_proj.get(expert).unwrap().t().unwrap()).unwrap();
        let up = x.matmul(&moe.up_proj.get(expert).unwrap().t().unwrap()).unwrap();
        let act = (silu(&gate).unwrap() * up).unwrap();
        act.matmul(&moe.down_proj.get(expert).unwrap().t().unwrap()).unwrap()
    }

    #[test]
    fn both_dispatches_match_dense_rows() {
        let moe = experts(6, 8, 12, None);
        for tokens in [1, 2, 4, 8, 16, 40] {
            let x = Tensor::randn(0f32, 1.0, (tokens, 8), &Device::Cpu).unwrap();
            let pick = |t: usize, j: usize| ((t * 7 + j * 2) % 5) as u32;
            let idx = routing(tokens, 2, pick);
            for dispatch in [Dispatch::PerToken, Dispatch::Sorted] {
                let out = moe.forward_with(&x, &idx, dispatch).unwrap();
                for t in 0..tokens {
                    let row = x.narrow(0, t, 1).unwrap();
                    for j in 0..2 {
                        let dense = dense_expert(&moe, &row, pick(t, j) as usize);
                        let got = out.get(t).unwrap().narrow(0, j, 1).unwrap();
                        assert!(
                            max_diff(&got, &dense) < 1e-4,
                            "{:?} token {} slot {} of {}",
                            dispatch,
                            t,
                            j,
                            tokens
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn token_result_independent_of_co_routed_tokens() {
        let moe = experts(4, 8, 12, None);
        let x = Tensor::randn(0f32, 1.0, (70, 8), &Device::Cpu).unwrap();
        let idx = routing(70, 1, |t, _| (t % 4) as u32);

        let batch = moe.forward(&x, &idx).unwrap();
        let alone = moe
            .forward(&x.narrow(0, 9, 1).unwrap(), &idx.narrow(0, 9, 1).unwrap())
            .unwrap();
        assert!(max_diff(&batch.narrow(0, 9, 1).unwrap(), &alone) < 1e-4);
    }

    #[test]
    fn single_expert_matches_dense_swiglu() {
        let moe = experts(3, 8, 12, None);
        let x = Tensor::randn(0f32, 1.0, (2, 8), &Device::Cpu).unwrap();
        let idx = routing(2, 1, |_, _| 2);
        let out = moe.forward(&x, &idx).unwrap().squeeze(1).unwrap();
        assert!(max_diff(&out, &dense_expert(&moe, &x, 2)) < 1e-4);
    }

    #[test]
    fn limit_clamps_gate() {
        let unclamped = experts(2, 4, 6, None);
        let loose = SwitchGlu {
            limit: Some(1e6),
            ..unclamped.clone()
        };
        let tight = SwitchGlu {
            limit: Some(1e-3),
            ..unclamped.clone()
        };
        let x = Tensor::randn(0f32, 4.0, (3, 4), &Device::Cpu).unwrap();
        let idx = routing(3, 2, |_, j| j as u32);

        let base = unclamped.forward(&x, &idx).unwrap();
        assert!(max_diff(&base, &loose.forward(&x, &idx).unwrap()) < 1e-6);
        assert!(max_diff(&base, &tight.forward(&x, &idx).unwrap()) > 1e-3);
    }

    #[test]
    fn out_of_range_expert_rejected() {
        let moe = experts(4, 8, 8, None);
        let x = Tensor::zeros((2, 8), DType::F32, &Device::Cpu).unwrap();
        let idx = routing(2, 2, |t, j| (t + j * 3) as u32);
        assert!(matches!(
            moe.forward(&x, &idx),
            Err(CadenceError::InvalidInput(_))
        ));
    }

    #[test]
    fn mismatched_weights_rejected() {
        let device = Device::Cpu;
        let gate = Tensor::zeros((2, 6, 4), DType::F32, &device).unwrap();
        let down = Tensor::zeros((2, 6, 4), DType::F32, &device).unwrap();
        assert!(SwitchGlu::new(gate.clone(), gate, down, None).is_err());
    }
}
