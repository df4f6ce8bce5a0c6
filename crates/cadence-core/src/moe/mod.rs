//! Mixture-of-experts layers.
//!
//! - [`SwitchGlu`] - per-token SwiGLU experts selected by routing indices
//! - [`MoeBlock`] - softmax top-k gate feeding a [`SwitchGlu`]
//!
//! Routing indices are `u32` tensors `[tokens, top_k]`.

mod gate;
mod switch;

pub use gate::{top_k_routing, MoeBlock, Routing};
pub use switch::{Dispatch, SwitchGlu, SORT_THRESHOLD};
