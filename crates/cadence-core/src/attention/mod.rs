//! Attention masking and scaled dot-product attention.
//!
//! - [`build_attention_mask`] - derives the mask for new queries from the
//!   layer cache's [`KeyLayout`](crate::cache::KeyLayout)
//! - [`scaled_dot_product_attention`] - grouped-query attention with an
//!   optional mask and logit soft-capping

mod mask;
mod sdpa;

pub use mask::{build_attention_mask, AttentionMask};
pub use sdpa::{repeat_kv, scaled_dot_product_attention};
