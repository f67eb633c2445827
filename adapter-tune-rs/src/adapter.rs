//! Adapter parameter naming.
//!
//! Adapter prompts (`adapter_wte`) and their per-head gates (`gating_factor`)
//! are the only trainable parameters. Every piece of code that needs to tell
//! them apart from the frozen base goes through [`adapter_filter`].

/// Name fragment of the learned prompt embeddings.
pub const ADAPTER_PROMPT: &str = "adapter_wte";
/// Name fragment of the per-head gates.
pub const ADAPTER_GATE: &str = "gating_factor";

/// Whether the parameter called `name` belongs to the adapter.
///
/// # Example
///
/// ```rust
/// use adapter_tune_rs::adapter::adapter_filter;
///
/// assert!(adapter_filter("transformer.h.3.attn.gating_factor"));
/// assert!(!adapter_filter("transformer.h.3.attn.attn.weight"));
/// ```
#[must_use]
pub fn adapter_filter(name: &str) -> bool {
    name.contains(ADAPTER_PROMPT) || name.contains(ADAPTER_GATE)
}

/// Parameter name of the prompt embedding of block `layer`.
#[must_use]
pub fn prompt_name(layer: usize) -> String {
    format!("transformer.h.{layer}.attn.{ADAPTER_PROMPT}.weight")
}

/// Parameter name of the gate of block `layer`.
#[must_use]
pub fn gate_name(layer: usize) -> String {
    format!("transformer.h.{layer}.attn.{ADAPTER_GATE}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_accepts_adapter_names() {
        assert!(adapter_filter(&prompt_name(2)));
        assert!(adapter_filter(&gate_name(15)));
    }

    #[test]
    fn test_filter_rejects_base_names() {
        for name in [
            "transformer.wte.weight",
            "transformer.h.0.norm_1.weight",
            "transformer.h.4.attn.attn.bias",
            "transformer.h.4.mlp.proj.weight",
            "transformer.ln_f.bias",
            "lm_head.weight",
        ] {
            assert!(!adapter_filter(name), "{name}");
        }
    }
}
