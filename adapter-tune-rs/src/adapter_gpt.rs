//! GPT-NeoX decoder with learned adapter prompts.
//!
//! Every block from `adapter_start_layer` on owns a prompt of
//! `adapter_prompt_length` embeddings and a per-head gate. The block's query
//! attends to the keys and values the frozen attention projection produces
//! for that prompt, unmasked and without rotary embeddings, and the result is
//! added to the regular attention output scaled by the gate. Gates start at
//! zero, so a freshly built model computes exactly what the base model does.
//!
//! Base weights live in one [`VarMap`] and are held by the layers as detached
//! views of its storage: they never enter the autograd graph, while
//! [`AdapterModel::load_state_dict`] still overwrites them in place. Adapter
//! parameters live in a second, `f32` [`VarMap`].

use std::collections::HashMap;
use std::sync::MutexGuard;

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{init, Init, VarBuilder, VarMap};

use crate::adapter::{ADAPTER_GATE, ADAPTER_PROMPT};
use crate::error::{FinetuneError, Result};
use crate::flops::FlopCounter;
use crate::gpt_common::{apply_partial_rope, causal_mask, softmax_last_dim, RopeCache};
use crate::model::{AdapterModel, LoadReport, ModelConfig};
use crate::normalization::LayerNorm;

/// Per-forward flags threaded through the layers.
#[derive(Clone, Copy)]
struct Pass<'a> {
    flops: &'a FlopCounter,
    training: bool,
}

fn param(tensor: &Tensor, training: bool) -> Tensor {
    if training {
        tensor.clone()
    } else {
        tensor.detach()
    }
}

/// Frozen linear layer that reports its matmul cost.
struct CountedLinear {
    weight: Tensor,
    bias: Option<Tensor>,
    in_dim: usize,
    out_dim: usize,
}

impl CountedLinear {
    fn new(in_dim: usize, out_dim: usize, bias: bool, vb: &VarBuilder) -> Result<Self> {
        let weight = vb
            .get_with_hints((out_dim, in_dim), "weight", init::DEFAULT_KAIMING_NORMAL)?
            .detach();
        let bias = if bias {
            Some(vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?.detach())
        } else {
            None
        };
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    /// `grad_path` says whether `x` itself carries a gradient.
    fn forward(&self, x: &Tensor, flops: &FlopCounter, grad_path: bool) -> Result<Tensor> {
        let w = self.weight.to_dtype(x.dtype())?;
        let w = match *x.dims() {
            [b1, b2, _, _] => w.broadcast_left((b1, b2))?.t()?,
            [b, _, _] => w.broadcast_left(b)?.t()?,
            _ => w.t()?,
        };
        let y = x.matmul(&w)?;

        let rows = x.elem_count() / self.in_dim;
        let cost = (2 * rows * self.in_dim * self.out_dim) as u64;
        flops.record(cost, if grad_path { cost } else { 0 });

        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(&bias.to_dtype(y.dtype())?)?),
            None => Ok(y),
        }
    }
}

fn layer_norm(size: usize, eps: f64, vb: &VarBuilder) -> Result<LayerNorm> {
    let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?.detach();
    let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?.detach();
    Ok(LayerNorm::new(weight, bias, eps))
}

struct AdapterPrompt {
    wte: Tensor,
    gate: Tensor,
}

struct Attention {
    attn: CountedLinear,
    proj: CountedLinear,
    adapter: Option<AdapterPrompt>,
    n_head: usize,
    head_size: usize,
    rope_n_elem: usize,
}

impl Attention {
    fn split_heads(qkv: &Tensor, b: usize, t: usize, n_head: usize, hs: usize) -> Result<[Tensor; 3]> {
        let qkv = qkv.reshape((b, t, n_head, 3 * hs))?.transpose(1, 2)?;
        Ok([
            qkv.narrow(D::Minus1, 0, hs)?.contiguous()?,
            qkv.narrow(D::Minus1, hs, hs)?.contiguous()?,
            qkv.narrow(D::Minus1, 2 * hs, hs)?.contiguous()?,
        ])
    }

    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        pass: Pass<'_>,
        grad_path: bool,
    ) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let (nh, hs) = (self.n_head, self.head_size);
        let scale = 1.0 / (hs as f64).sqrt();

        let qkv = self.attn.forward(x, pass.flops, grad_path)?;
        let [q, k, v] = Self::split_heads(&qkv, b, t, nh, hs)?;
        let q = apply_partial_rope(&q, cos, sin, self.rope_n_elem)?;
        let k = apply_partial_rope(&k, cos, sin, self.rope_n_elem)?;

        let att = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let att = softmax_last_dim(&att.broadcast_add(mask)?)?;
        let mut y = att.matmul(&v)?;
        let cost = (4 * b * nh * t * t * hs) as u64;
        pass.flops.record(cost, if grad_path { 2 * cost } else { 0 });

        if let Some(adapter) = &self.adapter {
            let prefix = param(&adapter.wte, pass.training).to_dtype(x.dtype())?;
            let at = prefix.dim(0)?;
            let prefix = prefix.reshape((1, at, c))?;
            let akv = self.attn.forward(&prefix, pass.flops, pass.training)?;
            let [_, ak, av] = Self::split_heads(&akv, 1, at, nh, hs)?;
            let ak = ak.broadcast_as((b, nh, at, hs))?.contiguous()?;
            let av = av.broadcast_as((b, nh, at, hs))?.contiguous()?;

            let ascores = (q.matmul(&ak.t()?.contiguous()?)? * scale)?;
            let ay = softmax_last_dim(&ascores)?.matmul(&av)?;
            let cost = (4 * b * nh * t * at * hs) as u64;
            pass.flops.record(cost, if pass.training { 2 * cost } else { 0 });

            let gate = param(&adapter.gate, pass.training).to_dtype(y.dtype())?;
            y = (y + ay.broadcast_mul(&gate)?)?;
        }

        let y = y.transpose(1, 2)?.reshape((b, t, c))?;
        let out_grad = grad_path || (self.adapter.is_some() && pass.training);
        self.proj.forward(&y, pass.flops, out_grad)
    }
}

struct Mlp {
    fc: CountedLinear,
    proj: CountedLinear,
}

impl Mlp {
    fn forward(&self, x: &Tensor, flops: &FlopCounter, grad_path: bool) -> Result<Tensor> {
        // tanh approximation of GELU
        let h = self.fc.forward(x, flops, grad_path)?.gelu()?;
        self.proj.forward(&h, flops, grad_path)
    }
}

struct Block {
    norm_1: LayerNorm,
    attn: Attention,
    norm_2: LayerNorm,
    mlp: Mlp,
    parallel_residual: bool,
}

impl Block {
    /// Returns the block output and whether it carries a gradient.
    fn forward(
        &self,
        x: &Tensor,
        cos: &Tensor,
        sin: &Tensor,
        mask: &Tensor,
        pass: Pass<'_>,
        grad_path: bool,
    ) -> Result<(Tensor, bool)> {
        let out_grad = grad_path || (self.attn.adapter.is_some() && pass.training);
        let h = self
            .attn
            .forward(&self.norm_1.forward(x)?, cos, sin, mask, pass, grad_path)?;
        let out = if self.parallel_residual {
            let m = self.mlp.forward(&self.norm_2.forward(x)?, pass.flops, grad_path)?;
            ((x + h)? + m)?
        } else {
            let x = (x + h)?;
            let m = self.mlp.forward(&self.norm_2.forward(&x)?, pass.flops, out_grad)?;
            (x + m)?
        };
        Ok((out, out_grad))
    }
}

/// GPT-NeoX with adapter prompts on the upper blocks.
pub struct AdapterGpt {
    config: ModelConfig,
    device: Device,
    compute_dtype: DType,
    base: VarMap,
    adapters: VarMap,
    wte: Tensor,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: CountedLinear,
    rope: RopeCache,
    training: bool,
    flops: FlopCounter,
}

fn lock(map: &VarMap) -> Result<MutexGuard<'_, HashMap<String, Var>>> {
    map.data()
        .lock()
        .map_err(|_| FinetuneError::Model("parameter store lock poisoned".into()))
}

impl AdapterGpt {
    /// Build a randomly initialized model.
    ///
    /// Base parameters are stored as `param_dtype` and activations are
    /// computed in `compute_dtype`. Adapter parameters are always `f32`.
    ///
    /// # Errors
    ///
    /// Returns an error for an inconsistent configuration or a failed allocation.
    pub fn new(config: &ModelConfig, param_dtype: DType, compute_dtype: DType, device: &Device) -> Result<Self> {
        config.validate()?;
        let base = VarMap::new();
        let adapters = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, param_dtype, device);
        let avb = VarBuilder::from_varmap(&adapters, DType::F32, device);

        let c = config.n_embd;
        let wte = vb
            .pp("transformer")
            .pp("wte")
            .get_with_hints(
                (config.padded_vocab_size(), c),
                "weight",
                Init::Randn {
                    mean: 0.0,
                    stdev: 0.02,
                },
            )?
            .detach();

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            let bvb = vb.pp("transformer").pp("h").pp(i);
            let adapter = if i >= config.adapter_start_layer {
                let attn_vb = avb.pp("transformer").pp("h").pp(i).pp("attn");
                let wte = attn_vb.pp(ADAPTER_PROMPT).get_with_hints(
                    (config.adapter_prompt_length, c),
                    "weight",
                    Init::Randn {
                        mean: 0.0,
                        stdev: 1.0,
                    },
                )?;
                let gate = attn_vb.get_with_hints((1, config.n_head, 1, 1), ADAPTER_GATE, Init::Const(0.0))?;
                Some(AdapterPrompt { wte, gate })
            } else {
                None
            };

            blocks.push(Block {
                norm_1: layer_norm(c, config.norm_eps, &bvb.pp("norm_1"))?,
                attn: Attention {
                    attn: CountedLinear::new(c, 3 * c, config.bias, &bvb.pp("attn").pp("attn"))?,
                    proj: CountedLinear::new(c, c, config.bias, &bvb.pp("attn").pp("proj"))?,
                    adapter,
                    n_head: config.n_head,
                    head_size: config.head_size(),
                    rope_n_elem: config.rope_n_elem(),
                },
                norm_2: layer_norm(c, config.norm_eps, &bvb.pp("norm_2"))?,
                mlp: Mlp {
                    fc: CountedLinear::new(c, config.intermediate_size(), config.bias, &bvb.pp("mlp").pp("fc"))?,
                    proj: CountedLinear::new(config.intermediate_size(), c, config.bias, &bvb.pp("mlp").pp("proj"))?,
                },
                parallel_residual: config.parallel_residual,
            });
        }

        let ln_f = layer_norm(c, config.norm_eps, &vb.pp("transformer").pp("ln_f"))?;
        let lm_head = CountedLinear::new(c, config.padded_vocab_size(), false, &vb.pp("lm_head"))?;
        let rope = RopeCache::new(config.block_size, config.rope_n_elem(), config.rope_base, device)?;

        tracing::debug!(
            "Built {} with {} blocks ({} adapted), param dtype {:?}, compute dtype {:?}",
            config.name,
            config.n_layer,
            config.n_layer.saturating_sub(config.adapter_start_layer),
            param_dtype,
            compute_dtype
        );

        Ok(Self {
            config: config.clone(),
            device: device.clone(),
            compute_dtype,
            base,
            adapters,
            wte,
            blocks,
            ln_f,
            lm_head,
            rope,
            training: true,
            flops: FlopCounter::new(),
        })
    }

    /// Activation dtype.
    #[must_use]
    pub fn compute_dtype(&self) -> DType {
        self.compute_dtype
    }
}

impl AdapterModel for AdapterGpt {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn forward(&self, idx: &Tensor, max_seq_length: Option<usize>) -> Result<Tensor> {
        let (b, t) = idx.dims2()?;
        let limit = max_seq_length
            .unwrap_or(self.config.block_size)
            .min(self.config.block_size);
        if t > limit {
            return Err(FinetuneError::Model(format!(
                "cannot forward sequence of length {t}, max seq length is only {limit}"
            )));
        }

        let dtype = self.compute_dtype;
        let (cos, sin) = self.rope.tables(t, dtype)?;
        let mask = causal_mask(t, dtype, &self.device)?;
        let pass = Pass {
            flops: &self.flops,
            training: self.training,
        };

        let mut x = self
            .wte
            .index_select(&idx.flatten_all()?, 0)?
            .reshape((b, t, self.config.n_embd))?
            .to_dtype(dtype)?;
        let mut grad_path = false;
        for block in &self.blocks {
            (x, grad_path) = block.forward(&x, &cos, &sin, &mask, pass, grad_path)?;
        }
        let x = self.ln_f.forward(&x)?;
        self.lm_head.forward(&x, &self.flops, grad_path)
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn named_parameters(&self) -> Result<Vec<(String, Tensor)>> {
        let mut params: Vec<(String, Tensor)> = lock(&self.base)?
            .iter()
            .chain(lock(&self.adapters)?.iter())
            .map(|(name, var)| (name.clone(), var.as_tensor().detach()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn trainable_parameters(&self) -> Result<Vec<(String, Var)>> {
        let mut params: Vec<(String, Var)> = lock(&self.adapters)?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(params)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<LoadReport> {
        let base = lock(&self.base)?;
        let adapters = lock(&self.adapters)?;
        let mut report = LoadReport::default();

        for (name, var) in base.iter().chain(adapters.iter()) {
            let Some(src) = state.get(name) else {
                report.missing.push(name.clone());
                continue;
            };
            if src.dims() != var.dims() {
                return Err(FinetuneError::Checkpoint(format!(
                    "size mismatch for {name}: checkpoint has {:?}, model has {:?}",
                    src.dims(),
                    var.dims()
                )));
            }
            var.set(&src.to_dtype(var.dtype())?.to_device(&self.device)?)?;
            report.loaded.push(name.clone());
        }
        report.unexpected = state
            .keys()
            .filter(|name| !base.contains_key(*name) && !adapters.contains_key(*name))
            .cloned()
            .collect();

        report.loaded.sort();
        report.missing.sort();
        report.unexpected.sort();
        Ok(report)
    }

    fn flop_counter(&self) -> &FlopCounter {
        &self.flops
    }
}
