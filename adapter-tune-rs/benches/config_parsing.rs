use adapter_tune_rs::config::{FinetuneConfig, Hyperparameters, TrainingConfig};
use adapter_tune_rs::data::{BatchSampler, Dataset, TokenizedExample};
use candle_core::Device;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

// Small YAML config for basic benchmarking
const SMALL_YAML: &str = r#"
data_dir: data/alpaca
checkpoint_dir: checkpoints/stabilityai/stablelm-base-alpha-3b
out_dir: out/adapter/alpaca
precision: bf16-mixed
devices: 1
seed: 1337

training:
  eval_interval: 600
  save_interval: 1000
  eval_iters: 100
  log_interval: 1
  learning_rate: 9.0e-3
  batch_size: 64
  micro_batch_size: 4
  epoch_size: 50000
  num_epochs: 5
  weight_decay: 0.02

monitor:
  window_size: 50
  time_unit: seconds
  device_name: a100
  progress_bar: false

validation:
  max_new_tokens: 100
  temperature: 0.8
"#;

// Invalid YAML for error path benchmarking
const INVALID_YAML: &str = r#"
data_dir: ""
training:
  batch_size: 6
  micro_batch_size: 4
"#;

fn bench_config_from_yaml(c: &mut Criterion) {
    c.bench_function("config_from_yaml_small", |b| {
        b.iter(|| {
            let config: FinetuneConfig = black_box(serde_yaml::from_str(SMALL_YAML).unwrap());
            black_box(config);
        });
    });
}

fn bench_config_validate(c: &mut Criterion) {
    c.bench_function("config_validate", |b| {
        let config = FinetuneConfig::default();
        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result).unwrap();
        });
    });
}

fn bench_config_validate_invalid(c: &mut Criterion) {
    c.bench_function("config_validate_invalid", |b| {
        let config: FinetuneConfig = serde_yaml::from_str(INVALID_YAML).unwrap();
        b.iter(|| {
            let result = black_box(config.validate());
            black_box(result.is_err());
        });
    });
}

fn bench_hyperparameters(c: &mut Criterion) {
    let mut group = c.benchmark_group("hyperparameters_derive");
    let training = TrainingConfig::default();
    for devices in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(devices), &devices, |b, &devices| {
            b.iter(|| black_box(Hyperparameters::derive(black_box(&training), devices).unwrap()));
        });
    }
    group.finish();
}

fn bench_presets(c: &mut Criterion) {
    for preset in ["stablelm-3b", "pythia-410m", "stablelm-3b-accelerator"] {
        c.bench_function(&format!("preset_{preset}"), |b| {
            b.iter(|| black_box(FinetuneConfig::from_preset(black_box(preset)).unwrap()));
        });
    }
}

fn bench_batch_sampling(c: &mut Criterion) {
    let examples = (0..1024u32)
        .map(|i| {
            let len = 32 + (i as usize * 7) % 224;
            TokenizedExample {
                input_ids: (0..len as u32).map(|t| (t + i) % 50_000).collect(),
                labels: (0..len as i64).collect(),
            }
        })
        .collect();
    let data = Dataset::from_examples(examples).unwrap();

    let mut group = c.benchmark_group("batch_sampling");
    for (name, fixed) in [("dynamic", None), ("fixed_256", Some(256))] {
        group.bench_function(name, |b| {
            let mut sampler = BatchSampler::new(4, 1337, Device::Cpu);
            if let Some(length) = fixed {
                sampler = sampler.with_fixed_length(length);
            }
            b.iter(|| black_box(sampler.sample(&data).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_config_from_yaml,
    bench_config_validate,
    bench_config_validate_invalid,
    bench_hyperparameters,
    bench_presets,
    bench_batch_sampling,
);
criterion_main!(benches);
