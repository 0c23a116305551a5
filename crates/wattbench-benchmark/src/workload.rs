use wattbench_core::{BenchmarkConfig, Result, WattBenchError};

/// Seam to the model under benchmark. Loading real models and
/// configuring ML frameworks is a collaborator concern; the scenarios
/// only need these operations.
pub trait Workload: Send {
    /// Allocate weights and state. Called once, before warmup.
    fn load(&mut self) -> Result<()>;

    /// Process the prompt batch once.
    fn prefill(&mut self) -> Result<()>;

    /// Generate one token.
    fn decode_token(&mut self) -> Result<()>;

    /// Run one optimizer step.
    fn train_step(&mut self) -> Result<()>;
}

const HIDDEN_SIZE: usize = 256;

/// Deterministic CPU stand-in for a model: dense matrix-vector kernels
/// sized from the benchmark config, so the harness runs end-to-end
/// without any ML framework installed.
pub struct SyntheticWorkload {
    prefill_tokens: usize,
    weights: Vec<f32>,
    activations: Vec<f32>,
}

impl SyntheticWorkload {
    pub fn new(config: &BenchmarkConfig) -> Self {
        Self {
            prefill_tokens: (config.batch_size * config.sequence_length) as usize,
            weights: Vec::new(),
            activations: vec![1.0; HIDDEN_SIZE],
        }
    }

    fn forward_tokens(&mut self, tokens: usize) -> Result<()> {
        if self.weights.is_empty() {
            return Err(WattBenchError::Workload(
                "workload must be loaded before running".to_string(),
            ));
        }

        let mut next = vec![0.0f32; HIDDEN_SIZE];
        for _ in 0..tokens {
            for (i, out) in next.iter_mut().enumerate() {
                let row = &self.weights[i * HIDDEN_SIZE..(i + 1) * HIDDEN_SIZE];
                *out = row
                    .iter()
                    .zip(&self.activations)
                    .map(|(w, x)| w * x)
                    .sum();
            }
            // keep activations bounded across tokens
            let norm = next.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-6);
            for (activation, value) in self.activations.iter_mut().zip(&next) {
                *activation = value / norm;
            }
        }
        std::hint::black_box(&self.activations);
        Ok(())
    }
}

impl Workload for SyntheticWorkload {
    fn load(&mut self) -> Result<()> {
        // deterministic pseudo-random weights, same model every run
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        self.weights = (0..HIDDEN_SIZE * HIDDEN_SIZE)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                ((state >> 33) as f32 / u32::MAX as f32) - 0.5
            })
            .collect();
        Ok(())
    }

    fn prefill(&mut self) -> Result<()> {
        self.forward_tokens(self.prefill_tokens)
    }

    fn decode_token(&mut self) -> Result<()> {
        self.forward_tokens(1)
    }

    fn train_step(&mut self) -> Result<()> {
        // forward plus a backward of roughly the same cost
        self.forward_tokens(self.prefill_tokens)?;
        self.forward_tokens(self.prefill_tokens)
    }
}
