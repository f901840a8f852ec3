//! Fully connected networks and their optimiser.
//!
//! Small dense MLPs are all the control policies need, so they are plain
//! `Vec<f64>` layers with a hand-written backward pass. Parameters are
//! addressed as one flat vector, layer by layer (weights, then biases), which
//! is also the layout [`Adam`] works on.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{Activation, NetworkConfig};

/// One affine layer. `weights[i * n_out + j]` connects input `i` to output `j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub n_in: usize,
    pub n_out: usize,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
}

impl Dense {
    /// Glorot-uniform weights, zero biases.
    fn new(n_in: usize, n_out: usize, rng: &mut impl Rng) -> Self {
        let limit = (6.0 / (n_in + n_out) as f64).sqrt();
        Self {
            n_in,
            n_out,
            weights: (0..n_in * n_out).map(|_| rng.gen_range(-limit..limit)).collect(),
            biases: vec![0.0; n_out],
        }
    }

    fn n_params(&self) -> usize {
        self.weights.len() + self.biases.len()
    }

    fn affine(&self, x: &[f64]) -> Vec<f64> {
        let mut z = self.biases.clone();
        for (i, xi) in x.iter().enumerate() {
            let row = &self.weights[i * self.n_out..(i + 1) * self.n_out];
            for (zj, wij) in z.iter_mut().zip(row) {
                *zj += xi * wij;
            }
        }
        z
    }
}

/// Intermediate values of one forward pass, needed for backpropagation.
#[derive(Debug, Clone)]
pub struct ForwardCache {
    /// Input of every layer.
    inputs: Vec<Vec<f64>>,
    /// Pre-activation output of every layer.
    pre_activations: Vec<Vec<f64>>,
}

/// Multilayer perceptron with a shared hidden activation and a linear output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    pub layers: Vec<Dense>,
    pub activation: Activation,
}

impl Mlp {
    /// Network with the given layer widths, input first.
    pub fn new(sizes: &[usize], activation: Activation, rng: &mut impl Rng) -> Self {
        Self {
            layers: sizes
                .windows(2)
                .map(|w| Dense::new(w[0], w[1], rng))
                .collect(),
            activation,
        }
    }

    /// `n_in -> n_layers x n_neurons -> n_out`.
    pub fn from_config(n_in: usize, n_out: usize, config: &NetworkConfig, rng: &mut impl Rng) -> Self {
        let mut sizes = vec![n_in];
        sizes.extend(std::iter::repeat(config.n_neurons).take(config.n_layers));
        sizes.push(n_out);
        Self::new(&sizes, config.activation, rng)
    }

    pub fn n_inputs(&self) -> usize {
        self.layers.first().map_or(0, |l| l.n_in)
    }

    pub fn n_outputs(&self) -> usize {
        self.layers.last().map_or(0, |l| l.n_out)
    }

    pub fn n_params(&self) -> usize {
        self.layers.iter().map(Dense::n_params).sum()
    }

    /// Multiply the output layer by `factor`; a small factor starts the
    /// network close to a zero output.
    pub fn scale_output(&mut self, factor: f64) {
        if let Some(last) = self.layers.last_mut() {
            last.weights.iter_mut().for_each(|w| *w *= factor);
            last.biases.iter_mut().for_each(|b| *b *= factor);
        }
    }

    pub fn forward(&self, x: &[f64]) -> Vec<f64> {
        self.forward_cached(x).0
    }

    pub fn forward_cached(&self, x: &[f64]) -> (Vec<f64>, ForwardCache) {
        let mut cache = ForwardCache {
            inputs: Vec::with_capacity(self.layers.len()),
            pre_activations: Vec::with_capacity(self.layers.len()),
        };
        let mut a = x.to_vec();
        let last = self.layers.len().saturating_sub(1);
        for (idx, layer) in self.layers.iter().enumerate() {
            let z = layer.affine(&a);
            cache.inputs.push(a);
            a = if idx == last {
                z.clone()
            } else {
                z.iter().map(|&v| self.activation.apply(v)).collect()
            };
            cache.pre_activations.push(z);
        }
        (a, cache)
    }

    /// Accumulate `d loss / d params` into `grad`, given `d loss / d output`.
    pub fn backward(&self, cache: &ForwardCache, d_output: &[f64], grad: &mut [f64]) {
        let mut offsets = Vec::with_capacity(self.layers.len());
        let mut offset = 0;
        for layer in &self.layers {
            offsets.push(offset);
            offset += layer.n_params();
        }

        let last = self.layers.len().saturating_sub(1);
        let mut delta = d_output.to_vec();
        for idx in (0..self.layers.len()).rev() {
            let layer = &self.layers[idx];
            if idx != last {
                for (d, &z) in delta.iter_mut().zip(&cache.pre_activations[idx]) {
                    *d *= self.activation.derivative(z);
                }
            }

            let input = &cache.inputs[idx];
            let base = offsets[idx];
            for (i, &xi) in input.iter().enumerate() {
                let row = base + i * layer.n_out;
                for (j, &dj) in delta.iter().enumerate() {
                    grad[row + j] += xi * dj;
                }
            }
            let bias_base = base + layer.weights.len();
            for (j, &dj) in delta.iter().enumerate() {
                grad[bias_base + j] += dj;
            }

            if idx > 0 {
                let mut prev = vec![0.0; layer.n_in];
                for (i, p) in prev.iter_mut().enumerate() {
                    let row = &layer.weights[i * layer.n_out..(i + 1) * layer.n_out];
                    *p = row.iter().zip(&delta).map(|(w, d)| w * d).sum();
                }
                delta = prev;
            }
        }
    }

    /// `params -= update`, in flat parameter order.
    pub fn apply_update(&mut self, update: &[f64]) {
        let mut offset = 0;
        for layer in &mut self.layers {
            for w in &mut layer.weights {
                *w -= update[offset];
                offset += 1;
            }
            for b in &mut layer.biases {
                *b -= update[offset];
                offset += 1;
            }
        }
    }

    pub fn is_finite(&self) -> bool {
        self.layers
            .iter()
            .all(|l| l.weights.iter().chain(&l.biases).all(|v| v.is_finite()))
    }
}

// ---------------------------------------------------------------------------
// Adam
// ---------------------------------------------------------------------------

/// Adam optimiser state. Serialised with checkpoints so a resumed run
/// continues with the same moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: u32,
}

impl Adam {
    pub fn new(n_params: usize, lr: f64) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            m: vec![0.0; n_params],
            v: vec![0.0; n_params],
            t: 0,
        }
    }

    pub fn n_params(&self) -> usize {
        self.m.len()
    }

    pub fn steps(&self) -> u32 {
        self.t
    }

    /// Consume one gradient and return the update to subtract from the parameters.
    pub fn step(&mut self, grads: &[f64]) -> Vec<f64> {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        grads
            .iter()
            .zip(self.m.iter_mut().zip(self.v.iter_mut()))
            .map(|(&g, (m, v))| {
                *m = self.beta1 * *m + (1.0 - self.beta1) * g;
                *v = self.beta2 * *v + (1.0 - self.beta2) * g * g;
                self.lr * (*m / bc1) / ((*v / bc2).sqrt() + self.eps)
            })
            .collect()
    }
}
