//! Small dense feed-forward network with Adam and binary cross-entropy.
//!
//! Just enough machinery for the cluster-quality regressor: dense layers over
//! `ndarray` matrices, ReLU/sigmoid activations, mini-batch backprop, and a
//! `fit` loop with a trailing validation split and early stopping on
//! validation loss.

use ndarray::{Array1, Array2, ArrayView1, Axis, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{Error, Result};

/// Probability clamp used when evaluating the loss.
const BCE_CLAMP: f64 = 1e-7;

/// Elementwise activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
}

impl Activation {
    #[inline]
    fn apply(self, z: f64) -> f64 {
        match self {
            Activation::Linear => z,
            Activation::Relu => z.max(0.0),
            Activation::Sigmoid => sigmoid(z),
        }
    }

    /// Derivative expressed through the activation output `a`.
    #[inline]
    fn derivative_from_output(self, a: f64) -> f64 {
        match self {
            Activation::Linear => 1.0,
            Activation::Relu => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            Activation::Sigmoid => a * (1.0 - a),
        }
    }
}

#[inline]
fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// Binary cross-entropy of one prediction, with `p` clamped away from 0 and 1.
pub fn binary_cross_entropy(p: f64, y: f64) -> f64 {
    let p = p.clamp(BCE_CLAMP, 1.0 - BCE_CLAMP);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Fully connected layer: `activation(weights . x + bias)`.
///
/// `weights` is `units x inputs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
    pub activation: Activation,
}

impl Dense {
    /// Glorot-uniform weights, zero bias.
    pub fn glorot(
        inputs: usize,
        units: usize,
        activation: Activation,
        rng: &mut StdRng,
    ) -> Result<Self> {
        let limit = (6.0 / (inputs + units).max(1) as f64).sqrt();
        let dist = Uniform::new_inclusive(-limit, limit)
            .map_err(|e| Error::InvalidConfig(format!("glorot init: {e}")))?;
        Ok(Self {
            weights: Array2::from_shape_fn((units, inputs), |_| dist.sample(rng)),
            bias: Array1::zeros(units),
            activation,
        })
    }

    pub fn inputs(&self) -> usize {
        self.weights.ncols()
    }

    pub fn units(&self) -> usize {
        self.weights.nrows()
    }

    fn validate(&self) -> Result<()> {
        if self.bias.len() != self.units() {
            return Err(Error::dims(self.units(), self.bias.len()));
        }
        if self.units() == 0 || self.inputs() == 0 {
            return Err(Error::InvalidConfig("layer with an empty dimension".to_string()));
        }
        Ok(())
    }

    fn forward(&self, x: ArrayView1<'_, f64>) -> Array1<f64> {
        let mut z = self.weights.dot(&x) + &self.bias;
        z.mapv_inplace(|v| self.activation.apply(v));
        z
    }
}

/// Tensors shaped like one [`Dense`] layer: gradients or Adam moments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerTensors {
    pub weights: Array2<f64>,
    pub bias: Array1<f64>,
}

impl LayerTensors {
    fn zeros_like(layer: &Dense) -> Self {
        Self {
            weights: Array2::zeros(layer.weights.raw_dim()),
            bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }

    fn matches(&self, layer: &Dense) -> bool {
        self.weights.dim() == layer.weights.dim() && self.bias.len() == layer.bias.len()
    }
}

/// Stack of [`Dense`] layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mlp {
    layers: Vec<Dense>,
}

impl Mlp {
    /// Build from `(units, activation)` pairs applied in order to `inputs` features.
    pub fn new(
        inputs: usize,
        layout: &[(usize, Activation)],
        rng: &mut StdRng,
    ) -> Result<Self> {
        if inputs == 0 || layout.is_empty() {
            return Err(Error::InvalidConfig(
                "network needs at least one input and one layer".to_string(),
            ));
        }
        let mut layers = Vec::with_capacity(layout.len());
        let mut fan_in = inputs;
        for &(units, activation) in layout {
            if units == 0 {
                return Err(Error::InvalidConfig("layer with zero units".to_string()));
            }
            layers.push(Dense::glorot(fan_in, units, activation, rng)?);
            fan_in = units;
        }
        Ok(Self { layers })
    }

    /// Rebuild from stored layers, checking that shapes chain.
    pub fn from_layers(layers: Vec<Dense>) -> Result<Self> {
        if layers.is_empty() {
            return Err(Error::InvalidConfig("network has no layers".to_string()));
        }
        for l in &layers {
            l.validate()?;
        }
        for pair in layers.windows(2) {
            if pair[1].inputs() != pair[0].units() {
                return Err(Error::dims(pair[0].units(), pair[1].inputs()));
            }
        }
        Ok(Self { layers })
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, Dense::inputs)
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Dense::units)
    }

    /// Total trainable parameters.
    pub fn param_count(&self) -> usize {
        self.layers.iter().map(|l| l.weights.len() + l.bias.len()).sum()
    }

    /// Forward pass for one sample.
    pub fn forward(&self, x: &[f64]) -> Result<Vec<f64>> {
        if x.len() != self.input_dim() {
            return Err(Error::dims(self.input_dim(), x.len()));
        }
        let mut cur = ArrayView1::from(x).to_owned();
        for l in &self.layers {
            cur = l.forward(cur.view());
        }
        Ok(cur.to_vec())
    }

    // Activations of every layer, input included.
    fn trace(&self, x: &[f64]) -> Vec<Array1<f64>> {
        let mut acts = Vec::with_capacity(self.layers.len() + 1);
        acts.push(ArrayView1::from(x).to_owned());
        for l in &self.layers {
            if let Some(prev) = acts.last() {
                let out = l.forward(prev.view());
                acts.push(out);
            }
        }
        acts
    }

    fn zero_grads(&self) -> Vec<LayerTensors> {
        self.layers.iter().map(LayerTensors::zeros_like).collect()
    }

    /// Add the BCE gradient for one sample into `grads`; returns the sample loss.
    ///
    /// Assumes a single sigmoid output unit, where `dL/dz = p - y`.
    fn accumulate(&self, x: &[f64], y: f64, grads: &mut [LayerTensors]) -> f64 {
        let acts = self.trace(x);
        let p = acts.last().and_then(|a| a.first()).copied().unwrap_or(0.5);
        let loss = binary_cross_entropy(p, y);

        let mut delta = Array1::from_elem(1, p - y);
        for li in (0..self.layers.len()).rev() {
            let layer = &self.layers[li];
            let input = &acts[li];
            let g = &mut grads[li];
            let outer = delta
                .view()
                .insert_axis(Axis(1))
                .dot(&input.view().insert_axis(Axis(0)));
            g.weights += &outer;
            g.bias += &delta;
            if li == 0 {
                break;
            }
            let below = self.layers[li - 1].activation;
            let mut prev = layer.weights.t().dot(&delta);
            Zip::from(&mut prev)
                .and(input)
                .for_each(|d, &a| *d *= below.derivative_from_output(a));
            delta = prev;
        }
        loss
    }

    /// Mean BCE over a labelled set. Empty sets have zero loss.
    pub fn mean_loss<X: AsRef<[f64]>>(&self, xs: &[X], ys: &[f64]) -> Result<f64> {
        if xs.is_empty() {
            return Ok(0.0);
        }
        let mut total = 0.0;
        for (x, &y) in xs.iter().zip(ys) {
            let p = self.forward(x.as_ref())?;
            total += binary_cross_entropy(p.first().copied().unwrap_or(0.5), y);
        }
        Ok(total / xs.len() as f64)
    }
}

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }
}

/// Adam moment estimates, one [`LayerTensors`] pair per layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub config: AdamConfig,
    pub step: u64,
    pub m: Vec<LayerTensors>,
    pub v: Vec<LayerTensors>,
}

impl Adam {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            step: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    // Moments that no longer fit the network are reset.
    fn ensure_shape(&mut self, net: &Mlp) {
        let fits = |ms: &[LayerTensors]| {
            ms.len() == net.layers.len()
                && ms.iter().zip(&net.layers).all(|(m, l)| m.matches(l))
        };
        if !(fits(&self.m) && fits(&self.v)) {
            self.m = net.zero_grads();
            self.v = net.zero_grads();
            self.step = 0;
        }
    }

    /// Apply one bias-corrected update with the given (already averaged) gradients.
    fn apply(&mut self, net: &mut Mlp, grads: &[LayerTensors]) {
        self.ensure_shape(net);
        self.step += 1;
        let t = self.step.min(i32::MAX as u64) as i32;
        let c = self.config;
        let bc1 = 1.0 - c.beta1.powi(t);
        let bc2 = 1.0 - c.beta2.powi(t);

        let update = |p: &mut f64, m: &mut f64, v: &mut f64, g: &f64| {
            *m = c.beta1 * *m + (1.0 - c.beta1) * g;
            *v = c.beta2 * *v + (1.0 - c.beta2) * g * g;
            *p -= c.learning_rate * (*m / bc1) / ((*v / bc2).sqrt() + c.epsilon);
        };
        let layers = net.layers.iter_mut().zip(self.m.iter_mut().zip(self.v.iter_mut()));
        for ((layer, (m, v)), g) in layers.zip(grads) {
            Zip::from(&mut layer.weights)
                .and(&mut m.weights)
                .and(&mut v.weights)
                .and(&g.weights)
                .for_each(update);
            Zip::from(&mut layer.bias)
                .and(&mut m.bias)
                .and(&mut v.bias)
                .and(&g.bias)
                .for_each(update);
        }
    }
}

/// Mini-batch training schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Upper bound on epochs.
    pub epochs: usize,
    pub batch_size: usize,
    /// Fraction of rows, taken from the end of the input, held out for validation.
    pub validation_split: f64,
    /// Epochs without improvement before stopping.
    pub patience: usize,
    /// Minimum loss decrease that counts as improvement.
    pub min_delta: f64,
    /// Reshuffle training rows every epoch.
    pub shuffle: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            epochs: 50,
            batch_size: 32,
            validation_split: 0.2,
            patience: 5,
            min_delta: 1e-4,
            shuffle: true,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 || self.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "epochs and batch_size must be >= 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(Error::InvalidConfig(
                "validation_split must be in [0, 1)".to_string(),
            ));
        }
        if !(self.min_delta.is_finite() && self.min_delta >= 0.0) {
            return Err(Error::InvalidConfig(
                "min_delta must be finite and >= 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Rows used for training: `floor(n * (1 - validation_split))`.
    ///
    /// The trailing `n - split_point(n)` rows are validation, which can be
    /// one more than `floor(n * validation_split)`. Always keeps at least one
    /// training row.
    pub fn split_point(&self, n: usize) -> usize {
        let train = (n as f64 * (1.0 - self.validation_split)).floor() as usize;
        if train == 0 {
            n
        } else {
            train.min(n)
        }
    }
}

/// Outcome of a [`fit`] call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub epochs_run: usize,
    pub early_stopped: bool,
    /// Mean training loss of the last epoch.
    pub final_loss: f64,
    /// Validation loss of the last epoch, when a validation split existed.
    pub final_val_loss: Option<f64>,
    pub train_samples: usize,
    pub validation_samples: usize,
}

/// Train `net` in place with binary cross-entropy.
///
/// Early stopping watches validation loss, or training loss when the split
/// leaves no validation rows. The weights of the final epoch are kept.
pub fn fit<X: AsRef<[f64]>>(
    net: &mut Mlp,
    opt: &mut Adam,
    xs: &[X],
    ys: &[f64],
    cfg: &TrainConfig,
    rng: &mut StdRng,
) -> Result<TrainingReport> {
    cfg.validate()?;
    if xs.len() != ys.len() {
        return Err(Error::dims(xs.len(), ys.len()));
    }
    if xs.is_empty() {
        return Err(Error::EmptyInput {
            what: "training batch",
        });
    }
    if net.output_dim() != 1
        || net.layers.last().map(|l| l.activation) != Some(Activation::Sigmoid)
    {
        return Err(Error::InvalidConfig(
            "binary cross-entropy needs a single sigmoid output".to_string(),
        ));
    }
    for x in xs {
        if x.as_ref().len() != net.input_dim() {
            return Err(Error::dims(net.input_dim(), x.as_ref().len()));
        }
    }

    let split = cfg.split_point(xs.len());
    let (train_x, val_x) = xs.split_at(split);
    let (train_y, val_y) = ys.split_at(split);
    let mut order: Vec<usize> = (0..train_x.len()).collect();

    let mut best = f64::INFINITY;
    let mut wait = 0usize;
    let mut report = TrainingReport {
        epochs_run: 0,
        early_stopped: false,
        final_loss: 0.0,
        final_val_loss: None,
        train_samples: train_x.len(),
        validation_samples: val_x.len(),
    };

    for epoch in 1..=cfg.epochs {
        if cfg.shuffle {
            order.shuffle(rng);
        }
        let mut epoch_loss = 0.0;
        for chunk in order.chunks(cfg.batch_size) {
            let mut grads = net.zero_grads();
            for &i in chunk {
                epoch_loss += net.accumulate(train_x[i].as_ref(), train_y[i], &mut grads);
            }
            let scale = 1.0 / chunk.len() as f64;
            for g in &mut grads {
                g.weights *= scale;
                g.bias *= scale;
            }
            opt.apply(net, &grads);
        }
        let train_loss = epoch_loss / train_x.len() as f64;
        let val_loss = if val_x.is_empty() {
            None
        } else {
            Some(net.mean_loss(val_x, val_y)?)
        };
        report.epochs_run = epoch;
        report.final_loss = train_loss;
        report.final_val_loss = val_loss;
        debug!(epoch, loss = train_loss, val_loss = ?val_loss, "epoch complete");

        let monitored = val_loss.unwrap_or(train_loss);
        if monitored < best - cfg.min_delta {
            best = monitored;
            wait = 0;
        } else {
            wait += 1;
            if wait >= cfg.patience {
                report.early_stopped = true;
                break;
            }
        }
    }
    Ok(report)
}
