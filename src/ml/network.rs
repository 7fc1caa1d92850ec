//! Bidirectional LSTM regressor built on burn
//!
//! A single bidirectional recurrent layer reads the lookback window in both
//! directions. The final state of each direction is concatenated and passed
//! through dropout, a ReLU dense layer, dropout again and a linear output
//! unit. Training runs on the autodiff backend; inference runs on the plain
//! ndarray backend.

use std::sync::Mutex;

use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::Module;
use burn::nn::loss::{HuberLoss, Reduction};
use burn::nn::{BiLstm, BiLstmConfig, Dropout, DropoutConfig, Linear, LinearConfig};
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder, RecorderError};
use burn::tensor::activation::relu;
use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor, TensorData};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::traits::SequenceRegressor;

pub type InferenceBackend = NdArray<f32>;
pub type TrainingBackend = Autodiff<InferenceBackend>;

type WeightRecorder = BinBytesRecorder<FullPrecisionSettings>;

/// Layer sizes of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkShape {
    pub input_size: usize,
    pub hidden_size: usize,
    pub dense_size: usize,
}

#[derive(Module, Debug)]
pub struct SequenceNet<B: Backend> {
    lstm: BiLstm<B>,
    dropout: Dropout,
    dense: Linear<B>,
    output: Linear<B>,
}

impl<B: Backend> SequenceNet<B> {
    pub fn new(shape: &NetworkShape, dropout: f64, device: &B::Device) -> Self {
        Self {
            lstm: BiLstmConfig::new(shape.input_size, shape.hidden_size, true).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            dense: LinearConfig::new(2 * shape.hidden_size, shape.dense_size).init(device),
            output: LinearConfig::new(shape.dense_size, 1).init(device),
        }
    }

    /// `[batch, steps, features]` to `[batch, 1]`.
    ///
    /// Dropout is only active on an autodiff backend.
    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 2> {
        let (sequence, _) = self.lstm.forward(input, None);
        let [batch, steps, width] = sequence.dims();
        let hidden = width / 2;

        // The reverse direction finishes at step 0
        let forward = sequence
            .clone()
            .slice([0..batch, steps - 1..steps, 0..hidden])
            .reshape([batch, hidden]);
        let backward = sequence
            .slice([0..batch, 0..1, hidden..width])
            .reshape([batch, hidden]);

        let features = self.dropout.forward(Tensor::cat(vec![forward, backward], 1));
        let dense = self.dropout.forward(relu(self.dense.forward(features)));
        self.output.forward(dense)
    }
}

/// Stack scaled windows into a `[windows, steps, features]` tensor.
pub fn window_tensor<B: Backend>(windows: &[ArrayView2<f64>], device: &B::Device) -> Tensor<B, 3> {
    let (steps, features) = windows.first().map(|w| w.dim()).unwrap_or((0, 0));
    let values: Vec<f32> = windows
        .iter()
        .flat_map(|w| w.iter().map(|&v| v as f32))
        .collect();
    Tensor::from_data(TensorData::new(values, [windows.len(), steps, features]), device)
}

/// Targets as a `[n, 1]` column.
pub fn target_tensor<B: Backend>(targets: &[f64], device: &B::Device) -> Tensor<B, 2> {
    let values: Vec<f32> = targets.iter().map(|&v| v as f32).collect();
    Tensor::from_data(TensorData::new(values, [targets.len(), 1]), device)
}

pub fn scalar<B: Backend>(tensor: Tensor<B, 1>) -> f64 {
    tensor.into_scalar().elem::<f64>()
}

/// Mean Huber loss of `module` over whole windows, without dropout.
pub fn evaluate(
    module: &SequenceNet<InferenceBackend>,
    windows: &[Array2<f64>],
    targets: &[f64],
    loss: &HuberLoss,
) -> f64 {
    if windows.is_empty() {
        return 0.0;
    }
    let device = NdArrayDevice::default();
    let views: Vec<ArrayView2<f64>> = windows.iter().map(|w| w.view()).collect();
    let predictions = module.forward(window_tensor(&views, &device));
    scalar(loss.forward(predictions, target_tensor(targets, &device), Reduction::Mean))
}

/// Serialized form of [`BiLstmNetwork`].
#[derive(Serialize, Deserialize)]
struct StoredNetwork {
    shape: NetworkShape,
    weights: Vec<u8>,
}

/// Trained bidirectional LSTM used for inference.
///
/// Serializes as its shape plus the burn record bytes of the module.
#[derive(Debug, Serialize, Deserialize)]
#[serde(try_from = "StoredNetwork", into = "StoredNetwork")]
pub struct BiLstmNetwork {
    shape: NetworkShape,
    weights: Vec<u8>,
    module: Mutex<SequenceNet<InferenceBackend>>,
}

impl BiLstmNetwork {
    pub fn from_module(
        shape: NetworkShape,
        module: SequenceNet<InferenceBackend>,
    ) -> Result<Self, RecorderError> {
        let recorder = WeightRecorder::default();
        let weights = <WeightRecorder as Recorder<InferenceBackend>>::record(
            &recorder,
            module.clone().into_record(),
            (),
        )?;

        Ok(Self {
            shape,
            weights,
            module: Mutex::new(module),
        })
    }

    fn from_weights(shape: NetworkShape, weights: Vec<u8>) -> Result<Self, RecorderError> {
        let device = NdArrayDevice::default();
        let recorder = WeightRecorder::default();
        let record = <WeightRecorder as Recorder<InferenceBackend>>::load(
            &recorder,
            weights.clone(),
            &device,
        )?;
        let module = SequenceNet::new(&shape, 0.0, &device).load_record(record);

        Ok(Self {
            shape,
            weights,
            module: Mutex::new(module),
        })
    }

    /// Inference on one scaled window (rows = time steps).
    pub fn forward(&self, window: ArrayView2<f64>) -> f64 {
        let device = NdArrayDevice::default();
        let input = window_tensor::<InferenceBackend>(&[window], &device);
        let module = self.module.lock().unwrap_or_else(|e| e.into_inner());
        let output = module.forward(input);
        output.into_scalar().elem::<f64>()
    }
}

impl Clone for BiLstmNetwork {
    fn clone(&self) -> Self {
        let module = self.module.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Self {
            shape: self.shape,
            weights: self.weights.clone(),
            module: Mutex::new(module),
        }
    }
}

impl PartialEq for BiLstmNetwork {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.weights == other.weights
    }
}

impl From<BiLstmNetwork> for StoredNetwork {
    fn from(network: BiLstmNetwork) -> Self {
        Self {
            shape: network.shape,
            weights: network.weights,
        }
    }
}

impl TryFrom<StoredNetwork> for BiLstmNetwork {
    type Error = String;

    fn try_from(stored: StoredNetwork) -> Result<Self, Self::Error> {
        Self::from_weights(stored.shape, stored.weights).map_err(|e| e.to_string())
    }
}

impl SequenceRegressor for BiLstmNetwork {
    fn predict(&self, window: ArrayView2<f64>) -> f64 {
        self.forward(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::nn::loss::HuberLossConfig;

    fn small_shape() -> NetworkShape {
        NetworkShape {
            input_size: 3,
            hidden_size: 4,
            dense_size: 5,
        }
    }

    fn sample_window(offset: usize) -> Array2<f64> {
        Array2::from_shape_fn((4, 3), |(t, f)| ((offset + t) as f64 * 0.7 + f as f64).sin())
    }

    fn network() -> BiLstmNetwork {
        let device = NdArrayDevice::default();
        let module = SequenceNet::<InferenceBackend>::new(&small_shape(), 0.0, &device);
        BiLstmNetwork::from_module(small_shape(), module).unwrap()
    }

    #[test]
    fn test_window_tensor_layout() {
        let device = NdArrayDevice::default();
        let a = sample_window(0);
        let b = sample_window(5);
        let tensor = window_tensor::<InferenceBackend>(&[a.view(), b.view()], &device);

        assert_eq!(tensor.dims(), [2, 4, 3]);
        let values = tensor.into_data().to_vec::<f32>().unwrap();
        assert_relative_eq!(values[0] as f64, a[[0, 0]], epsilon = 1e-6);
        assert_relative_eq!(values[5] as f64, a[[1, 2]], epsilon = 1e-6);
        assert_relative_eq!(values[12] as f64, b[[0, 0]], epsilon = 1e-6);
    }

    #[test]
    fn test_forward_output_shape() {
        let device = NdArrayDevice::default();
        let module = SequenceNet::<InferenceBackend>::new(&small_shape(), 0.3, &device);
        let windows = [sample_window(1), sample_window(2), sample_window(3)];
        let views: Vec<_> = windows.iter().map(|w| w.view()).collect();

        let output = module.forward(window_tensor(&views, &device));
        assert_eq!(output.dims(), [3, 1]);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let network = network();
        let window = sample_window(7);

        let first = network.forward(window.view());
        assert!(first.is_finite());
        assert_eq!(first, network.forward(window.view()));
        assert_eq!(first, network.clone().forward(window.view()));
    }

    #[test]
    fn test_evaluate_matches_huber_definition() {
        let network = network();
        let windows = vec![sample_window(1), sample_window(4)];
        let predictions: Vec<f64> = windows.iter().map(|w| network.forward(w.view())).collect();
        // One residual inside the quadratic region, one far outside it
        let targets = vec![predictions[0] + 0.5, predictions[1] - 3.0];
        let loss = HuberLossConfig::new(1.0).init();

        let module = network.module.lock().unwrap().clone();
        let value = evaluate(&module, &windows, &targets, &loss);

        // (0.5 * 0.5^2 + 1.0 * (3.0 - 0.5)) / 2
        assert_relative_eq!(value, (0.125 + 2.5) / 2.0, epsilon = 1e-4);
        assert_eq!(evaluate(&module, &[], &[], &loss), 0.0);
    }

    #[test]
    fn test_bincode_roundtrip_preserves_predictions() {
        let network = network();
        let bytes = bincode::serialize(&network).unwrap();
        let restored: BiLstmNetwork = bincode::deserialize(&bytes).unwrap();

        assert_eq!(network, restored);
        let window = sample_window(8);
        assert_eq!(network.forward(window.view()), restored.forward(window.view()));
    }

    #[test]
    fn test_corrupt_weights_fail_to_deserialize() {
        let stored = StoredNetwork {
            shape: small_shape(),
            weights: b"not a record".to_vec(),
        };
        let bytes = bincode::serialize(&stored).unwrap();

        assert!(bincode::deserialize::<BiLstmNetwork>(&bytes).is_err());
    }
}
