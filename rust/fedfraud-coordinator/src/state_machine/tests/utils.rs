use std::sync::Arc;

use fedfraud_core::{
    model::{Architecture, ForwardPass, Model, MlpSpec},
    partition::partition,
    ClientDataset,
    DimensionMismatch,
    FeatureSchema,
    HarmonizedDataset,
    WeightSet,
};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand_chacha::ChaCha20Rng;
use tracing_subscriber::*;

use crate::{
    settings::{EarlyStoppingSettings, RunSettings, TrainingSettings},
    state_machine::{
        coordinator::{CoordinatorState, RunParams},
        events::{EventPublisher, EventSubscriber, MetricsUpdate, ModelUpdate},
        phases::{PhaseName, Shared},
        requests::StopHandle,
        StateMachineInitializer,
    },
    storage::Storage,
    trainer::{Trainer, TrainingParams},
};

pub const INPUT_DIM: usize = 4;

pub fn enable_logging() {
    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(true)
        .try_init();
}

/// A deterministic dataset where every third row is fraud.
pub fn dataset(rows: usize, input_dim: usize) -> HarmonizedDataset {
    let features = Array2::from_shape_fn((rows, input_dim), |(row, column)| {
        ((row * 7 + column * 3) % 11) as f32 / 11.0
    });
    let labels = Array1::from_shape_fn(rows, |row| if row % 3 == 0 { 1.0 } else { 0.0 });
    HarmonizedDataset::new(features, labels).unwrap()
}

pub fn clients(rows: usize) -> Vec<ClientDataset> {
    partition(&dataset(rows, INPUT_DIM), 3, 42).unwrap()
}

/// An enumerated schema with `width` plain features.
pub fn schema(width: usize) -> FeatureSchema {
    let names: Vec<String> = (0..width).map(|i| format!("f{}", i)).collect();
    FeatureSchema::from_json_str(&serde_json::to_string(&names).unwrap()).unwrap()
}

pub fn mlp() -> Arc<dyn Architecture> {
    Arc::new(MlpSpec::new(INPUT_DIM, vec![6, 3], 1e-4))
}

pub fn run_settings(rounds: u64) -> RunSettings {
    RunSettings {
        rounds,
        batch_size: 8,
        shuffle_buffer: 32,
        workers: Some(2),
        ..RunSettings::default()
    }
}

pub fn training_settings() -> TrainingSettings {
    TrainingSettings {
        lr_client: 0.01,
        lr_server: 0.05,
        ..TrainingSettings::default()
    }
}

pub fn no_early_stopping() -> EarlyStoppingSettings {
    EarlyStoppingSettings {
        enabled: false,
        ..EarlyStoppingSettings::default()
    }
}

/// Creates an initializer for the run of `architecture` over 60 rows.
pub fn initializer<T: Storage>(
    run_settings: RunSettings,
    early_stopping: EarlyStoppingSettings,
    architecture: Arc<dyn Architecture>,
    store: T,
) -> StateMachineInitializer<T> {
    StateMachineInitializer::new(
        run_settings,
        training_settings(),
        early_stopping,
        architecture,
        schema(INPUT_DIM),
        clients(60),
        store,
    )
}

pub fn init_shared<T: Storage>(store: T) -> (Shared<T>, StopHandle, EventSubscriber) {
    let architecture = mlp();
    let weights = architecture.slot_shapes();
    let state = CoordinatorState::new(
        RunParams {
            holder: "bank_m".to_string(),
            rounds: 10,
            lr_server: 1e-3,
            early_stopping: EarlyStoppingSettings::default(),
        },
        WeightSet::zeros(&weights),
    );
    let trainer = Trainer::new(
        architecture,
        clients(30),
        TrainingParams {
            seed: 42,
            batch_size: 8,
            shuffle_buffer: 32,
            lr_client: 0.01,
        },
        None,
    )
    .unwrap();
    let (publisher, subscriber) = EventPublisher::init(
        state.round_id,
        PhaseName::Init,
        MetricsUpdate::Invalidate,
        ModelUpdate::Invalidate,
    );
    let (stop_handle, stop_rx) = StopHandle::new();
    let shared = Shared::new(
        state,
        trainer,
        schema(INPUT_DIM),
        publisher,
        stop_rx,
        store,
    );
    (shared, stop_handle, subscriber)
}

#[derive(Debug, Clone, Copy)]
/// An architecture whose models always predict `0.5` and whose gradients are constant.
pub struct ConstantArchitecture {
    pub input_dim: usize,
    pub gradient: f32,
}

impl ConstantArchitecture {
    pub fn new(input_dim: usize) -> Self {
        Self {
            input_dim,
            gradient: 0.0,
        }
    }
}

struct ConstantModel {
    input_dim: usize,
    gradient: f32,
    weights: WeightSet,
}

impl Architecture for ConstantArchitecture {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn slot_shapes(&self) -> Vec<Vec<usize>> {
        vec![vec![1]]
    }

    fn initialize(&self, _rng: &mut ChaCha20Rng) -> WeightSet {
        WeightSet::zeros(&self.slot_shapes())
    }

    fn instantiate(&self, weights: WeightSet) -> Result<Box<dyn Model>, DimensionMismatch> {
        self.check(&weights)?;
        Ok(Box::new(ConstantModel {
            input_dim: self.input_dim,
            gradient: self.gradient,
            weights,
        }))
    }
}

impl Model for ConstantModel {
    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn predict(&self, features: ArrayView2<f32>) -> Array1<f32> {
        Array1::from_elem(features.nrows(), 0.5)
    }

    fn loss_and_gradients(&self, features: ArrayView2<f32>, _: ArrayView1<f32>) -> ForwardPass {
        let mut gradients = self.weights.zeros_like();
        for tensor in gradients.iter_mut() {
            tensor.fill(self.gradient);
        }
        ForwardPass {
            loss: 0.5,
            gradients,
            probabilities: self.predict(features),
        }
    }

    fn apply_update(&mut self, update: &WeightSet) {
        self.weights.scaled_add(1.0, update);
    }

    fn weights(&self) -> WeightSet {
        self.weights.clone()
    }

    fn into_weights(self: Box<Self>) -> WeightSet {
        self.weights
    }
}
