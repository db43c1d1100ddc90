//! The client side of a round.
//!
//! Client training is CPU bound, so it runs on a dedicated [`rayon`] thread pool and the async
//! state machine only awaits the aggregated outcome.

use std::sync::Arc;

use fedfraud_core::{
    model::{
        federated_average,
        Adam,
        AdamState,
        Architecture,
        MetricAccumulator,
        RoundMetrics,
        WeightSet,
    },
    ClientDataset,
    DimensionMismatch,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::{prelude::*, ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Errors of the client side of a round.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
    #[error("client training was aborted")]
    WorkerLost,
    #[error("client {0} produced non-finite weights")]
    NonFinite(usize),
    #[error("no client had any examples")]
    NoExamples,
}

#[derive(Debug, Clone, Copy, PartialEq)]
/// The parameters of the local training of a client.
pub struct TrainingParams {
    /// The seed of the batch shuffling.
    pub seed: u64,
    pub batch_size: usize,
    pub shuffle_buffer: usize,
    /// The learning rate of the client optimizer.
    pub lr_client: f32,
}

#[derive(Debug, Clone)]
/// The aggregated client work of one round.
pub struct RoundOutcome {
    /// The example-weighted mean of the client deltas `local - global`.
    pub delta: WeightSet,
    pub metrics: RoundMetrics,
    /// The number of examples trained on.
    pub examples: u64,
}

struct ClientUpdate {
    delta: WeightSet,
    examples: u64,
    metrics: MetricAccumulator,
}

#[derive(Debug, Clone)]
/// Trains the clients of a run.
pub struct Trainer {
    architecture: Arc<dyn Architecture>,
    clients: Arc<Vec<ClientDataset>>,
    params: TrainingParams,
    pool: Arc<ThreadPool>,
}

impl Trainer {
    /// Creates a trainer with `workers` threads, one per client by default.
    pub fn new(
        architecture: Arc<dyn Architecture>,
        clients: Vec<ClientDataset>,
        params: TrainingParams,
        workers: Option<usize>,
    ) -> Result<Self, ThreadPoolBuildError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers.unwrap_or(clients.len()).max(1))
            .thread_name(|index| format!("fedfraud-client-{}", index))
            .panic_handler(|_| error!("client training panicked"))
            .build()?;
        Ok(Self {
            architecture,
            clients: Arc::new(clients),
            params,
            pool: Arc::new(pool),
        })
    }

    pub fn architecture(&self) -> &Arc<dyn Architecture> {
        &self.architecture
    }

    pub fn clients(&self) -> &[ClientDataset] {
        &self.clients
    }

    /// Gets the total number of examples over all clients.
    pub fn examples(&self) -> usize {
        self.clients.iter().map(ClientDataset::rows).sum()
    }

    /// Trains every client on a copy of the global weights and averages the client deltas.
    ///
    /// The outcome only depends on the seed, the round and the global weights, not on the
    /// scheduling of the clients.
    pub async fn run_round(
        &self,
        round: u64,
        global: Arc<WeightSet>,
    ) -> Result<RoundOutcome, TrainingError> {
        let (tx, rx) = oneshot::channel();
        let trainer = self.clone();
        self.pool.spawn(move || {
            let outcome = trainer
                .clients
                .par_iter()
                .map(|client| trainer.train_client(round, client, &global))
                .collect::<Result<Vec<_>, _>>()
                .and_then(aggregate);
            let _ = tx.send(outcome);
        });
        rx.await.map_err(|_| TrainingError::WorkerLost)?
    }

    fn train_client(
        &self,
        round: u64,
        client: &ClientDataset,
        global: &WeightSet,
    ) -> Result<ClientUpdate, TrainingError> {
        let mut rng = ChaCha20Rng::seed_from_u64(self.params.seed);
        rng.set_stream((round << 32) | client.client() as u64);

        let mut model = self.architecture.instantiate(global.clone())?;
        let optimizer = Adam::new(self.params.lr_client);
        let mut state = AdamState::new(&global.shapes());
        let mut metrics = MetricAccumulator::new();
        for batch in client.batches(self.params.shuffle_buffer, self.params.batch_size, &mut rng) {
            let pass = model.loss_and_gradients(batch.features.view(), batch.labels.view());
            metrics.record_batch(pass.probabilities.view(), batch.labels.view(), pass.loss);
            let update = optimizer.step(&mut state, &pass.gradients);
            model.apply_update(&update);
        }

        let local = model.into_weights();
        if !local.is_finite() {
            return Err(TrainingError::NonFinite(client.client()));
        }
        debug!(client = client.client(), examples = client.rows(), "client trained");
        Ok(ClientUpdate {
            delta: local.difference(global),
            examples: client.rows() as u64,
            metrics,
        })
    }
}

/// Averages the client deltas and merges the client metrics in client order.
fn aggregate(updates: Vec<ClientUpdate>) -> Result<RoundOutcome, TrainingError> {
    let mut deltas = Vec::with_capacity(updates.len());
    let mut counts = Vec::with_capacity(updates.len());
    let mut metrics = MetricAccumulator::new();
    for update in updates {
        deltas.push(update.delta);
        counts.push(update.examples);
        metrics.merge(update.metrics);
    }
    let delta = federated_average(&deltas, &counts).ok_or(TrainingError::NoExamples)?;
    Ok(RoundOutcome {
        delta,
        metrics: metrics.finish(),
        examples: metrics.examples(),
    })
}

#[cfg(test)]
mod tests {
    use fedfraud_core::{model::MlpSpec, partition::partition, HarmonizedDataset};
    use ndarray::{Array1, Array2};

    use super::*;

    fn dataset(rows: usize) -> HarmonizedDataset {
        let features = Array2::from_shape_fn((rows, 4), |(row, column)| {
            ((row * 7 + column * 3) % 11) as f32 / 11.0
        });
        let labels = Array1::from_shape_fn(rows, |row| (row % 3 == 0) as u8 as f32);
        HarmonizedDataset::new(features, labels).unwrap()
    }

    fn trainer(workers: Option<usize>) -> Trainer {
        let clients = partition(&dataset(40), 3, 7).unwrap();
        Trainer::new(
            Arc::new(MlpSpec::new(4, vec![5], 1e-4)),
            clients,
            TrainingParams {
                seed: 7,
                batch_size: 4,
                shuffle_buffer: 16,
                lr_client: 0.01,
            },
            workers,
        )
        .unwrap()
    }

    fn initial_weights(trainer: &Trainer) -> Arc<WeightSet> {
        Arc::new(
            trainer
                .architecture()
                .initialize(&mut ChaCha20Rng::seed_from_u64(1)),
        )
    }

    #[tokio::test]
    async fn test_round_is_deterministic() {
        let single = trainer(Some(1));
        let parallel = trainer(None);
        let global = initial_weights(&single);

        let first = single.run_round(1, global.clone()).await.unwrap();
        let second = parallel.run_round(1, global.clone()).await.unwrap();

        assert_eq!(first.examples, 40);
        assert_eq!(first.delta, second.delta);
        assert_eq!(first.metrics, second.metrics);
        assert!(first.delta.iter().any(|tensor| tensor.iter().any(|&v| v != 0.0)));
        assert!(first.metrics.loss > 0.0);

        // another round draws other batches
        let next = single.run_round(2, global).await.unwrap();
        assert_ne!(first.delta, next.delta);
    }

    #[tokio::test]
    async fn test_wrong_global_layout() {
        let trainer = trainer(None);
        let global = Arc::new(WeightSet::zeros(&[vec![3, 5]]));
        assert!(matches!(
            trainer.run_round(1, global).await,
            Err(TrainingError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn test_aggregate_without_updates() {
        assert!(matches!(aggregate(Vec::new()), Err(TrainingError::NoExamples)));
    }
}
