//! A state machine initializer.

use std::{path::Path, sync::Arc};

use fedfraud_core::{
    archive::{ArchiveError, ArchiveReader, NUMPY_PREFIX, WEIGHTS_PREFIX},
    model::Architecture,
    ClientDataset,
    DimensionMismatch,
    FeatureSchema,
    WeightSet,
};
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use rayon::ThreadPoolBuildError;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    settings::{EarlyStoppingSettings, RunSettings, TrainingSettings},
    state_machine::{
        coordinator::{CoordinatorState, RunParams},
        events::{EventPublisher, EventSubscriber, MetricsUpdate, ModelUpdate},
        phases::{Init, PhaseName, PhaseState, Shared},
        requests::StopHandle,
        StateMachine,
    },
    storage::{Storage, StorageError},
    trainer::{Trainer, TrainingParams},
};

type StateMachineInitializationResult<T> = Result<T, StateMachineInitializationError>;

/// Error that can occur during the initialization of the [`StateMachine`].
#[derive(Debug, Error)]
pub enum StateMachineInitializationError {
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
    #[error("there are no clients to train")]
    NoClients,
    #[error("checkpoint unavailable: {0}")]
    CheckpointUnavailable(String),
    #[error("clearing the checkpoint failed: {0}")]
    ClearCheckpoint(StorageError),
    #[error("failed to start the training workers: {0}")]
    WorkerPool(#[from] ThreadPoolBuildError),
}

/// The state machine initializer that initializes a new state machine.
pub struct StateMachineInitializer<T> {
    run_settings: RunSettings,
    training_settings: TrainingSettings,
    early_stopping_settings: EarlyStoppingSettings,
    architecture: Arc<dyn Architecture>,
    schema: FeatureSchema,
    clients: Vec<ClientDataset>,
    store: T,
}

impl<T> StateMachineInitializer<T>
where
    T: Storage,
{
    /// Creates a new [`StateMachineInitializer`].
    pub fn new(
        run_settings: RunSettings,
        training_settings: TrainingSettings,
        early_stopping_settings: EarlyStoppingSettings,
        architecture: Arc<dyn Architecture>,
        schema: FeatureSchema,
        clients: Vec<ClientDataset>,
        store: T,
    ) -> Self {
        Self {
            run_settings,
            training_settings,
            early_stopping_settings,
            architecture,
            schema,
            clients,
            store,
        }
    }

    /// Initializes a new [`StateMachine`].
    ///
    /// A resumed run continues from the stored checkpoint. Any other run discards the stored
    /// checkpoint and starts from the base model, if one is configured and usable, or from
    /// freshly initialized weights.
    ///
    /// # Errors
    /// Fails if:
    /// - the schema or the client data don't have the input width of the architecture,
    /// - the run is resumed but the checkpoint is missing, unreadable or doesn't fit the
    ///   architecture,
    /// - the old checkpoint can't be cleared.
    pub async fn init(
        mut self,
    ) -> StateMachineInitializationResult<(StateMachine<T>, StopHandle, EventSubscriber)> {
        self.check_dimensions()?;
        let state = if self.run_settings.resume {
            self.from_checkpoint().await?
        } else {
            self.from_settings().await?
        };
        self.init_state_machine(state)
    }

    fn check_dimensions(&self) -> StateMachineInitializationResult<()> {
        let expected = self.architecture.input_dim();
        let widths = std::iter::once(self.schema.feature_dim())
            .chain(self.clients.iter().map(|client| client.data().feature_dim()));
        for found in widths {
            if found != expected {
                return Err(DimensionMismatch::InputWidth { expected, found }.into());
            }
        }
        if self.clients.is_empty() {
            return Err(StateMachineInitializationError::NoClients);
        }
        Ok(())
    }

    fn run_params(&self) -> RunParams {
        RunParams {
            holder: self.run_settings.holder.clone(),
            rounds: self.run_settings.rounds,
            lr_server: self.training_settings.lr_server,
            early_stopping: self.early_stopping_settings,
        }
    }

    // Restores the [`CoordinatorState`] from the stored checkpoint.
    async fn from_checkpoint(&mut self) -> StateMachineInitializationResult<CoordinatorState> {
        let checkpoint = self
            .store
            .load_checkpoint()
            .await
            .map_err(|err| StateMachineInitializationError::CheckpointUnavailable(err.to_string()))?
            .ok_or_else(|| {
                StateMachineInitializationError::CheckpointUnavailable(
                    "no checkpoint found".to_string(),
                )
            })?;

        self.architecture
            .check(&checkpoint.weights)
            .map_err(|err| StateMachineInitializationError::CheckpointUnavailable(err.to_string()))?;
        if !checkpoint.is_consistent() {
            return Err(StateMachineInitializationError::CheckpointUnavailable(
                "inconsistent checkpoint".to_string(),
            ));
        }

        info!(round = checkpoint.round(), "resuming from checkpoint");
        Ok(CoordinatorState::restore(self.run_params(), checkpoint))
    }

    // Creates a new [`CoordinatorState`] from the given settings and clears the stored
    // checkpoint. Should only be called for the first start or if we need to perform a reset.
    async fn from_settings(&mut self) -> StateMachineInitializationResult<CoordinatorState> {
        self.store
            .clear_checkpoint()
            .await
            .map_err(StateMachineInitializationError::ClearCheckpoint)?;
        let weights = self.initial_weights();
        Ok(CoordinatorState::new(self.run_params(), weights))
    }

    fn initial_weights(&self) -> WeightSet {
        let shapes = self.architecture.slot_shapes();
        if let Some(path) = &self.run_settings.base_model {
            match load_base_model(path, &shapes) {
                Ok(weights) => {
                    info!(path = %path.display(), "starting from the base model");
                    return weights;
                }
                Err(err) => warn!(
                    path = %path.display(),
                    "base model unusable, starting from random weights: {}",
                    err
                ),
            }
        }
        debug!(seed = self.run_settings.seed, "initializing random weights");
        self.architecture
            .initialize(&mut ChaCha20Rng::seed_from_u64(self.run_settings.seed))
    }

    // Initializes a new [`StateMachine`] with its components.
    fn init_state_machine(
        self,
        state: CoordinatorState,
    ) -> StateMachineInitializationResult<(StateMachine<T>, StopHandle, EventSubscriber)> {
        let trainer = Trainer::new(
            self.architecture,
            self.clients,
            TrainingParams {
                seed: self.run_settings.seed,
                batch_size: self.run_settings.batch_size,
                shuffle_buffer: self.run_settings.shuffle_buffer,
                lr_client: self.training_settings.lr_client,
            },
            self.run_settings.workers,
        )?;

        let metrics = state
            .history
            .last()
            .map_or(MetricsUpdate::Invalidate, |record| MetricsUpdate::New(*record));
        let (event_publisher, event_subscriber) = EventPublisher::init(
            state.round_id,
            PhaseName::Init,
            metrics,
            ModelUpdate::Invalidate,
        );
        let (stop_handle, stop_rx) = StopHandle::new();

        let shared = Shared::new(
            state,
            trainer,
            self.schema,
            event_publisher,
            stop_rx,
            self.store,
        );
        let state_machine = StateMachine::from(PhaseState::<Init, _>::new(shared));
        Ok((state_machine, stop_handle, event_subscriber))
    }
}

/// Loads a weight archive stored under `w_<i>` keys or under the positional `arr_<i>` keys.
fn load_base_model(path: &Path, shapes: &[Vec<usize>]) -> Result<WeightSet, ArchiveError> {
    let mut archive = ArchiveReader::open(path)?;
    let prefix = if archive.has_group(WEIGHTS_PREFIX) {
        WEIGHTS_PREFIX
    } else {
        NUMPY_PREFIX
    };
    archive.take_group(prefix, Some(shapes)).map(WeightSet::from)
}
