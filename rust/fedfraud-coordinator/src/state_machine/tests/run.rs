use std::sync::Arc;

use serial_test::serial;
use tempfile::TempDir;

use super::utils::{self, ConstantArchitecture, INPUT_DIM};
use crate::{
    state_machine::{
        events::{MetricsUpdate, ModelUpdate},
        phases::{PhaseError, PhaseName, StopReason},
    },
    storage::{tests::init_memory_store, tests::MemoryExporter, FsCheckpointStore, Store},
    trainer::TrainingError,
};

#[tokio::test]
#[serial]
async fn integration_early_stop_after_warmup() {
    utils::enable_logging();
    let (store, checkpoints, exporter) = init_memory_store();
    let (state_machine, _stop, events) = utils::initializer(
        utils::run_settings(10),
        Default::default(),
        Arc::new(ConstantArchitecture::new(INPUT_DIM)),
        store,
    )
    .init()
    .await
    .unwrap();

    let summary = state_machine.run().await.unwrap();

    // the accuracy never changes, so the first round after the warmup stops the run
    assert_eq!(summary.reason, StopReason::EarlyStop);
    assert_eq!(summary.completed_rounds, 4);
    assert_eq!(summary.history.completed_rounds(), 4);
    assert!(summary.history.is_consistent());
    assert_eq!(checkpoints.saves().await, 4);
    assert_eq!(checkpoints.checkpoint().await.unwrap().round(), 4);

    let bundles = exporter.bundles().await;
    assert_eq!(bundles.len(), 1);
    assert_eq!(bundles[0].holder, "bank_m");
    assert_eq!(bundles[0].history, summary.history);

    let phase = events.phase_listener().get_latest();
    assert_eq!(phase.event, PhaseName::Finalized);
    assert_eq!(phase.round_id, 4);
    let metrics = events.metrics_listener().get_latest();
    assert_eq!(
        metrics.event,
        MetricsUpdate::New(*summary.history.last().unwrap())
    );
}

#[tokio::test]
#[serial]
async fn integration_rounds_exhausted() {
    let (store, checkpoints, _) = init_memory_store();
    let (state_machine, _stop, events) = utils::initializer(
        utils::run_settings(3),
        utils::no_early_stopping(),
        utils::mlp(),
        store,
    )
    .init()
    .await
    .unwrap();

    let summary = state_machine.run().await.unwrap();

    assert_eq!(summary.reason, StopReason::RoundsExhausted);
    assert_eq!(summary.completed_rounds, 3);
    let checkpoint = checkpoints.checkpoint().await.unwrap();
    assert_eq!(checkpoint.weights, *summary.weights);
    assert_eq!(checkpoint.server.step, 3);
    assert_eq!(
        events.model_listener().get_latest().event,
        ModelUpdate::New(summary.weights.clone())
    );
}

#[tokio::test]
#[serial]
async fn integration_resumed_run_matches_uninterrupted_run() {
    let early_stopping = utils::no_early_stopping();

    let uninterrupted = TempDir::new().unwrap();
    let store = Store::new(
        FsCheckpointStore::new(uninterrupted.path()),
        MemoryExporter::default(),
    );
    let (state_machine, _stop, _events) =
        utils::initializer(utils::run_settings(10), early_stopping, utils::mlp(), store)
            .init()
            .await
            .unwrap();
    let expected = state_machine.run().await.unwrap();

    let interrupted = TempDir::new().unwrap();
    let store = Store::new(
        FsCheckpointStore::new(interrupted.path()),
        MemoryExporter::default(),
    );
    let (state_machine, _stop, _events) =
        utils::initializer(utils::run_settings(5), early_stopping, utils::mlp(), store.clone())
            .init()
            .await
            .unwrap();
    assert_eq!(state_machine.run().await.unwrap().completed_rounds, 5);

    let mut resumed_settings = utils::run_settings(10);
    resumed_settings.resume = true;
    let (state_machine, _stop, events) =
        utils::initializer(resumed_settings, early_stopping, utils::mlp(), store)
            .init()
            .await
            .unwrap();
    // the last restored record is published right away
    assert!(matches!(
        events.metrics_listener().get_latest().event,
        MetricsUpdate::New(record) if record.round == 5
    ));
    let resumed = state_machine.run().await.unwrap();

    assert_eq!(resumed.completed_rounds, 10);
    assert_eq!(resumed.history, expected.history);
    assert_eq!(resumed.weights, expected.weights);
}

#[tokio::test]
#[serial]
async fn integration_resume_without_remaining_rounds() {
    let (store, checkpoints, exporter) = init_memory_store();
    let (state_machine, _stop, _events) = utils::initializer(
        utils::run_settings(2),
        utils::no_early_stopping(),
        utils::mlp(),
        store.clone(),
    )
    .init()
    .await
    .unwrap();
    let first = state_machine.run().await.unwrap();

    let mut settings = utils::run_settings(2);
    settings.resume = true;
    let (state_machine, _stop, _events) =
        utils::initializer(settings, utils::no_early_stopping(), utils::mlp(), store)
            .init()
            .await
            .unwrap();
    let second = state_machine.run().await.unwrap();

    assert_eq!(second.reason, StopReason::RoundsExhausted);
    assert_eq!(second.weights, first.weights);
    assert_eq!(checkpoints.saves().await, 2);
    assert_eq!(exporter.bundles().await.len(), 2);
}

#[tokio::test]
#[serial]
async fn integration_stop_before_the_first_round() {
    let (store, checkpoints, exporter) = init_memory_store();
    let (state_machine, stop, _events) = utils::initializer(
        utils::run_settings(10),
        Default::default(),
        utils::mlp(),
        store,
    )
    .init()
    .await
    .unwrap();

    stop.stop();
    let summary = state_machine.run().await.unwrap();

    assert_eq!(summary.reason, StopReason::Cancelled);
    assert_eq!(summary.completed_rounds, 0);
    assert!(checkpoints.checkpoint().await.is_none());
    assert!(exporter.bundles().await[0].history.is_empty());
}

#[tokio::test]
#[serial]
async fn integration_stop_completes_the_current_round() {
    let (store, checkpoints, _) = init_memory_store();
    let (state_machine, stop, _events) = utils::initializer(
        utils::run_settings(10),
        Default::default(),
        utils::mlp(),
        store,
    )
    .init()
    .await
    .unwrap();

    let state_machine = state_machine.next().await.unwrap();
    assert_eq!(state_machine.phase(), PhaseName::Training);

    // the stop arrives while the first round is in progress
    stop.stop();
    let state_machine = state_machine.next().await.unwrap();
    assert_eq!(state_machine.phase(), PhaseName::Stopped);
    assert_eq!(checkpoints.checkpoint().await.unwrap().round(), 1);

    let state_machine = state_machine.next().await.unwrap();
    assert_eq!(state_machine.phase(), PhaseName::Finalized);
    assert!(state_machine.next().await.is_none());
}

#[tokio::test]
#[serial]
async fn integration_training_failure() {
    let (store, checkpoints, exporter) = init_memory_store();
    let architecture = ConstantArchitecture {
        input_dim: INPUT_DIM,
        gradient: f32::NAN,
    };
    let (state_machine, _stop, events) = utils::initializer(
        utils::run_settings(10),
        Default::default(),
        Arc::new(architecture),
        store,
    )
    .init()
    .await
    .unwrap();

    let err = state_machine.run().await.unwrap_err();

    assert_eq!(err.completed_rounds, 0);
    assert!(matches!(
        err.error,
        PhaseError::Training(TrainingError::NonFinite(_))
    ));
    assert!(checkpoints.checkpoint().await.is_none());
    assert!(exporter.bundles().await.is_empty());
    assert_eq!(events.phase_listener().get_latest().event, PhaseName::Failure);
    assert_eq!(
        events.model_listener().get_latest().event,
        ModelUpdate::Invalidate
    );
}

#[tokio::test]
#[serial]
async fn integration_phase_sequence() {
    let (store, _, _) = init_memory_store();
    let (state_machine, _stop, _events) = utils::initializer(
        utils::run_settings(2),
        utils::no_early_stopping(),
        utils::mlp(),
        store,
    )
    .init()
    .await
    .unwrap();

    let mut phases = Vec::new();
    let mut current = Some(state_machine);
    while let Some(state_machine) = current {
        phases.push(state_machine.phase());
        current = state_machine.next().await;
    }
    assert_eq!(
        phases,
        vec![
            PhaseName::Init,
            PhaseName::Training,
            PhaseName::Training,
            PhaseName::Stopped,
            PhaseName::Finalized,
        ]
    );
}
