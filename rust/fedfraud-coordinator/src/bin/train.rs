use std::{path::PathBuf, process, sync::Arc};

use anyhow::Context;
use fedfraud_coordinator::{
    settings::{DataSettings, RunSettings, Settings},
    state_machine::{events::MetricsUpdate, StateMachineInitializer},
    storage::{FsCheckpointStore, FsExporter, Store},
};
use fedfraud_core::{
    harmonize::harmonize_dataset,
    model::MlpSpec,
    partition::partition,
    ClientDataset,
    FeatureSchema,
    RawTable,
};
use structopt::StructOpt;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_subscriber::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedfraud-train")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

/// Loads the holder's rows, maps them onto the schema and splits them into clients.
fn load_clients(
    data: &DataSettings,
    run: &RunSettings,
) -> anyhow::Result<(FeatureSchema, Vec<ClientDataset>)> {
    let schema = FeatureSchema::from_path(&data.schema)
        .with_context(|| format!("cannot load schema {}", data.schema.display()))?;
    let mut table = RawTable::from_csv_path(&data.dataset)
        .with_context(|| format!("cannot load dataset {}", data.dataset.display()))?;
    table.drop_columns(&data.drop_columns);
    let (table, labels) = table.split_label(&data.label_column)?;
    let dataset = harmonize_dataset(&table, labels, &schema)?;
    info!(
        rows = dataset.rows(),
        features = dataset.feature_dim(),
        mode = schema.mode(),
        "harmonized dataset"
    );
    let clients = partition(&dataset, run.n_clients, run.seed)?;
    Ok((schema, clients))
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let Settings {
        run: run_settings,
        data: data_settings,
        training: training_settings,
        early_stopping: early_stopping_settings,
        log: log_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let (schema, clients) = load_clients(&data_settings, &run_settings).unwrap_or_else(|err| {
        error!("failed to load the training data: {:#}", err);
        process::exit(1);
    });
    let architecture = Arc::new(MlpSpec::new(
        schema.feature_dim(),
        training_settings.hidden_units.clone(),
        training_settings.l2,
    ));
    let store = Store::new(
        FsCheckpointStore::new(run_settings.run_root.join("ckpt")),
        FsExporter::new(run_settings.run_root.join("export")),
    );

    let (state_machine, stop_handle, event_subscriber) = StateMachineInitializer::new(
        run_settings,
        training_settings,
        early_stopping_settings,
        architecture,
        schema,
        clients,
        store,
    )
    .init()
    .await
    .unwrap_or_else(|err| {
        error!("failed to initialize the state machine: {}", err);
        process::exit(1);
    });

    let mut metrics = event_subscriber.metrics_listener();
    tokio::spawn(async move {
        while let Some(event) = metrics.changed().await {
            if let MetricsUpdate::New(record) = event.event {
                debug!(
                    round = record.round,
                    accuracy = record.accuracy,
                    "round metrics published"
                );
            }
        }
    });

    let run = state_machine.run();
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = signal::ctrl_c() => {
            warn!("stop requested: finishing the current round");
            stop_handle.stop();
            run.await
        }
    };

    match result {
        Ok(summary) => info!(
            reason = %summary.reason,
            rounds = summary.completed_rounds,
            artifacts = summary.artifacts.len(),
            "run finished"
        ),
        Err(err) => {
            error!("{}", err);
            process::exit(1);
        }
    }
}
