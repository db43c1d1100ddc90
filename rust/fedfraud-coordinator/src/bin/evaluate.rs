use std::{path::PathBuf, process};

use anyhow::Context;
use fedfraud_coordinator::{
    settings::{DataSettings, EvaluationSettings, RunSettings, Settings, TrainingSettings},
    storage::export::MODEL_FILE,
};
use fedfraud_core::{
    archive,
    evaluation::{evaluate_cases, CaseFile, EvaluationSummary, HolderReport},
    model::{Architecture, MlpSpec},
    FeatureSchema,
};
use serde::Serialize;
use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "fedfraud-evaluate")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[derive(Serialize)]
struct Report<'a> {
    holders: &'a [HolderReport],
    summary: &'a EvaluationSummary,
}

fn evaluate(
    run: &RunSettings,
    data: &DataSettings,
    training: &TrainingSettings,
    evaluation: &EvaluationSettings,
) -> anyhow::Result<EvaluationSummary> {
    let schema = FeatureSchema::from_path(&data.schema)
        .with_context(|| format!("cannot load schema {}", data.schema.display()))?;
    let spec = MlpSpec::new(schema.feature_dim(), training.hidden_units.clone(), training.l2);
    let model_path = evaluation
        .model
        .clone()
        .unwrap_or_else(|| run.run_root.join("export").join(MODEL_FILE));
    let weights = archive::load(&model_path, &spec.slot_shapes())
        .with_context(|| format!("cannot load model {}", model_path.display()))?;
    let model = spec.instantiate(weights)?;

    let mut reports = Vec::with_capacity(evaluation.cases.len());
    for path in &evaluation.cases {
        let cases = CaseFile::from_path(path)
            .with_context(|| format!("cannot load cases {}", path.display()))?;
        let report = evaluate_cases(model.as_ref(), &schema, &cases, evaluation.threshold_mode())?;
        info!(
            holder = %report.holder,
            threshold = report.threshold,
            correct = report.correct,
            total = report.total,
            "holder evaluated"
        );
        reports.push(report);
    }
    let summary = EvaluationSummary::from_reports(&reports);

    if let Some(path) = &evaluation.report {
        let json = serde_json::to_string_pretty(&Report {
            holders: &reports,
            summary: &summary,
        })?;
        archive::write_file_atomic(path, json.as_bytes())
            .with_context(|| format!("cannot write report {}", path.display()))?;
    }
    Ok(summary)
}

fn main() {
    let opt = Opt::from_args();

    let settings = Settings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });

    let Settings {
        run: run_settings,
        data: data_settings,
        training: training_settings,
        evaluation: evaluation_settings,
        log: log_settings,
        ..
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    match evaluate(
        &run_settings,
        &data_settings,
        &training_settings,
        &evaluation_settings,
    ) {
        Ok(summary) => info!(
            correct = summary.correct,
            total = summary.total,
            accuracy = summary.accuracy,
            "evaluation finished"
        ),
        Err(err) => {
            error!("evaluation failed: {:#}", err);
            process::exit(1);
        }
    }
}
