//! `analyst-watch` -- follow an analysis run from the terminal.
//!
//! With one input, runs a single session; with several, runs them as one
//! batch and prints the final ranking. Progress is logged as it arrives
//! and the final snapshot is printed to stdout as JSON. Ctrl-C cancels.
//!
//! ```text
//! analyst-watch AAPL
//! analyst-watch AAPL MSFT NVDA
//! ```
//!
//! # Environment variables
//!
//! | Variable                  | Required | Default                     | Description                         |
//! |---------------------------|----------|-----------------------------|-------------------------------------|
//! | `ANALYST_STREAM_URL`      | no       | `http://localhost:8000/api` | Base address of the analysis API    |
//! | `ANALYST_PIPELINE`        | no       | `standard`                  | Stage table, `standard`/`extended`  |
//! | `ANALYST_CONNECT_RETRIES` | no       | `2`                         | Retries when a stream fails to open |
//! | `ANALYST_RETRY_DELAY_MS`  | no       | `500`                       | Delay before the first retry        |
//! | `RUST_LOG`                | no       | `analyst_watch=info,analyst_stream=info` | Log filter             |

use std::sync::Arc;

use analyst_core::session::SessionSnapshot;
use analyst_stream::{
    BatchController, HttpConnector, SessionController, SessionUpdate, StreamConfig,
};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Follow an analysis run from the terminal.
#[derive(Parser, Debug)]
#[command(name = "analyst-watch")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Inputs to analyse. Several inputs run as one batch.
    #[arg(required = true, value_name = "INPUT")]
    inputs: Vec<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let Args { inputs } = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "analyst_watch=info,analyst_stream=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = StreamConfig::from_env().unwrap_or_else(|e| {
        tracing::error!(error = %e, "Invalid configuration");
        std::process::exit(1);
    });

    tracing::info!(
        base_url = %config.base_url,
        pipeline = config.pipeline.as_str(),
        inputs = inputs.len(),
        "Starting analyst-watch",
    );

    let connector = Arc::new(HttpConnector::new());
    let ok = if let [input] = inputs.as_slice() {
        watch_single(SessionController::new(config, connector), input).await
    } else {
        watch_batch(BatchController::new(config, connector), inputs).await
    };

    if !ok {
        std::process::exit(1);
    }
}

async fn watch_single(controller: SessionController, input: &str) -> bool {
    tokio::spawn(log_updates(controller.subscribe()));

    let job = controller.start(input);
    let result = tokio::select! {
        result = job => result,
        _ = tokio::signal::ctrl_c() => {
            controller.cancel();
            tracing::warn!("Interrupted");
            return false;
        }
    };

    if let Some(snapshot) = controller.current() {
        report_failed_tasks(&snapshot);
        print_json(&snapshot);
    }
    match result {
        Ok(_) => true,
        Err(e) => {
            tracing::error!(input = %input, error = %e, "Analysis failed");
            false
        }
    }
}

async fn watch_batch(controller: BatchController, inputs: Vec<String>) -> bool {
    tokio::spawn(log_updates(controller.subscribe()));

    let batch = match controller.start_batch(inputs) {
        Ok(batch) => batch,
        Err(e) => {
            tracing::error!(error = %e, "Could not start batch");
            return false;
        }
    };
    let result = tokio::select! {
        result = batch => result,
        _ = tokio::signal::ctrl_c() => {
            controller.cancel_batch();
            tracing::warn!("Interrupted");
            return false;
        }
    };

    if let Some(snapshot) = controller.batch() {
        snapshot.sessions.iter().for_each(report_failed_tasks);
        print_json(&snapshot);
    }
    match result {
        Ok(snapshot) => {
            for entry in &snapshot.ranked {
                tracing::info!(rank = entry.rank, input = %entry.input, score = ?entry.score, "Ranked");
            }
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Batch failed");
            false
        }
    }
}

async fn log_updates(mut rx: broadcast::Receiver<SessionUpdate>) {
    loop {
        match rx.recv().await {
            Ok(SessionUpdate::Progress {
                input,
                stage,
                progress,
                ..
            }) => {
                tracing::info!(input = %input, stage = %stage, progress, "Progress");
            }
            Ok(SessionUpdate::TaskFinished {
                input,
                task,
                success,
                ..
            }) => {
                tracing::info!(input = %input, task = %task, success, "Sub-task finished");
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Update log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn report_failed_tasks(snapshot: &SessionSnapshot) {
    for task in snapshot.status.failed_tasks() {
        tracing::warn!(input = %snapshot.input, task = %task, "Sub-task failed");
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!(error = %e, "Failed to serialize snapshot"),
    }
}
