mod access;
mod backend;
mod config;
mod db;
mod detector;
mod dispatch;
mod error;
mod gate;
mod ledger;
mod normalize;
mod ocr;
mod payments;
mod preprocess;
mod selector;
#[cfg(test)]
mod testing;
mod types;
mod webhook;

use crate::access::AccessController;
use crate::backend::HttpBackend;
use crate::config::Config;
use crate::gate::JournalGate;
use crate::ledger::DedupLedger;
use crate::normalize::PlateNormalizer;
use crate::ocr::HttpRecognizer;
use crate::payments::PaymentRegistry;
use crate::selector::CandidateSelector;
use env_logger::Env;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::channel;
use tokio::sync::watch;

#[macro_use]
extern crate failure;

const FRAME_QUEUE: usize = 8;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting plate-gate");

    if let Err(e) = run().await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
    info!("Exiting main");
}

async fn run() -> Result<(), failure::Error> {
    let config = Config::from_env()?;
    info!(
        "Backend {}, OCR {}, device {}",
        config.backend_url, config.ocr_url, config.device_name
    );
    info!(
        "Plate grammar: {} characters, layouts {}",
        config.grammar.length(),
        config
            .grammar
            .layouts()
            .iter()
            .map(|l| l.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let (stop_tx, stop_rx) = watch::channel(false);

    let backend = Arc::new(HttpBackend::new(
        config.backend_url.clone(),
        config.http_timeout,
    )?);
    let (queue, dispatcher) = dispatch::spawn(
        backend.clone(),
        &config.device_name,
        config.drain_timeout,
        stop_rx.clone(),
    );
    let gate = Arc::new(JournalGate::new(
        db::open(&config.journal_path)?,
        queue.clone(),
    ));
    let controller = Arc::new(AccessController::new(
        backend,
        gate,
        Arc::new(DedupLedger::new()),
        PaymentRegistry::new(),
        queue,
        config.payment,
        stop_rx.clone(),
    ));
    let selector = Arc::new(CandidateSelector::new(
        PlateNormalizer::new(config.grammar.clone()),
        HttpRecognizer::new(config.ocr_url.clone(), config.http_timeout, Handle::current())?,
        config.selector,
    ));

    let (tx, rx) = channel(FRAME_QUEUE);
    let detector_task = tokio::spawn(detector::run(
        rx,
        selector,
        controller.clone(),
        config.detector,
        stop_rx.clone(),
    ));
    let webhook_task = tokio::spawn(webhook::run(
        config.listen_port,
        tx,
        controller.clone(),
        stop_rx,
    ));
    tokio::select! {
        result = detector_task => {
            if let Err(e) = result {
                error!("Detector task failed: {}", e);
            }
        }
        result = webhook_task => match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Webhook server failed: {}", e),
            Err(e) => error!("Webhook task failed: {}", e),
        },
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Interrupted"),
            Err(e) => error!("Unable to listen for Ctrl-C: {}", e),
        },
    }

    info!("Shutting down");
    signal_stop(&stop_tx);
    tokio::join!(
        dispatcher.join(),
        controller.pollers().join(config.drain_timeout)
    );
    Ok(())
}

/// Returns false when every receiver has already gone away.
fn signal_stop(stop: &watch::Sender<bool>) -> bool {
    if stop.send(true).is_err() {
        debug!("No task is listening for the stop signal");
        return false;
    }
    true
}
