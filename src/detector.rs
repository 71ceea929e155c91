use crate::access::{AccessController, Outcome};
use crate::backend::Backend;
use crate::gate::GateActuator;
use crate::selector::{CandidateSelector, Frame, TextRecognizer};
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc::Receiver;
use tokio::sync::watch;

#[derive(Clone, Copy, Debug)]
pub struct DetectorSettings {
    pub frame_stride: u32,
    /// Readings below this are logged and never reach the controller.
    pub action_confidence: f32,
}

/// Consumes frames from the ingest channel, recognizing every `frame_stride`-th one.
///
/// Recognition runs on a blocking worker. Backend checks for a detection run
/// inline, so a slow backend backs up the frame channel rather than piling up
/// requests.
pub async fn run<R, B, G>(
    mut frames: Receiver<Frame>,
    selector: Arc<CandidateSelector<R>>,
    controller: Arc<AccessController<B, G>>,
    settings: DetectorSettings,
    mut shutdown: watch::Receiver<bool>,
) where
    R: TextRecognizer + 'static,
    B: Backend,
    G: GateActuator,
{
    let stride = u64::from(settings.frame_stride.max(1));
    let mut seen: u64 = 0;
    loop {
        let frame = tokio::select! {
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => {
                    info!("Frame channel closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                info!("Detector stopping");
                break;
            }
        };
        seen += 1;
        if (seen - 1) % stride != 0 {
            continue;
        }
        if frame.regions.is_empty() {
            debug!("Frame {} has no plate regions", seen);
            continue;
        }

        let selector = selector.clone();
        let candidate = match tokio::task::spawn_blocking(move || selector.select(&frame)).await {
            Ok(Some(candidate)) => candidate,
            Ok(None) => {
                debug!("Frame {}: no plate reading", seen);
                continue;
            }
            Err(e) => {
                error!("Recognition task failed: {}", e);
                continue;
            }
        };
        let region = candidate.region;
        debug!(
            "Frame {}: {} from {:?} ({:.3}, exact: {}) at {}x{}+{}+{}",
            seen,
            candidate.plate,
            candidate.raw_text,
            candidate.confidence,
            candidate.exact,
            region.width,
            region.height,
            region.x,
            region.y
        );
        if candidate.confidence < settings.action_confidence {
            info!(
                "Ignoring {} at {:.3}, below action confidence {:.2}",
                candidate.plate, candidate.confidence, settings.action_confidence
            );
            continue;
        }
        match controller.on_detection(&candidate.plate).await {
            Outcome::AlreadyHandled | Outcome::InFlight => {}
            outcome => info!("{} -> {:?}", candidate.plate, outcome),
        }
    }
}
