use crate::access::AccessController;
use crate::backend::Backend;
use crate::gate::JournalGate;
use crate::selector::{Frame, RankedRegions};
use crate::types::Region;
use bytes::Buf;
use futures::{pin_mut, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;
use tokio::sync::watch;
use warp::http::StatusCode;
use warp::multipart::{FormData, Part};
use warp::{Filter, Rejection, Reply};

const MAX_UPLOAD_BYTES: u64 = 16 * 1024 * 1024;

type Controller<B> = Arc<AccessController<B, JournalGate>>;

#[derive(Debug)]
struct HandleFrameError;

impl warp::reject::Reject for HandleFrameError {}

#[derive(Default, Deserialize)]
struct FrameMeta {
    #[serde(default)]
    regions: Vec<Region>,
}

/// Serves frame ingest and the control endpoints until `shutdown` fires.
pub async fn run<B: Backend>(
    port: u16,
    frames: Sender<Frame>,
    controller: Controller<B>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), warp::Error> {
    let (addr, server) = warp::serve(routes(frames, controller)).try_bind_with_graceful_shutdown(
        SocketAddr::from(([0, 0, 0, 0], port)),
        async move {
            let _ = shutdown.changed().await;
        },
    )?;
    info!("Listening on {}", addr);
    server.await;
    info!("Webhook server stopped");
    Ok(())
}

fn routes<B: Backend>(
    frames: Sender<Frame>,
    controller: Controller<B>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone {
    let frame = warp::path!("frame")
        .and(warp::post())
        .and(warp::multipart::form().max_length(MAX_UPLOAD_BYTES))
        .and(warp::any().map(move || frames.clone()))
        .and_then(|form, tx| async move {
            let result = handle_frame(form, tx).await;
            if let Err(e) = &result {
                error!("Error handling frame: {}", e);
            }
            result.map_err(|_| warp::reject::custom(HandleFrameError))
        });

    let status_controller = controller.clone();
    let status = warp::path!("status")
        .and(warp::get())
        .map(move || {
            let c = &status_controller;
            warp::reply::json(&json!({
                "handled": c.ledger().len(),
                "pending": c.payments().pending_count(),
                "delivered": c.dispatch().delivered_count(),
                "opened": c.gate().openings(),
            }))
        });

    let reset = warp::path!("reset").and(warp::post()).map(move || {
        let cleared = controller.ledger().reset();
        let forgotten = controller.dispatch().forget_delivered();
        info!(
            "Reset: cleared {} handled plate(s), {} delivered event key(s)",
            cleared, forgotten
        );
        warp::reply::json(&json!({ "cleared": cleared }))
    });

    frame.or(status).or(reset).recover(recover)
}

async fn recover(rejection: Rejection) -> Result<impl Reply, Infallible> {
    let status = if rejection.find::<HandleFrameError>().is_some() {
        StatusCode::BAD_REQUEST
    } else if rejection.is_not_found() {
        StatusCode::NOT_FOUND
    } else if rejection.find::<warp::reject::MethodNotAllowed>().is_some() {
        StatusCode::METHOD_NOT_ALLOWED
    } else {
        warn!("Unhandled rejection: {:?}", rejection);
        StatusCode::BAD_REQUEST
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "error": status.canonical_reason() })),
        status,
    ))
}

async fn handle_frame(form: FormData, tx: Sender<Frame>) -> Result<impl Reply, failure::Error> {
    let mut meta: Option<FrameMeta> = None;
    let mut upload: Option<Vec<u8>> = None;

    pin_mut!(form);
    while let Some(part) = form.next().await {
        let part = part?;
        debug!("Got part {}", part.name());
        match part.name() {
            "json" => meta = Some(serde_json::from_slice(&read_part(part).await?)?),
            "upload" => upload = Some(read_part(part).await?),
            _ => warn!("Ignoring part {}", part.name()),
        }
    }

    let upload = upload.ok_or_else(|| format_err!("Missing upload part"))?;
    let image = image::load_from_memory(&upload)?.to_luma8();
    // Frames without a json part carry no regions and are dropped by the detector.
    let meta = meta.unwrap_or_default();
    let frame = Frame::extract(image, &RankedRegions::new(meta.regions));
    let regions = frame.regions.len();
    debug!(
        "Queueing {}x{} frame with {} region(s)",
        frame.image.width(),
        frame.image.height(),
        regions
    );
    tx.send(frame)
        .await
        .map_err(|_| format_err!("Detector is no longer accepting frames"))?;

    Ok(warp::reply::with_status(
        warp::reply::json(&json!({ "regions": regions })),
        StatusCode::ACCEPTED,
    ))
}

async fn read_part(part: Part) -> Result<Vec<u8>, warp::Error> {
    let mut data: Vec<u8> = vec![];
    let stream = part.stream();
    pin_mut!(stream);
    while let Some(buf) = stream.next().await {
        let mut buf = buf?;
        while buf.has_remaining() {
            let chunk = buf.chunk();
            let n = chunk.len();
            data.extend_from_slice(chunk);
            buf.advance(n);
        }
    }
    Ok(data)
}
