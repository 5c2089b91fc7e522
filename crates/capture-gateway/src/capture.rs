use crate::agent::CaptureTarget;
use crate::App;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Pending packets buffered between fetch tasks and the merge loop. A full
/// queue blocks producers, providing backpressure.
const QUEUE_DEPTH: usize = 1000;

#[derive(Debug, serde::Deserialize)]
pub struct CaptureParams {
    appid: Option<String>,
    /// Instance indices to capture from. Defaults to instance 0.
    #[serde(default)]
    index: Vec<u32>,
    #[serde(rename = "type")]
    process_type: Option<String>,
    device: Option<String>,
    filter: Option<String>,
}

/// One message from a fetch task. Every task pushes exactly one `Done` at
/// exit, successful or not; counting them is the merge loop's sole
/// termination condition.
enum SourceMessage {
    Packet(pcap::PacketRecord),
    Done,
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error(transparent)]
    Resolve(#[from] crate::control_plane::ResolverError),
    #[error(transparent)]
    Agent(#[from] crate::agent::AgentError),
    #[error(transparent)]
    Decode(#[from] pcap::DecodeError),
}

pub async fn handle_capture(
    State(app): State<Arc<App>>,
    axum_extra::extract::Query(params): axum_extra::extract::Query<CaptureParams>,
    headers: axum::http::HeaderMap,
) -> Response {
    let Some(app_id) = params.appid else {
        return (StatusCode::BAD_REQUEST, "appid missing").into_response();
    };
    let indices = if params.index.is_empty() {
        vec![0]
    } else {
        params.index
    };
    let process_type = params.process_type.unwrap_or_else(|| "web".to_string());
    let device = params.device.unwrap_or_else(|| "eth0".to_string());
    let filter = params.filter.unwrap_or_default();

    let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
    else {
        return (StatusCode::UNAUTHORIZED, "authentication required").into_response();
    };

    match app.control_plane.is_visible(&app_id, &token).await {
        Ok(true) => (),
        Ok(false) => {
            tracing::info!(%app_id, "application is not visible to the presented token");
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(err) => {
            tracing::error!(%app_id, error = ?err, "could not check application visibility");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    tracing::info!(%app_id, ?indices, %process_type, %device, "starting capture");

    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    for &index in &indices {
        let app = app.clone();
        let tx = tx.clone();
        let (app_id, process_type, device, filter, token) = (
            app_id.clone(),
            process_type.clone(),
            device.clone(),
            filter.clone(),
            token.clone(),
        );

        tokio::spawn(async move {
            let result = fetch_instance(
                &app,
                &app_id,
                index,
                &process_type,
                &device,
                &filter,
                &token,
                &tx,
            )
            .await;
            if let Err(err) = result {
                tracing::error!(%app_id, index, error = ?err, "capture of instance failed");
            }
            // Exactly one terminal signal per task, on every exit path.
            let _ = tx.send(SourceMessage::Done).await;
        });
    }
    drop(tx);

    let body = Body::from_stream(merge_stream(rx, indices.len(), app_id));
    (
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response()
}

/// Resolve one instance's location, open its capture stream, and push every
/// decoded record onto the shared queue.
#[allow(clippy::too_many_arguments)]
async fn fetch_instance(
    app: &App,
    app_id: &str,
    index: u32,
    process_type: &str,
    device: &str,
    filter: &str,
    token: &str,
    tx: &mpsc::Sender<SourceMessage>,
) -> Result<(), FetchError> {
    let host = app
        .control_plane
        .resolve_location(app_id, index, process_type, token)
        .await?;
    tracing::debug!(app_id, index, %host, "resolved instance location");

    let target = CaptureTarget {
        host,
        app_id: app_id.to_string(),
        index,
        device: device.to_string(),
        filter: filter.to_string(),
    };
    let stream = app.source.open(&target).await?;

    let mut decoder = pcap::Decoder::new(stream).await?;
    while let Some(record) = decoder.next().await? {
        tracing::trace!(
            index,
            ts_sec = record.ts_sec,
            captured = record.data.len(),
            length = record.orig_len,
            "read packet"
        );
        if tx.send(SourceMessage::Packet(record)).await.is_err() {
            return Ok(()); // The client went away; stop reading.
        }
    }
    Ok(())
}

struct MergeState {
    rx: mpsc::Receiver<SourceMessage>,
    tasks: usize,
    done: usize,
    bytes_total: usize,
    app_id: String,
}

/// The merged response body: one global header chunk, then one chunk per
/// packet in arrival order across all tasks. No cross-task reordering is
/// performed; packets of one task keep their source order.
fn merge_stream(
    rx: mpsc::Receiver<SourceMessage>,
    tasks: usize,
    app_id: String,
) -> impl futures::Stream<Item = Result<Bytes, std::convert::Infallible>> {
    use futures::StreamExt;

    let header = pcap::file_header();
    let state = MergeState {
        rx,
        tasks,
        done: 0,
        bytes_total: header.len(),
        app_id,
    };

    let records = futures::stream::unfold(state, |mut state| async move {
        loop {
            match state.rx.recv().await {
                Some(SourceMessage::Packet(record)) => {
                    let chunk = pcap::encode_record(&record);
                    state.bytes_total += chunk.len();
                    return Some((chunk, state));
                }
                Some(SourceMessage::Done) => {
                    state.done += 1;
                    if state.done == state.tasks {
                        tracing::info!(
                            app_id = %state.app_id,
                            bytes_total = state.bytes_total,
                            instances = state.tasks,
                            "finished merging capture streams"
                        );
                        return None;
                    }
                }
                // Every task sends Done before dropping its sender, so the
                // channel only closes after all Done messages were counted.
                None => return None,
            }
        }
    });

    futures::stream::iter([header]).chain(records).map(Ok)
}
