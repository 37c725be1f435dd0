//! Data feed ingestion endpoint

use axum::{
    body::Body,
    extract::{ConnectInfo, OriginalUri, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use feedhouse_core::{headers, AttributeMap, FeedStatus};
use feedhouse_storage::ReceiveError;
use futures::TryStreamExt;
use std::io;
use std::net::SocketAddr;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tracing::{error, warn};

use crate::AppState;

pub async fn receive(
    State(state): State<AppState>,
    remote: Option<ConnectInfo<SocketAddr>>,
    OriginalUri(uri): OriginalUri,
    request_headers: HeaderMap,
    body: Body,
) -> Response {
    let attributes = attributes_from(&request_headers, remote, uri.path());
    stage(state, attributes, body).await
}

/// `/datafeed/:feed`; a `Feed` header still takes precedence.
pub async fn receive_for_feed(
    State(state): State<AppState>,
    Path(feed): Path<String>,
    remote: Option<ConnectInfo<SocketAddr>>,
    OriginalUri(uri): OriginalUri,
    request_headers: HeaderMap,
    body: Body,
) -> Response {
    let mut attributes = attributes_from(&request_headers, remote, uri.path());
    if attributes.get_non_empty(headers::FEED).is_none() {
        attributes.insert(headers::FEED, &feed);
    }
    stage(state, attributes, body).await
}

/// Copy request headers into an attribute map, minus hop-by-hop and credentials.
fn attributes_from(
    request_headers: &HeaderMap,
    remote: Option<ConnectInfo<SocketAddr>>,
    path: &str,
) -> AttributeMap {
    let mut attributes = AttributeMap::new();
    for (name, value) in request_headers {
        if headers::is_excluded_header(name.as_str()) {
            continue;
        }
        match value.to_str() {
            Ok(value) => {
                attributes.insert(name.as_str(), value);
            }
            Err(_) => warn!(header = %name, "Ignoring header with non-ASCII value"),
        }
    }

    if let Some(ConnectInfo(addr)) = remote {
        attributes.insert(headers::REMOTE_ADDRESS, addr.ip().to_string());
    }
    attributes.insert(headers::RECEIVED_PATH, path);
    attributes
}

async fn stage(state: AppState, attributes: AttributeMap, body: Body) -> Response {
    if state.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Relay is shutting down").into_response();
    }

    let source = attributes
        .get_non_empty(headers::REMOTE_ADDRESS)
        .unwrap_or("unknown")
        .to_string();
    let received_at = Utc::now();

    // The receiver reads synchronously; bridge the body stream onto the blocking pool.
    let stream = body
        .into_data_stream()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
    let reader = SyncIoBridge::new(StreamReader::new(stream));
    let receiver = state.receiver.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        receiver.receive(received_at, attributes, &source, reader)
    })
    .await;

    match outcome {
        Ok(Ok(receipt)) => (
            StatusCode::OK,
            [(headers::FEED_STATUS, status_value(FeedStatus::Ok))],
            format!("{}: {}", headers::RECEIPT_ID, receipt.receipt_id),
        )
            .into_response(),
        Ok(Err(e)) => rejection(&e),
        Err(e) => {
            error!(error = %e, "Receive task failed");
            feed_status_response(FeedStatus::UnknownError, "Receive task failed".to_string())
        }
    }
}

fn rejection(e: &ReceiveError) -> Response {
    let status = e.status();
    if status == FeedStatus::UnknownError {
        error!(error = %e, "Failed to stage submission");
    }
    feed_status_response(status, e.to_string())
}

fn feed_status_response(status: FeedStatus, message: String) -> Response {
    let code = StatusCode::from_u16(status.http_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        code,
        [(headers::FEED_STATUS, status_value(status))],
        message,
    )
        .into_response()
}

fn status_value(status: FeedStatus) -> HeaderValue {
    HeaderValue::from(status.code())
}
