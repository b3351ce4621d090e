use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::{
    application::{
        error::HttpError,
        print::PrintError,
        topics::Requester,
    },
    domain::job::{PrintJob, RequestOrigin},
};

use super::HttpState;

const FORWARDED_PROTO_HEADER: &str = "x-forwarded-proto";
pub const LAYERS_REMOVED_HEADER: &str = "x-print-layers-removed";
const JAVASCRIPT_CONTENT_TYPE: &str = "application/javascript; charset=utf-8";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct InfoQuery {
    var: Option<String>,
}

pub(super) async fn info(
    State(state): State<HttpState>,
    Query(query): Query<InfoQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let origin = request_origin(&headers);
    let document = state.print.describe(&origin).await?;

    let Some(name) = query.var else {
        return Ok(Json(document).into_response());
    };
    if !is_js_identifier(&name) {
        return Err(HttpError::new(
            "infra::http::print::info",
            StatusCode::BAD_REQUEST,
            "Invalid variable name",
            format!("`{name}` is not a JavaScript identifier"),
        ));
    }

    let body = format!("var {name}={document};");
    Ok((
        [(header::CONTENT_TYPE, JAVASCRIPT_CONTENT_TYPE)],
        body,
    )
        .into_response())
}

pub(super) async fn create(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, HttpError> {
    let job: PrintJob = serde_json::from_slice(&body)
        .map_err(|err| PrintError::validation(format!("malformed print job: {err}")))?;

    let requester = requester(&state, &headers);
    let origin = request_origin(&headers);
    let outcome = state.print.create(job, &requester, &origin).await?;

    let mut response = Json(outcome.descriptor).into_response();
    response.headers_mut().insert(
        LAYERS_REMOVED_HEADER,
        HeaderValue::from(outcome.layers_removed),
    );
    Ok(response)
}

pub(super) async fn show(
    State(state): State<HttpState>,
    Path(file_name): Path<String>,
) -> Result<Response, HttpError> {
    let (bytes, format) = state.print.fetch(&file_name).await?;

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{file_name}\""))
        .map_err(|err| {
            HttpError::from_error(
                "infra::http::print::show",
                StatusCode::INTERNAL_SERVER_ERROR,
                "Print failed",
                &err,
            )
        })?;

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static(format.content_type())),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

pub(super) async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn requester(state: &HttpState, headers: &HeaderMap) -> Requester {
    let granted = state
        .trusted_topics_header
        .as_ref()
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok());
    state.print.topics().requester(granted)
}

fn request_origin(headers: &HeaderMap) -> RequestOrigin {
    let protocol = headers
        .get(FORWARDED_PROTO_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| matches!(*value, "http" | "https"))
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or("localhost");
    RequestOrigin::new(protocol, host)
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    let valid_start = |c: char| c.is_ascii_alphabetic() || c == '_' || c == '$';
    valid_start(first) && chars.all(|c| valid_start(c) || c.is_ascii_digit() || c == '.')
        && !name.ends_with('.')
        && !name.contains("..")
}
