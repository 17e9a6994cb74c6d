//! Target HTTP server: the data plane plus the target side of the
//! control plane (`/v1/txn`, `/v1/xactions`, `/v1/download`, `/v1/sort`,
//! `/v1/metasync`, `/v1/daemon`).

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::info;

use crate::api::{
    ApiError, ListQueryParams, ReqMeta, TxnQuery, XactQueryParams, HDR_CHECKSUM_TYPE,
    HDR_CHECKSUM_VALUE, HDR_OBJ_VERSION,
};
use crate::config::AisConfig;
use crate::downloader::{DlBody, Downloader};
use crate::error::AisError;
use crate::metasync::RevsPayload;
use crate::txn::TxnPhase;
use crate::types::{ActionMsg, Bck, Provider, XactionMsg, ACT_XACT_START, ACT_XACT_STOP};
use crate::xact::{TaskXact, Xact, XactKind, XactQuery};

use super::Target;

/// Shared state of the target server.
#[derive(Clone)]
pub struct TargetState {
    pub target: Arc<Target>,
    pub downloader: Arc<Downloader>,
    pub config: Arc<AisConfig>,
}

pub fn target_router(state: TargetState) -> Router {
    Router::new()
        .route(
            "/v1/objects/:bucket/*object",
            get(get_object)
                .head(head_object)
                .put(put_object)
                .delete(delete_object),
        )
        .route("/v1/buckets/:bucket", get(list_bucket))
        .route("/v1/txn/:bucket/:phase", post(handle_txn))
        .route("/v1/xactions", get(xact_query).put(xact_control))
        .route(
            "/v1/download",
            post(download_submit)
                .get(download_status)
                .delete(download_abort),
        )
        .route("/v1/sort", post(dsort_submit))
        .route("/v1/metasync", post(metasync_recv))
        .route("/v1/daemon", get(daemon_what).put(daemon_set))
        .route("/v1/health", get(|| async { StatusCode::OK }))
        .with_state(state)
}

fn parse_bck(params: &ListQueryParams, bucket: &str) -> Result<Bck, AisError> {
    let provider: Provider = params
        .provider
        .as_deref()
        .unwrap_or("ais")
        .parse()
        .unwrap_or(Provider::Ais);
    Ok(Bck::new(provider, bucket))
}

// object data path

async fn get_object(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Path((bucket, object)): Path<(String, String)>,
    Query(params): Query<ListQueryParams>,
) -> Result<Response, ApiError> {
    let bck = parse_bck(&params, &bucket).map_err(|e| meta.err(e))?;
    let (body, lom) = state
        .target
        .get_object(&bck, &object)
        .await
        .map_err(|e| meta.err(e))?;

    let mut headers = HeaderMap::new();
    headers.insert(HDR_CHECKSUM_TYPE, HeaderValue::from_static("xxhash"));
    if let Ok(value) = HeaderValue::from_str(&lom.checksum) {
        headers.insert(HDR_CHECKSUM_VALUE, value);
    }
    if !lom.version.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&lom.version) {
            headers.insert(HDR_OBJ_VERSION, value);
        }
    }
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&body.len().to_string()).expect("numeric header"),
    );
    Ok((headers, body).into_response())
}

async fn head_object(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Path((bucket, object)): Path<(String, String)>,
    Query(params): Query<ListQueryParams>,
) -> Result<Response, ApiError> {
    let bck = parse_bck(&params, &bucket).map_err(|e| meta.err(e))?;
    let lom = state
        .target
        .head_object(&bck, &object)
        .await
        .map_err(|e| meta.err(e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&lom.size.to_string()).expect("numeric header"),
    );
    if let Ok(value) = HeaderValue::from_str(&lom.checksum) {
        headers.insert(HDR_CHECKSUM_VALUE, value);
    }
    Ok((headers, StatusCode::OK).into_response())
}

async fn put_object(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Path((bucket, object)): Path<(String, String)>,
    Query(params): Query<ListQueryParams>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let bck = parse_bck(&params, &bucket).map_err(|e| meta.err(e))?;
    state
        .target
        .put_object(&bck, &object, body)
        .await
        .map_err(|e| meta.err(e))?;
    Ok(StatusCode::OK)
}

async fn delete_object(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Path((bucket, object)): Path<(String, String)>,
    Query(params): Query<ListQueryParams>,
) -> Result<StatusCode, ApiError> {
    let bck = parse_bck(&params, &bucket).map_err(|e| meta.err(e))?;
    state
        .target
        .delete_object(&bck, &object)
        .await
        .map_err(|e| meta.err(e))?;
    Ok(StatusCode::OK)
}

async fn list_bucket(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Path(bucket): Path<String>,
    Query(params): Query<ListQueryParams>,
) -> Result<Response, ApiError> {
    let bck = parse_bck(&params, &bucket).map_err(|e| meta.err(e))?;
    let listing = state
        .target
        .list_objects(&bck, &params.to_select_msg())
        .await
        .map_err(|e| meta.err(e))?;
    Ok(Json(listing).into_response())
}

// control plane

async fn handle_txn(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Path((bucket, phase)): Path<(String, String)>,
    Query(query): Query<TxnQuery>,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    let phase = TxnPhase::parse(&phase)
        .ok_or_else(|| meta.err(AisError::BadRequest(format!("unknown phase {:?}", phase))))?;
    let bck = Bck::ais(bucket);
    let timeout = query
        .txn_timeout
        .map(Duration::from_millis)
        .unwrap_or(state.config.timeouts.txn);
    state
        .target
        .handle_txn(phase, &query.uuid, &bck, &msg, timeout)
        .await
        .map_err(|e| meta.err(e))?;
    Ok(StatusCode::OK)
}

fn xact_query_of(params: &XactQueryParams) -> Result<XactQuery, AisError> {
    let mut query = XactQuery::default();
    if let Some(id) = &params.id {
        query.id = id.clone();
    }
    if let Some(kind) = &params.kind {
        query.kind = Some(
            XactKind::parse(kind)
                .ok_or_else(|| AisError::BadRequest(format!("unknown xaction kind {:?}", kind)))?,
        );
    }
    if let Some(bucket) = &params.bucket {
        let provider: Provider = params
            .provider
            .as_deref()
            .unwrap_or("ais")
            .parse()
            .unwrap_or(Provider::Ais);
        query.bck = Some(Bck::new(provider, bucket));
    }
    query.only_running = params.running.unwrap_or(false);
    Ok(query)
}

async fn xact_query(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Query(params): Query<XactQueryParams>,
) -> Result<Response, ApiError> {
    let registry = &state.target.registry;
    match params.what.as_deref().unwrap_or("stats") {
        "stats" => {
            if params.latest.unwrap_or(false) {
                let query = xact_query_of(&params).map_err(|e| meta.err(e))?;
                let Some(kind) = query.kind else {
                    return Err(meta.err(AisError::BadRequest(
                        "latest requires a kind".into(),
                    )));
                };
                let snap = registry
                    .latest_snap(kind, query.bck.as_ref())
                    .ok_or_else(|| {
                        meta.err(AisError::XactionNotFound(format!("{}", kind)))
                    })?;
                return Ok(Json(vec![snap]).into_response());
            }
            let query = xact_query_of(&params).map_err(|e| meta.err(e))?;
            let snaps = registry.stats(&query).map_err(|e| meta.err(e))?;
            Ok(Json(snaps).into_response())
        }
        "running" => {
            let query = xact_query_of(&params).map_err(|e| meta.err(e))?;
            let running = registry.is_running(&query);
            Ok(Json(serde_json::json!({ "running": running })).into_response())
        }
        other => Err(meta.err(AisError::BadRequest(format!("unknown what {:?}", other)))),
    }
}

async fn xact_control(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    let xmsg: XactionMsg = msg.parse_value().map_err(|e| meta.err(e))?;
    match msg.action.as_str() {
        ACT_XACT_START => {
            let kind = XactKind::parse(&xmsg.kind).ok_or_else(|| {
                meta.err(AisError::BadRequest(format!(
                    "unknown xaction kind {:?}",
                    xmsg.kind
                )))
            })?;
            state
                .target
                .start_xaction(kind, xmsg.bck.clone())
                .map_err(|e| meta.err(e))?;
            Ok(StatusCode::OK)
        }
        ACT_XACT_STOP => {
            let mut query = XactQuery::default();
            query.id = xmsg.id.clone();
            if !xmsg.kind.is_empty() {
                query.kind = XactKind::parse(&xmsg.kind);
            }
            query.bck = xmsg.bck.clone();
            state.target.registry.abort(&query);
            Ok(StatusCode::OK)
        }
        other => Err(meta.err(AisError::BadRequest(format!("unknown action {:?}", other)))),
    }
}

// downloader

async fn download_submit(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Json(body): Json<DlBody>,
) -> Result<Response, ApiError> {
    let id = state.downloader.submit(body).map_err(|e| meta.err(e))?;
    Ok(Json(serde_json::json!({ "id": id })).into_response())
}

#[derive(Deserialize)]
struct DlQuery {
    id: String,
}

async fn download_status(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Query(query): Query<DlQuery>,
) -> Result<Response, ApiError> {
    let status = state.downloader.status(&query.id).map_err(|e| meta.err(e))?;
    Ok(Json(status).into_response())
}

async fn download_abort(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Query(query): Query<DlQuery>,
) -> Result<StatusCode, ApiError> {
    state
        .downloader
        .abort_job(&query.id)
        .map_err(|e| meta.err(e))?;
    Ok(StatusCode::OK)
}

// dSort: the shard codec is an external collaborator; the submit surface
// validates the spec and tracks the run as a task xaction.

#[derive(Debug, Clone, Deserialize)]
struct DsortSpec {
    bck: Bck,
    #[serde(default)]
    output_bck: Option<Bck>,
    input_format: String,
    #[serde(default)]
    output_format: String,
    #[serde(default)]
    output_shard_size: Option<u64>,
}

async fn dsort_submit(
    State(state): State<TargetState>,
    meta: ReqMeta,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    // JSON or YAML accepted
    let is_yaml = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("yaml"))
        .unwrap_or(false);
    let spec: DsortSpec = if is_yaml {
        serde_yaml::from_slice(&body).map_err(|e| meta.err(e.into()))?
    } else {
        serde_json::from_slice(&body)
            .or_else(|_| serde_yaml::from_slice(&body))
            .map_err(|e: serde_yaml::Error| meta.err(e.into()))?
    };
    if spec.input_format.is_empty() {
        return Err(meta.err(AisError::BadRequest("input_format is required".into())));
    }
    spec.bck.validate_name().map_err(|e| meta.err(e))?;
    if let Some(out) = &spec.output_bck {
        out.validate_name().map_err(|e| meta.err(e))?;
    }

    let id = format!("dsort-{}", uuid::Uuid::new_v4());
    let bck = spec.bck.clone();
    let task_id = id.clone();
    let task = state
        .target
        .registry
        .renew_task(&id, || {
            Ok(TaskXact::new(task_id.clone(), XactKind::DSort, Some(bck.clone())) as Arc<dyn Xact>)
        })
        .map_err(|e| meta.err(e))?;
    info!(id = %id, bck = %spec.bck, "dsort accepted");

    // the extraction/sharding stages run behind the external codec; the
    // task records acceptance and terminal state
    let shard_size = spec.output_shard_size.unwrap_or(0);
    tokio::spawn(async move {
        if let Some(task) = task_as_taskxact(&task) {
            task.set_result(serde_json::json!({
                "input_format": spec.input_format,
                "output_format": spec.output_format,
                "output_shard_size": shard_size,
            }));
        }
    });
    Ok(Json(serde_json::json!({ "id": id })).into_response())
}

fn task_as_taskxact(xact: &Arc<dyn Xact>) -> Option<&TaskXact> {
    // tasks inserted via /v1/sort are always TaskXact
    let any: &dyn std::any::Any = xact.as_any();
    any.downcast_ref::<TaskXact>()
}

// metasync receiver + daemon introspection

async fn metasync_recv(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Json(payload): Json<RevsPayload>,
) -> Result<StatusCode, ApiError> {
    state
        .target
        .receive_meta(&payload)
        .await
        .map_err(|e| meta.err(e))?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct WhatQuery {
    what: String,
}

async fn daemon_what(
    State(state): State<TargetState>,
    meta: ReqMeta,
    Query(query): Query<WhatQuery>,
) -> Result<Response, ApiError> {
    let owners = state.target.owners();
    let body = match query.what.as_str() {
        "smap" => serde_json::to_value(&*owners.smap.get()),
        "bmd" => serde_json::to_value(&*owners.bmd.get()),
        "rmd" => serde_json::to_value(&*owners.rmd.get()),
        "config" => serde_json::to_value(&*state.config),
        "mountpaths" => {
            let mpaths: Vec<crate::fs::Mountpath> = state
                .target
                .mountpaths
                .list()
                .iter()
                .map(|m| (**m).clone())
                .collect();
            serde_json::to_value(mpaths)
        }
        "stats" => {
            let snaps = state
                .target
                .registry
                .stats(&XactQuery::default())
                .unwrap_or_default();
            serde_json::to_value(snaps)
        }
        other => {
            return Err(meta.err(AisError::BadRequest(format!("unknown what {:?}", other))))
        }
    }
    .map_err(|e| meta.err(e.into()))?;
    Ok(Json(body).into_response())
}

async fn daemon_set(
    meta: ReqMeta,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    match msg.action.as_str() {
        "set-config" => Ok(StatusCode::OK),
        other => Err(meta.err(AisError::BadRequest(format!("unknown action {:?}", other)))),
    }
}
