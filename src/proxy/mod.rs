//! The proxy: stateless request router plus, on the primary, the
//! coordinator of transactional bucket operations.
//!
//! Object I/O never flows through the proxy: clients are redirected
//! (HTTP 307) to the HRW-owning target. Bucket mutations dispatch into
//! [`BucketOps`]; listings, xaction queries and download jobs fan out to
//! the targets and merge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::warn;

use crate::api::{ApiError, ListQueryParams, ReqMeta, XactQueryParams};
use crate::cluster::{MetaOwners, Snode};
use crate::config::AisConfig;
use crate::downloader::{DlBody, DlStatusResp, DlTaskStatus};
use crate::error::AisError;
use crate::hrw;
use crate::metasync::{MetaReceiver, Metasyncer, Revs, RevsPayload};
use crate::txn::proxy::{BucketOps, TxnBroadcaster, TxnReq};
use crate::types::{
    ActionMsg, Bck, BucketEntry, BucketList, NodeId, PropsPatch, Provider, XactionMsg,
    ACT_COPY_BCK, ACT_CREATE_BCK, ACT_DESTROY_BCK, ACT_EC_ENCODE, ACT_EVICT_CB, ACT_LIST,
    ACT_MAKE_N_COPIES, ACT_PREFETCH, ACT_RENAME_LB, ACT_RESET_PROPS, ACT_SET_PROPS, ACT_SUMMARY,
};
use crate::xact::XactSnap;

/// reqwest-backed implementation of the transaction broadcast seam.
pub struct HttpTxnBroadcaster {
    client: reqwest::Client,
}

impl HttpTxnBroadcaster {
    pub fn new() -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AisError::Internal(format!("http client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl TxnBroadcaster for HttpTxnBroadcaster {
    async fn bcast_txn(
        &self,
        targets: &[Snode],
        req: &TxnReq,
        timeout: Duration,
    ) -> Vec<(NodeId, crate::error::Result<()>)> {
        let mut tasks = Vec::with_capacity(targets.len());
        for target in targets {
            let url = format!(
                "{}/v1/txn/{}/{}",
                target.intra_control_url, req.bck.name, req.phase
            );
            let mut request = self
                .client
                .post(&url)
                .timeout(timeout)
                .query(&[
                    ("uuid", req.uuid.clone()),
                    (
                        "txn_timeout",
                        req.txn_timeout.as_millis().to_string(),
                    ),
                ])
                .json(&req.msg);
            if let Some(event) = &req.event {
                request = request.query(&[("txn_event", event.clone())]);
            }
            let id = target.id.clone();
            tasks.push(tokio::spawn(async move {
                let res = async {
                    let resp = request.send().await?;
                    if resp.status().is_success() {
                        Ok(())
                    } else {
                        let body = resp.text().await.unwrap_or_default();
                        Err(AisError::TxnAborted {
                            uuid: String::new(),
                            reason: body,
                        })
                    }
                }
                .await;
                (id, res)
            }));
        }
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(pair) => results.push(pair),
                Err(e) => results.push((String::new(), Err(AisError::Internal(e.to_string())))),
            }
        }
        results
    }

    async fn xact_running(&self, targets: &[Snode], msg: &XactionMsg, timeout: Duration) -> bool {
        for target in targets {
            let mut query: Vec<(&str, String)> = vec![("what", "running".to_string())];
            if !msg.kind.is_empty() {
                query.push(("kind", msg.kind.clone()));
            }
            if let Some(bck) = &msg.bck {
                query.push(("bucket", bck.name.clone()));
                query.push(("provider", bck.provider.to_string()));
            }
            let url = format!("{}/v1/xactions", target.intra_control_url);
            let resp = self
                .client
                .get(&url)
                .timeout(timeout)
                .query(&query)
                .send()
                .await;
            let Ok(resp) = resp else { continue };
            let Ok(body) = resp.json::<serde_json::Value>().await else {
                continue;
            };
            if body["running"].as_bool().unwrap_or(false) {
                return true;
            }
        }
        false
    }
}

/// Fetch an object from a peer target over its data endpoint.
pub struct HttpNeighborClient {
    client: reqwest::Client,
}

impl HttpNeighborClient {
    pub fn new() -> crate::error::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .build()
                .map_err(|e| AisError::Internal(format!("http client: {}", e)))?,
        })
    }
}

#[async_trait]
impl crate::target::NeighborClient for HttpNeighborClient {
    async fn fetch(&self, node: &Snode, bck: &Bck, name: &str) -> crate::error::Result<bytes::Bytes> {
        let url = format!("{}/v1/objects/{}/{}", node.intra_data_url, bck.name, name);
        let resp = self
            .client
            .get(&url)
            .query(&[("provider", bck.provider.to_string())])
            .send()
            .await?
            .error_for_status()
            .map_err(AisError::from)?;
        Ok(resp.bytes().await?)
    }
}

/// Shared state of the proxy server.
#[derive(Clone)]
pub struct ProxyState {
    pub node: Snode,
    pub owners: MetaOwners,
    pub ops: Arc<BucketOps>,
    pub metasyncer: Arc<Metasyncer>,
    pub receiver: Arc<MetaReceiver>,
    pub config: Arc<AisConfig>,
    pub client: reqwest::Client,
}

pub fn proxy_router(state: ProxyState) -> Router {
    Router::new()
        .route(
            "/v1/objects/:bucket/*object",
            get(redirect_object)
                .head(redirect_object)
                .put(redirect_object)
                .delete(redirect_object),
        )
        .route(
            "/v1/buckets/:bucket",
            get(list_bucket).post(bucket_action).delete(bucket_action),
        )
        .route("/v1/xactions", get(xact_query).put(xact_control))
        .route(
            "/v1/download",
            post(download_submit)
                .get(download_status)
                .delete(download_abort),
        )
        .route("/v1/sort", post(dsort_relay))
        .route("/v1/metasync", post(metasync_recv))
        .route("/v1/daemon", get(daemon_what).put(daemon_set))
        .route("/v1/health", get(|| async { StatusCode::OK }))
        .with_state(state)
}

fn bck_of(params: &ListQueryParams, bucket: &str) -> Bck {
    let provider: Provider = params
        .provider
        .as_deref()
        .unwrap_or("ais")
        .parse()
        .unwrap_or(Provider::Ais);
    Bck::new(provider, bucket)
}

/// 307-redirect object I/O to the HRW owner.
async fn redirect_object(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Path((bucket, object)): Path<(String, String)>,
    Query(params): Query<ListQueryParams>,
) -> Result<Response, ApiError> {
    let bck = bck_of(&params, &bucket);
    let smap = state.owners.smap.get();
    let target = hrw::hrw_target(&smap, &bck, &object).map_err(|e| meta.err(e))?;
    let location = format!(
        "{}/v1/objects/{}/{}?provider={}",
        target.intra_data_url, bucket, object, bck.provider
    );
    let location =
        HeaderValue::from_str(&location).map_err(|_| meta.err(AisError::BadRequest(
            "object name is not encodable into a redirect location".into(),
        )))?;
    Ok((
        [(header::LOCATION, location)],
        StatusCode::TEMPORARY_REDIRECT,
    )
        .into_response())
}

/// Merge per-target listings into one page.
async fn merged_list(
    state: &ProxyState,
    bck: &Bck,
    params: &ListQueryParams,
) -> crate::error::Result<BucketList> {
    let smap = state.owners.smap.get();
    if smap.count_targets() == 0 {
        return Err(AisError::NoTargets);
    }
    let msg = params.to_select_msg();
    let page_size = msg.effective_page_size();

    let mut entries: Vec<BucketEntry> = Vec::new();
    let mut any_more = false;
    for target in smap.targets.values() {
        let url = format!("{}/v1/buckets/{}", target.intra_control_url, bck.name);
        let resp = state
            .client
            .get(&url)
            .query(&[
                ("provider", bck.provider.to_string()),
                ("prefix", msg.prefix.clone()),
                ("page_marker", msg.page_marker.clone()),
                ("page_size", page_size.to_string()),
                ("cached", msg.cached.to_string()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            if status == 404 {
                return Err(AisError::BucketDoesNotExist(bck.clone()));
            }
            return Err(AisError::Network(format!(
                "listing on {} failed with {}",
                target, status
            )));
        }
        let list: BucketList = resp.json().await?;
        any_more = any_more || !list.page_marker.is_empty();
        entries.extend(list.entries);
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.dedup_by(|a, b| a.name == b.name);
    let mut page_marker = String::new();
    if entries.len() > page_size || any_more {
        entries.truncate(page_size);
        page_marker = entries.last().map(|e| e.name.clone()).unwrap_or_default();
    }
    Ok(BucketList {
        entries,
        page_marker,
    })
}

async fn list_bucket(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Path(bucket): Path<String>,
    Query(params): Query<ListQueryParams>,
) -> Result<Response, ApiError> {
    let bck = bck_of(&params, &bucket);
    // ais buckets must exist and be readable; remote buckets resolve on
    // the targets against their backends
    if bck.is_ais() && !state.owners.bmd.get().is_readable(&bck) {
        return Err(meta.err(AisError::BucketDoesNotExist(bck)));
    }
    let listing = merged_list(&state, &bck, &params)
        .await
        .map_err(|e| meta.err(e))?;
    Ok(Json(listing).into_response())
}

#[derive(Debug, Deserialize)]
struct RenameValue {
    name: String,
}

/// `POST/DELETE /v1/buckets/<bucket>` with `{action, value}`.
async fn bucket_action(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Path(bucket): Path<String>,
    Query(params): Query<ListQueryParams>,
    Json(msg): Json<ActionMsg>,
) -> Result<Response, ApiError> {
    let bck = bck_of(&params, &bucket);
    let ops = &state.ops;
    match msg.action.as_str() {
        ACT_CREATE_BCK => {
            if !bck.is_ais() {
                return Err(meta.err(AisError::BadRequest(
                    "only ais buckets can be created".into(),
                )));
            }
            ops.create_bucket(&msg, &bck, None)
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_DESTROY_BCK | ACT_EVICT_CB => {
            ops.destroy_bucket(&msg, &bck).await.map_err(|e| meta.err(e))?;
        }
        ACT_RENAME_LB => {
            if !bck.is_ais() {
                return Err(meta.err(AisError::BadRequest(
                    "only ais buckets can be renamed".into(),
                )));
            }
            let value: RenameValue = msg.parse_value().map_err(|e| meta.err(e))?;
            let to = Bck::ais(value.name);
            ops.rename_bucket(&msg, &bck, &to)
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_COPY_BCK => {
            let value: RenameValue = msg.parse_value().map_err(|e| meta.err(e))?;
            let to = Bck::ais(value.name);
            ops.copy_bucket(&msg, &bck, &to)
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_SET_PROPS => {
            let patch: PropsPatch = msg.parse_value().map_err(|e| meta.err(e))?;
            ops.set_bucket_props(&msg, &bck, Some(&patch))
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_RESET_PROPS => {
            ops.set_bucket_props(&msg, &bck, None)
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_MAKE_N_COPIES => {
            let copies: i64 = msg.parse_value().map_err(|e| meta.err(e))?;
            ops.make_n_copies(&msg, &bck, copies)
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_EC_ENCODE => {
            ops.ec_encode(&msg, &bck).await.map_err(|e| meta.err(e))?;
        }
        ACT_PREFETCH => {
            broadcast_xact_start(&state, "prefetch", Some(&bck))
                .await
                .map_err(|e| meta.err(e))?;
        }
        ACT_LIST | ACT_SUMMARY => {
            let listing = merged_list(&state, &bck, &params)
                .await
                .map_err(|e| meta.err(e))?;
            return Ok(Json(listing).into_response());
        }
        other => {
            return Err(meta.err(AisError::BadRequest(format!(
                "unknown bucket action {:?}",
                other
            ))))
        }
    }
    Ok(StatusCode::OK.into_response())
}

async fn broadcast_xact_start(
    state: &ProxyState,
    kind: &str,
    bck: Option<&Bck>,
) -> crate::error::Result<()> {
    let smap = state.owners.smap.get();
    let msg = ActionMsg::with_value(
        crate::types::ACT_XACT_START,
        &XactionMsg {
            kind: kind.to_string(),
            bck: bck.cloned(),
            ..Default::default()
        },
    )?;
    for target in smap.targets.values() {
        let url = format!("{}/v1/xactions", target.intra_control_url);
        let resp = state.client.put(&url).json(&msg).send().await?;
        if !resp.status().is_success() {
            warn!(target = %target, status = %resp.status(), "xaction start failed");
        }
    }
    Ok(())
}

/// Fan out an xaction query and merge the per-target snapshots.
async fn xact_query(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Query(params): Query<XactQueryParams>,
) -> Result<Response, ApiError> {
    let smap = state.owners.smap.get();
    let mut merged: Vec<XactSnap> = Vec::new();
    let mut last_err: Option<AisError> = None;
    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(what) = &params.what {
        query.push(("what", what.clone()));
    }
    if let Some(id) = &params.id {
        query.push(("id", id.clone()));
    }
    if let Some(kind) = &params.kind {
        query.push(("kind", kind.clone()));
    }
    if let Some(bucket) = &params.bucket {
        query.push(("bucket", bucket.clone()));
    }
    if let Some(provider) = &params.provider {
        query.push(("provider", provider.clone()));
    }
    if let Some(latest) = params.latest {
        query.push(("latest", latest.to_string()));
    }
    if let Some(running) = params.running {
        query.push(("running", running.to_string()));
    }

    for target in smap.targets.values() {
        let url = format!("{}/v1/xactions", target.intra_control_url);
        let resp = state.client.get(&url).query(&query).send().await;
        let Ok(resp) = resp else { continue };
        let status = resp.status().as_u16();
        if status == 404 || status == 410 {
            let envelope: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = envelope["message"].as_str().unwrap_or("").to_string();
            last_err = Some(if status == 410 {
                AisError::XactionExpired(message)
            } else {
                AisError::XactionNotFound(message)
            });
            continue;
        }
        if let Ok(snaps) = resp.json::<Vec<XactSnap>>().await {
            merged.extend(snaps);
        }
    }
    if merged.is_empty() {
        if let Some(err) = last_err {
            return Err(meta.err(err));
        }
    }
    Ok(Json(merged).into_response())
}

async fn xact_control(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    let smap = state.owners.smap.get();
    for target in smap.targets.values() {
        let url = format!("{}/v1/xactions", target.intra_control_url);
        let resp = state
            .client
            .put(&url)
            .json(&msg)
            .send()
            .await
            .map_err(|e| meta.err(e.into()))?;
        if !resp.status().is_success() {
            let envelope: serde_json::Value = resp.json().await.unwrap_or_default();
            return Err(meta.err(AisError::BadRequest(
                envelope["message"].as_str().unwrap_or("").to_string(),
            )));
        }
    }
    Ok(StatusCode::OK)
}

// downloader fan-out

async fn download_submit(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Json(mut body): Json<DlBody>,
) -> Result<Response, ApiError> {
    let smap = state.owners.smap.get();
    if smap.count_targets() == 0 {
        return Err(meta.err(AisError::NoTargets));
    }
    let job_id = uuid::Uuid::new_v4().to_string();
    body.job_id = Some(job_id.clone());

    for target in smap.targets.values() {
        let url = format!("{}/v1/download", target.intra_control_url);
        let resp = state
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| meta.err(e.into()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let envelope: serde_json::Value = resp.json().await.unwrap_or_default();
            let message = envelope["message"].as_str().unwrap_or("").to_string();
            let err = if status == 503 {
                AisError::DownloadQueueFull(message)
            } else {
                AisError::BadRequest(message)
            };
            return Err(meta.err(err));
        }
    }
    Ok(Json(serde_json::json!({ "id": job_id })).into_response())
}

#[derive(Deserialize)]
struct DlQuery {
    id: String,
}

async fn download_status(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Query(query): Query<DlQuery>,
) -> Result<Response, ApiError> {
    let smap = state.owners.smap.get();
    let mut merged: Option<DlStatusResp> = None;
    for target in smap.targets.values() {
        let url = format!("{}/v1/download", target.intra_control_url);
        let resp = state
            .client
            .get(&url)
            .query(&[("id", query.id.clone())])
            .send()
            .await;
        let Ok(resp) = resp else { continue };
        if !resp.status().is_success() {
            continue;
        }
        let Ok(status) = resp.json::<DlStatusResp>().await else {
            continue;
        };
        merged = Some(match merged {
            None => status,
            Some(mut acc) => {
                acc.total += status.total;
                acc.finished += status.finished;
                acc.pending += status.pending;
                acc.errors.extend(status.errors);
                acc.status = merge_status(acc.status, status.status);
                acc
            }
        });
    }
    let merged =
        merged.ok_or_else(|| meta.err(AisError::DownloadJobNotFound(query.id.clone())))?;
    Ok(Json(merged).into_response())
}

fn merge_status(a: DlTaskStatus, b: DlTaskStatus) -> DlTaskStatus {
    use DlTaskStatus::*;
    match (a, b) {
        (Aborted, _) | (_, Aborted) => Aborted,
        (Running, _) | (_, Running) => Running,
        (Failed, _) | (_, Failed) => Failed,
        _ => Done,
    }
}

async fn download_abort(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Query(query): Query<DlQuery>,
) -> Result<StatusCode, ApiError> {
    let smap = state.owners.smap.get();
    let mut any = false;
    for target in smap.targets.values() {
        let url = format!("{}/v1/download", target.intra_control_url);
        let resp = state
            .client
            .delete(&url)
            .query(&[("id", query.id.clone())])
            .send()
            .await;
        if let Ok(resp) = resp {
            any = any || resp.status().is_success();
        }
    }
    if !any {
        return Err(meta.err(AisError::DownloadJobNotFound(query.id)));
    }
    Ok(StatusCode::OK)
}

/// dSort runs on the targets; the proxy relays the spec verbatim.
async fn dsort_relay(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    headers: axum::http::HeaderMap,
    body: bytes::Bytes,
) -> Result<Response, ApiError> {
    let smap = state.owners.smap.get();
    let Some(target) = smap.targets.values().next() else {
        return Err(meta.err(AisError::NoTargets));
    };
    let url = format!("{}/v1/sort", target.intra_control_url);
    let mut request = state.client.post(&url).body(body.to_vec());
    if let Some(ct) = headers.get(header::CONTENT_TYPE) {
        if let Ok(ct) = ct.to_str() {
            request = request.header(header::CONTENT_TYPE, ct);
        }
    }
    let resp = request.send().await.map_err(|e| meta.err(e.into()))?;
    let status =
        StatusCode::from_u16(resp.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = resp.bytes().await.map_err(|e| meta.err(e.into()))?;
    Ok((status, bytes).into_response())
}

async fn metasync_recv(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Json(payload): Json<RevsPayload>,
) -> Result<StatusCode, ApiError> {
    state.receiver.apply(&payload).map_err(|e| meta.err(e))?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct WhatQuery {
    what: String,
}

#[derive(Debug, Deserialize)]
struct NodeStateValue {
    id: String,
    state: String,
}

async fn daemon_set(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Json(msg): Json<ActionMsg>,
) -> Result<StatusCode, ApiError> {
    match msg.action.as_str() {
        "set-config" => Ok(StatusCode::OK),
        // take a node in/out of maintenance or decommission it; the
        // updated Smap fans out so every peer stops placing onto it
        "set-node-state" => {
            let smap = state.owners.smap.get();
            if !smap.is_primary(&state.node.id) {
                let primary_url = smap
                    .primary()
                    .map(|p| p.public_url.clone())
                    .unwrap_or_default();
                return Err(meta.err(AisError::NotPrimary { primary_url }));
            }
            let value: NodeStateValue = msg.parse_value().map_err(|e| meta.err(e))?;
            let node_state: crate::cluster::SnodeState =
                value.state.parse().map_err(|e| meta.err(e))?;

            let guard = state.owners.smap.lock().await;
            let mut clone = (*guard.get()).clone();
            clone
                .set_node_state(&value.id, node_state)
                .map_err(|e| meta.err(e))?;
            let smap = guard.put(clone).map_err(|e| meta.err(e))?;

            let revs = Revs::of(&*smap).map_err(|e| meta.err(e))?;
            let handle = state.metasyncer.sync(
                Arc::clone(&smap),
                RevsPayload {
                    pairs: vec![revs],
                    msg,
                },
            );
            drop(guard);
            handle.wait().await;
            Ok(StatusCode::OK)
        }
        other => Err(meta.err(AisError::BadRequest(format!("unknown action {:?}", other)))),
    }
}

async fn daemon_what(
    State(state): State<ProxyState>,
    meta: ReqMeta,
    Query(query): Query<WhatQuery>,
) -> Result<Response, ApiError> {
    let body = match query.what.as_str() {
        "smap" => serde_json::to_value(&*state.owners.smap.get()),
        "bmd" => serde_json::to_value(&*state.owners.bmd.get()),
        "rmd" => serde_json::to_value(&*state.owners.rmd.get()),
        "config" => serde_json::to_value(&*state.config),
        other => {
            return Err(meta.err(AisError::BadRequest(format!("unknown what {:?}", other))))
        }
    }
    .map_err(|e| meta.err(e.into()))?;
    Ok(Json(body).into_response())
}
