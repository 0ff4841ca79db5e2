// This file is part of vodwatch, a stream-recording batch transcode
// and archival daemon.
// Copyright (C) 2026 The Vodwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The HTTP control plane (spec §6/§7): a small hand-rolled JSON service
//! exposing read-only pipeline state and a handful of admin write
//! operations. No web framework, following `web.rs`'s dispatch-by-matching
//! style but on hyper 1.x (`http1` + `hyper-util`'s graceful shutdown).

use crate::config::AppConfig;
use crate::scheduler::Scheduler;
use base::clock::Clocks;
use base::shutdown::Receiver as ShutdownReceiver;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use hyper_util::server::graceful::GracefulShutdown;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

type BoxBody = http_body_util::combinators::BoxBody<Bytes, Infallible>;

fn full(bytes: Vec<u8>) -> BoxBody {
    Full::new(Bytes::from(bytes)).boxed()
}

fn json_response(status: StatusCode, body: &Value) -> Response<BoxBody> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full(bytes))
        .expect("static response is well-formed")
}

fn ok_response(message: impl Into<String>) -> Response<BoxBody> {
    json_response(StatusCode::OK, &json!({"ok": true, "message": message.into()}))
}

fn err_response(status: StatusCode, message: impl Into<String>) -> Response<BoxBody> {
    json_response(status, &json!({"ok": false, "message": message.into()}))
}

/// Binds `addr` and serves the control plane until `shutdown` fires,
/// draining in-flight requests before returning (spec §5's "no request is
/// torn down mid-response" clause).
pub async fn serve<C: Clocks + Clone + Send + Sync + 'static>(
    addr: SocketAddr,
    scheduler: Arc<Scheduler<C>>,
    store: Arc<db::Store<C>>,
    shutdown: ShutdownReceiver,
) -> Result<(), base::Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| base::format_err_t!(Unavailable, format!("binding {}: {}", addr, e)))?;
    info!(%addr, "control plane listening");
    let graceful = GracefulShutdown::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let scheduler = scheduler.clone();
                let store = store.clone();
                let service = hyper::service::service_fn(move |req| {
                    handle(req, scheduler.clone(), store.clone())
                });
                let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        warn!(error = %e, %peer, "connection error");
                    }
                });
            }
            _ = shutdown.as_future() => {
                break;
            }
        }
    }

    info!("control plane draining in-flight requests");
    graceful.shutdown().await;
    Ok(())
}

async fn handle<C: Clocks + Clone>(
    req: Request<Incoming>,
    scheduler: Arc<Scheduler<C>>,
    store: Arc<db::Store<C>>,
) -> Result<Response<BoxBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_owned();
    let query = req.uri().query().unwrap_or("").to_owned();

    let response = if method == Method::GET && path == "/api/status" {
        status(&scheduler)
    } else if method == Method::GET && path == "/api/files" {
        list_files(&store, &query)
    } else if method == Method::GET && path == "/api/files/completed" {
        list_completed(&store)
    } else if method == Method::GET && path.starts_with("/api/batches/") {
        get_batch(&store, &path["/api/batches/".len()..])
    } else if method == Method::GET && path == "/api/disk-usage" {
        disk_usage(&store, &scheduler)
    } else if method == Method::PUT && path == "/api/config" {
        let body = req.into_body().collect().await.map(|c| c.to_bytes()).unwrap_or_default();
        update_config(&scheduler, &body)
    } else if method == Method::POST && path == "/api/trigger" {
        trigger(&scheduler)
    } else if method == Method::DELETE && path.starts_with("/api/files/") {
        delete_file(&store, &path["/api/files/".len()..])
    } else {
        err_response(StatusCode::NOT_FOUND, "no such route")
    };
    Ok(response)
}

/// `GET /api/status`: scheduler running state, current file/phase.
fn status<C: Clocks + Clone>(scheduler: &Scheduler<C>) -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "running": scheduler.is_running(),
            "current_file": scheduler.current_file(),
            "current_phase": scheduler.current_phase(),
        }),
    )
}

fn pending_file_json(f: &db::PendingFile) -> Value {
    json!({
        "id": f.id,
        "dir_path": f.dir_path,
        "filename": f.filename,
        "fingerprint": f.fingerprint,
        "stable_count": f.stable_count,
        "status": f.status.as_str(),
        "start_time": f.start_time,
        "end_time": f.end_time,
        "updated_at": f.updated_at,
    })
}

/// `GET /api/files?status=stable`: the status filter is optional; an
/// unrecognized or missing value lists every row.
fn list_files<C: Clocks + Clone>(store: &db::Store<C>, query: &str) -> Response<BoxBody> {
    let status = query_param(query, "status").and_then(|s| s.parse::<db::PendingFileStatus>().ok());
    match store.list_pending_files(status) {
        Ok(files) => {
            let files: Vec<Value> = files.iter().map(pending_file_json).collect();
            json_response(StatusCode::OK, &json!({"files": files}))
        }
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.chain().to_string()),
    }
}

/// `GET /api/files/completed`: convenience alias for the completed filter.
fn list_completed<C: Clocks + Clone>(store: &db::Store<C>) -> Response<BoxBody> {
    match store.list_pending_files(Some(db::PendingFileStatus::Completed)) {
        Ok(files) => {
            let files: Vec<Value> = files.iter().map(pending_file_json).collect();
            json_response(StatusCode::OK, &json!({"files": files}))
        }
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.chain().to_string()),
    }
}

/// `GET /api/batches/:id`: batch header plus its constituent files.
fn get_batch<C: Clocks + Clone>(store: &db::Store<C>, id_str: &str) -> Response<BoxBody> {
    let id: i64 = match id_str.parse() {
        Ok(id) => id,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "batch id must be an integer"),
    };
    let batch = match store.get_batch(id) {
        Ok(Some(b)) => b,
        Ok(None) => return err_response(StatusCode::NOT_FOUND, format!("no batch {}", id)),
        Err(e) => return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.chain().to_string()),
    };
    let files = match store.list_batch_files(id) {
        Ok(f) => f,
        Err(e) => return err_response(StatusCode::INTERNAL_SERVER_ERROR, e.chain().to_string()),
    };
    let files: Vec<Value> = files
        .iter()
        .map(|f| {
            json!({
                "id": f.id,
                "dir_path": f.dir_path,
                "filename": f.filename,
                "status": f.status.as_str(),
                "encoded_path": f.encoded_path,
                "retry_count": f.retry_count,
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        &json!({
            "id": batch.id,
            "streamer": batch.streamer,
            "status": batch.status.as_str(),
            "output_dir": batch.output_dir,
            "final_mp4_path": batch.final_mp4_path,
            "final_mp3_path": batch.final_mp3_path,
            "total_files": batch.total_files,
            "encoded_count": batch.encoded_count,
            "failed_count": batch.failed_count,
            "updated_at": batch.updated_at,
            "files": files,
        }),
    )
}

/// `GET /api/disk-usage`: total bytes under every configured `output_root`.
fn disk_usage<C: Clocks + Clone>(store: &db::Store<C>, scheduler: &Scheduler<C>) -> Response<BoxBody> {
    let cfg = scheduler.config();
    match store.on_disk_size(&cfg.output.output_root) {
        Ok(bytes) => json_response(StatusCode::OK, &json!({"output_root": cfg.output.output_root, "bytes": bytes})),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.chain().to_string()),
    }
}

/// `PUT /api/config`: atomic replace, picked up by the scheduler's next tick.
fn update_config<C: Clocks + Clone>(scheduler: &Scheduler<C>, body: &[u8]) -> Response<BoxBody> {
    let cfg: AppConfig = match serde_json::from_slice(body) {
        Ok(cfg) => cfg,
        Err(e) => return err_response(StatusCode::BAD_REQUEST, format!("invalid config: {}", e)),
    };
    scheduler.set_config(cfg);
    ok_response("config updated")
}

/// `POST /api/trigger`: wakes the tick loop immediately.
fn trigger<C: Clocks + Clone>(scheduler: &Scheduler<C>) -> Response<BoxBody> {
    scheduler.trigger();
    ok_response("cycle triggered")
}

/// `DELETE /api/files/:id`: removes a `pending_files` history row outright.
/// Does not touch on-disk state; spec §7 scopes this to the database record.
fn delete_file<C: Clocks + Clone>(store: &db::Store<C>, id_str: &str) -> Response<BoxBody> {
    let id: i64 = match id_str.parse() {
        Ok(id) => id,
        Err(_) => return err_response(StatusCode::BAD_REQUEST, "file id must be an integer"),
    };
    match store.delete_pending_file(id) {
        Ok(()) => ok_response(format!("deleted file {}", id)),
        Err(e) if e.kind() == base::ErrorKind::NotFound => err_response(StatusCode::NOT_FOUND, e.chain().to_string()),
        Err(e) => err_response(StatusCode::INTERNAL_SERVER_ERROR, e.chain().to_string()),
    }
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        (k == key).then_some(v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_requested_key() {
        assert_eq!(query_param("status=stable&foo=bar", "status"), Some("stable"));
        assert_eq!(query_param("foo=bar", "status"), None);
        assert_eq!(query_param("", "status"), None);
    }
}
