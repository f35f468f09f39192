//! HTTP control surface for a mounted filesystem.
//!
//! Enabled by `--listen`. Four endpoints, all JSON:
//!
//! * `GET /status` — mount parameters and the current base key.
//! * `GET /flush` — commit the root, then report status; `oldKey` is set
//!   when the key moved.
//! * `POST /root/<spec>` — resolve a new root spec and swap it in as the
//!   mounted tree, invalidating the kernel's view of the root.
//! * `POST /snapshot/<name>?replace=bool` — flush, then save the resulting
//!   key as a new named root pointer.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use log::debug;
use log::info;
use log::warn;
use parking_lot::Mutex;
use serde::Serialize;
use tiny_http::Header;
use tiny_http::Method;
use tiny_http::Request;
use tiny_http::Response;
use tiny_http::Server;

use crate::config::KeyFormat;
use crate::fs::FsCore;
use crate::path::PathInfo;
use crate::path::RootRecord;
use crate::service;
use crate::store::Store;

/// Shared state behind the control endpoints.
pub struct Control {
    pub core: Arc<FsCore>,
    pub path: Arc<Mutex<PathInfo>>,
    pub store: Store,
    pub mount_path: String,
    pub store_spec: String,
    pub read_only: bool,
    pub auto_flush: Option<Duration>,
    pub key_format: KeyFormat,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    mount_path: String,
    root: String,
    store: String,
    read_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    auto_flush: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_key: Option<String>,
    storage_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RootBody {
    root: String,
    storage_key: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Starts serving on `listen`; requests are handled on one thread.
pub fn serve(state: Arc<Control>, listen: &str) -> anyhow::Result<()> {
    let server = Server::http(listen).map_err(|err| anyhow!("listen on {listen:?}: {err}"))?;
    info!("Control server listening on {listen}");
    thread::Builder::new()
        .name("ffs-control".to_string())
        .spawn(move || {
            for request in server.incoming_requests() {
                handle(&state, request);
            }
        })?;
    Ok(())
}

fn handle(state: &Control, request: Request) {
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (url.as_str(), ""),
    };
    debug!("control request: {} {path}", request.method());

    let response = match (request.method(), path) {
        (&Method::Get, "/status") => status(state, None),
        (&Method::Get, "/flush") => flush(state),
        (&Method::Post, _) if path.starts_with("/root/") => {
            swap_root(state, &path["/root/".len()..])
        }
        (&Method::Post, _) if path.starts_with("/snapshot/") => {
            snapshot(state, &path["/snapshot/".len()..], query)
        }
        _ => error_response(404, "no such endpoint"),
    };
    if let Err(err) = request.respond(response) {
        warn!("control reply failed: {err}");
    }
}

type JsonResponse = Response<std::io::Cursor<Vec<u8>>>;

fn json_response(code: u16, body: &impl Serialize) -> JsonResponse {
    let data = serde_json::to_vec(body).unwrap_or_default();
    Response::from_data(data)
        .with_status_code(code)
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap())
}

fn error_response(code: u16, message: impl ToString) -> JsonResponse {
    json_response(
        code,
        &ErrorBody {
            error: message.to_string(),
        },
    )
}

fn status(state: &Control, old_key: Option<String>) -> JsonResponse {
    let path = state.path.lock();
    json_response(
        200,
        &StatusBody {
            mount_path: state.mount_path.clone(),
            root: path.describe_root(),
            store: state.store_spec.clone(),
            read_only: state.read_only,
            auto_flush: state.auto_flush.map(|d| format!("{d:?}")),
            old_key,
            storage_key: state.key_format.format(&path.base_key),
        },
    )
}

fn flush(state: &Control) -> JsonResponse {
    let old_key = state.path.lock().base_key;
    match state
        .core
        .with_tree_locked(|| state.path.lock().flush())
    {
        Ok(new_key) => {
            let old = (new_key != old_key).then(|| state.key_format.format(&old_key));
            status(state, old)
        }
        Err(err) => error_response(500, err),
    }
}

fn swap_root(state: &Control, spec: &str) -> JsonResponse {
    match service::swap_root(&state.core, &state.path, &state.store, spec) {
        Ok((root, key)) => {
            info!("Mounted root replaced by {root:?}");
            json_response(
                200,
                &RootBody {
                    root,
                    storage_key: state.key_format.format(&key),
                },
            )
        }
        Err(err) => error_response(400, err),
    }
}

fn snapshot(state: &Control, name: &str, query: &str) -> JsonResponse {
    if name.is_empty() || name.contains('/') {
        return error_response(400, format!("invalid snapshot name {name:?}"));
    }
    let replace = query
        .split('&')
        .any(|pair| pair == "replace=true" || pair == "replace=1");

    let key = match state
        .core
        .with_tree_locked(|| state.path.lock().flush())
    {
        Ok(key) => key,
        Err(err) => return error_response(500, err),
    };
    let start = state.path.lock().describe_root();
    let record = RootRecord {
        file_key: key,
        index_key: None,
        description: format!("Triggered snapshot of {start}"),
    };
    match record.save(&state.store.roots(), name, replace) {
        Ok(()) => {
            info!("Snapshot {name:?} saved at {key}");
            json_response(
                200,
                &RootBody {
                    root: name.to_string(),
                    storage_key: state.key_format.format(&key),
                },
            )
        }
        Err(err) => error_response(400, err),
    }
}
