//! Thin async HTTP/JSON front-end for the Task Server (spec.md §6 "CLI/RPC
//! surface"), mirroring the teacher's `samply-server` shape: a `hyper`
//! `service_fn` that dispatches on `(Method, path)` and speaks JSON bodies,
//! not a bespoke RPC framework.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use qcore::server::TaskServer;
use serde_json::{json, Value as Json};

use crate::compiler_stub::NullCompiler;

pub type AppServer = TaskServer<NullCompiler>;

pub async fn serve(addr: SocketAddr, server: Arc<AppServer>) -> Result<(), hyper::Error> {
    let make_svc = make_service_fn(move |_conn| {
        let server = server.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, server.clone()))) }
    });
    log::info!("qcored RPC surface listening on {addr}");
    Server::bind(&addr).serve(make_svc).await
}

async fn handle(req: Request<Body>, server: Arc<AppServer>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let body = match method {
        Method::POST => match hyper::body::to_bytes(req.into_body()).await {
            Ok(bytes) => serde_json::from_slice::<Json>(&bytes).unwrap_or(Json::Null),
            Err(_) => Json::Null,
        },
        _ => Json::Null,
    };

    let result = dispatch(&path, body, &server).await;
    Ok(match result {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(RpcError::NotFound) => json_response(StatusCode::NOT_FOUND, &json!({"error": "not found"})),
        Err(RpcError::BadRequest(msg)) => json_response(StatusCode::BAD_REQUEST, &json!({"error": msg})),
    })
}

enum RpcError {
    NotFound,
    BadRequest(String),
}

fn json_response(status: StatusCode, value: &Json) -> Response<Body> {
    let mut resp = Response::new(Body::from(value.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

fn str_field<'a>(body: &'a Json, key: &str) -> Result<&'a str, RpcError> {
    body.get(key).and_then(|v| v.as_str()).ok_or_else(|| RpcError::BadRequest(format!("missing `{key}`")))
}

fn u64_field(body: &Json, key: &str) -> Result<u64, RpcError> {
    body.get(key).and_then(|v| v.as_u64()).ok_or_else(|| RpcError::BadRequest(format!("missing `{key}`")))
}

/// Dispatches the spec.md §6 RPC surface: `submit`, `cancel`, `track`,
/// `report`, `fetch`, `review`, `snapshot`, `update`, `query`, `create`,
/// `delete`, `checkpoint`, `login`, `adduser`.
async fn dispatch(path: &str, body: Json, server: &Arc<AppServer>) -> Result<Json, RpcError> {
    match path {
        "/submit" => {
            let owner = str_field(&body, "owner")?.to_string();
            let backend = str_field(&body, "backend")?.to_string();
            let priority = body.get("priority").and_then(|v| v.as_i64()).unwrap_or(0);
            let arch = body.get("arch").and_then(|v| v.as_str()).unwrap_or("baqis").to_string();
            let task = body.get("task").ok_or_else(|| RpcError::BadRequest("missing `task`".into()))?;
            let spec = qcore::wire::parse_task_spec(owner.clone(), arch, task).map_err(|e| RpcError::BadRequest(e.to_string()))?;
            let tid = server.submit(owner, backend, priority, spec).await;
            Ok(json!({"tid": tid}))
        }
        "/cancel" => {
            let tid = u64_field(&body, "tid")?;
            server.cancel(tid).await.map_err(|e| RpcError::BadRequest(e.to_string()))?;
            Ok(json!({"ok": true}))
        }
        "/track" => {
            let tid = u64_field(&body, "tid")?;
            let (state, index, last) = server.track(tid).await.ok_or(RpcError::NotFound)?;
            Ok(json!({"state": state, "index": index, "last": last}))
        }
        "/report" => {
            let tid = u64_field(&body, "tid")?;
            let report = server.report(tid).await.ok_or(RpcError::NotFound)?;
            Ok(json!({"report": report}))
        }
        "/fetch" => {
            let tid = u64_field(&body, "tid")?;
            let start = body.get("start").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let data = server.fetch(tid, start).await.ok_or(RpcError::NotFound)?;
            Ok(json!({"data": data}))
        }
        "/review" => {
            let tid = u64_field(&body, "tid")?;
            let sid = body.get("sid").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            let artifacts = server.review(tid, sid).await.ok_or(RpcError::NotFound)?;
            serde_json::to_value(artifacts).map_err(|e| RpcError::BadRequest(e.to_string()))
        }
        "/snapshot" => {
            let tid = body.get("tid").and_then(|v| v.as_u64());
            let snapshot = server.snapshot(tid);
            Ok(json!({"version": snapshot.version, "data": snapshot.as_json()}))
        }
        "/checkpoint" => {
            let tid = u64_field(&body, "tid")?;
            let checkpoint = server.checkpoint(tid).ok_or(RpcError::NotFound)?;
            Ok(json!({"content_address": checkpoint.content_address, "text": checkpoint.text}))
        }
        "/update" | "/create" => {
            let path = str_field(&body, "path")?.to_string();
            let value = body.get("value").cloned().unwrap_or(Json::Null);
            server.registry().update(&path, value).map_err(|e| RpcError::BadRequest(e.to_string()))?;
            Ok(json!({"ok": true}))
        }
        "/query" => {
            let path = str_field(&body, "path")?.to_string();
            let default = body.get("default").cloned();
            let value = server.registry().query(&path, default);
            Ok(json!({"value": value}))
        }
        "/delete" => {
            let path = str_field(&body, "path")?.to_string();
            server.registry().delete(&path);
            Ok(json!({"ok": true}))
        }
        "/adduser" => {
            let user = str_field(&body, "user")?.to_string();
            let secret = str_field(&body, "secret")?.to_string();
            server.adduser(user, secret);
            Ok(json!({"ok": true}))
        }
        "/login" => {
            let thread = u64_field(&body, "thread")?;
            let user = str_field(&body, "user")?;
            let host = str_field(&body, "host")?;
            let port = body.get("port").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
            let key = server.login(thread, user, host, port, "now").ok_or(RpcError::NotFound)?;
            Ok(json!({"thread": key.thread, "user": key.user, "host": key.host, "port": key.port}))
        }
        _ => Err(RpcError::NotFound),
    }
}
