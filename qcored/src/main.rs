mod cli;
mod compiler_stub;
mod rpc;

use std::sync::Arc;

use clap::Parser;
use hyper::{Body, Client, Method, Request};
use qcore::drivers::{DriverKind, DriverMultiplexer, MockDriver};
use qcore::registry::Registry;
use qcore::server::TaskServer;
use serde_json::{json, Value as Json};
use tokio::sync::Mutex as AsyncMutex;

use cli::{Action, ConnArgs, Opt};
use compiler_stub::NullCompiler;

#[tokio::main]
async fn main() {
    env_logger::init();
    let opt = Opt::parse();

    match opt.action {
        Action::Serve(args) => serve(args).await,
        Action::Submit(args) => {
            let body = std::fs::read_to_string(&args.file).unwrap_or_else(|e| {
                eprintln!("could not read task file {:?}: {e}", args.file);
                std::process::exit(1)
            });
            let mut task: Json = serde_json::from_str(&body).unwrap_or_else(|e| {
                eprintln!("task file is not valid JSON: {e}");
                std::process::exit(1)
            });
            if let Some(meta) = task.get_mut("meta").and_then(|m| m.as_object_mut()) {
                meta.insert("name".to_string(), json!(args.name));
            }
            let payload = json!({"owner": args.owner, "backend": args.backend, "priority": args.priority, "task": task});
            post(&args.conn, "/submit", payload).await;
        }
        Action::Cancel(args) => post(&args.conn, "/cancel", json!({"tid": args.tid})).await,
        Action::Track(args) => post(&args.conn, "/track", json!({"tid": args.tid})).await,
        Action::Report(args) => post(&args.conn, "/report", json!({"tid": args.tid})).await,
        Action::Fetch(args) => post(&args.conn, "/fetch", json!({"tid": args.tid, "start": args.start})).await,
        Action::Review(args) => post(&args.conn, "/review", json!({"tid": args.tid, "sid": args.sid})).await,
        Action::Snapshot(args) => post(&args.conn, "/snapshot", json!({"tid": args.tid})).await,
        Action::Update(args) => post(&args.conn, "/update", json_path_value(&args)).await,
        Action::Create(args) => post(&args.conn, "/create", json_path_value(&args)).await,
        Action::Query(args) => post(&args.conn, "/query", json!({"path": args.path})).await,
        Action::Delete(args) => post(&args.conn, "/delete", json!({"path": args.path})).await,
        Action::Checkpoint(args) => post(&args.conn, "/checkpoint", json!({"tid": args.tid})).await,
        Action::Adduser(args) => post(&args.conn, "/adduser", json!({"user": args.user, "secret": args.secret})).await,
        Action::Login(args) => {
            post(
                &args.conn,
                "/login",
                json!({"thread": args.thread, "user": args.user, "host": args.login_host, "port": args.login_port}),
            )
            .await
        }
    }
}

fn json_path_value(args: &cli::PathValueArgs) -> Json {
    let value: Json = serde_json::from_str(&args.value).unwrap_or(Json::String(args.value.clone()));
    json!({"path": args.path, "value": value})
}

/// POSTs `payload` as JSON to `{base_url}{path}` and prints the response
/// body, mirroring the CLI's role as a thin client over the RPC surface
/// (spec.md §6).
async fn post(conn: &ConnArgs, path: &str, payload: Json) {
    let client = Client::new();
    let uri: hyper::Uri = format!("{}{path}", conn.base_url()).parse().expect("invalid URL");
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .expect("failed to build request");

    match client.request(req).await {
        Ok(resp) => {
            let status = resp.status();
            let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap_or_default();
            let text = String::from_utf8_lossy(&bytes);
            if status.is_success() {
                println!("{text}");
            } else {
                eprintln!("qcored returned {status}: {text}");
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("could not reach qcored at {}: {e}", conn.base_url());
            std::process::exit(1);
        }
    }
}

/// Starts the RPC server over an in-memory Registry and a small set of
/// logging stand-in drivers. Real instrument drivers and the real circuit
/// compiler are external collaborators (spec.md §1 Non-goals) consumed only
/// through their trait boundaries; `qcored serve` wires in the same
/// in-memory stand-ins the test suite uses so the binary is runnable
/// end-to-end without a physical rig.
async fn serve(args: cli::ServeArgs) {
    let registry = Arc::new(Registry::new());
    let compiler = Arc::new(NullCompiler);
    let mut muxer = DriverMultiplexer::new();
    muxer.register("AWG", DriverKind::Local, Arc::new(AsyncMutex::new(MockDriver::new(Some(1e9)))));
    muxer.register("ADC", DriverKind::Local, Arc::new(AsyncMutex::new(MockDriver::new(Some(1e9)))));
    let muxer = Arc::new(muxer);

    let server = Arc::new(TaskServer::new(registry, compiler, muxer));
    let addr = std::net::SocketAddr::new(args.host, args.port);
    if let Err(e) = rpc::serve(addr, server).await {
        eprintln!("qcored server error: {e}");
        std::process::exit(1);
    }
}
