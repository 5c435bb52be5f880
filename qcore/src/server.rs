//! Task Server (spec.md §4.7): admission queue, sessions, task bookkeeping.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::compiler::CircuitCompiler;
use crate::dataset::Dataset;
use crate::drivers::DriverMultiplexer;
use crate::error::TaskError;
use crate::registry::{Checkpoint, Registry};
use crate::task::{Progress, StepArtifacts, TaskRuntime, TaskSpec, TaskState};

/// `(thread, user, host, port)` identifies one RPC/driver connection for lazy
/// reuse (spec.md §4.7, SPEC_FULL.md §4.7 supplement).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub thread: u64,
    pub user: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub connected_at: String,
}

/// Runtime bookkeeping the Task Server holds for a submitted task, distinct
/// from the wire-facing [`TaskSpec`] (SPEC_FULL.md §3 "TaskRecord").
pub struct TaskRecord {
    pub tid: u64,
    pub owner: String,
    pub priority: i64,
    pub submit_seq: u64,
    pub backend: String,
    pub state: TaskState,
    pub index: usize,
    pub last: usize,
    pub session: Option<SessionKey>,
    pub dataset: Dataset,
    pub artifacts: BTreeMap<usize, StepArtifacts>,
    pub error: Option<String>,
    cancel: Arc<std::sync::atomic::AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

struct QueueEntry {
    priority: i64,
    submit_seq: u64,
    tid: u64,
    backend: String,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.submit_seq == other.submit_seq
    }
}
impl Eq for QueueEntry {}

/// Orders by `(priority desc, submit-time asc)` so `BinaryHeap::pop` returns
/// the highest-priority, earliest-submitted task first — the "min-heap keyed
/// by (priority, submit-time)" of spec.md §4.7, expressed as a max-heap over
/// the natural admission order.
impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority.cmp(&other.priority).then_with(|| other.submit_seq.cmp(&self.submit_seq))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Admits tasks into a priority queue, enforces one Running task per
/// physical backend, and exposes the spec.md §4.7/§6 RPC surface to
/// `qcored`. Generic over the external circuit compiler so tests can plug in
/// a stub (spec.md §4.3).
pub struct TaskServer<C: CircuitCompiler> {
    registry: Arc<Registry>,
    compiler: Arc<C>,
    muxer: Arc<DriverMultiplexer>,
    queue: Mutex<BinaryHeap<QueueEntry>>,
    running_on: Mutex<HashMap<String, u64>>,
    /// Specs of tasks that have been submitted but not yet spawned.
    runtimes: Mutex<HashMap<u64, TaskSpec>>,
    tasks: Arc<AsyncMutex<HashMap<u64, TaskRecord>>>,
    sessions: Mutex<LruMap<SessionKey, SessionHandle>>,
    users: Mutex<HashMap<String, String>>,
    next_tid: AtomicU64,
    next_seq: AtomicU64,
}

impl<C: CircuitCompiler + 'static> TaskServer<C> {
    pub fn new(registry: Arc<Registry>, compiler: Arc<C>, muxer: Arc<DriverMultiplexer>) -> Self {
        TaskServer {
            registry,
            compiler,
            muxer,
            queue: Mutex::new(BinaryHeap::new()),
            running_on: Mutex::new(HashMap::new()),
            runtimes: Mutex::new(HashMap::new()),
            tasks: Arc::new(AsyncMutex::new(HashMap::new())),
            sessions: Mutex::new(LruMap::new(ByLength::new(256))),
            users: Mutex::new(HashMap::new()),
            next_tid: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
        }
    }

    /// `submit` (spec.md §4.7): enqueues a task, returning its tid. Requires
    /// `Arc<Self>` so the completion callback spawned on the runtime can
    /// release the backend slot and admit the next queued task.
    pub async fn submit(self: &Arc<Self>, owner: impl Into<String>, backend: impl Into<String>, priority: i64, spec: TaskSpec) -> u64 {
        let tid = self.next_tid.fetch_add(1, AtomicOrdering::SeqCst);
        let submit_seq = self.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let backend = backend.into();
        let record = TaskRecord {
            tid,
            owner: owner.into(),
            priority,
            submit_seq,
            backend: backend.clone(),
            state: TaskState::Pending,
            index: 0,
            last: 0,
            session: None,
            dataset: Dataset::new(),
            artifacts: BTreeMap::new(),
            error: None,
            cancel: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            handle: None,
        };
        self.tasks.lock().await.insert(tid, record);
        self.queue.lock().push(QueueEntry { priority, submit_seq, tid, backend });
        self.runtimes.lock().insert(tid, spec);
        self.try_admit().await;
        tid
    }

    /// Pops the highest-priority pending task for any free backend and
    /// spawns its running loop.
    async fn try_admit(self: &Arc<Self>) {
        loop {
            let candidate = {
                let mut queue = self.queue.lock();
                let mut running = self.running_on.lock();
                let mut deferred = Vec::new();
                let mut found = None;
                while let Some(entry) = queue.pop() {
                    if running.contains_key(&entry.backend) {
                        deferred.push(entry);
                        continue;
                    }
                    running.insert(entry.backend.clone(), entry.tid);
                    found = Some(entry);
                    break;
                }
                for entry in deferred {
                    queue.push(entry);
                }
                found
            };
            let Some(entry) = candidate else { break };
            self.spawn_task(entry.tid, entry.backend).await;
        }
    }

    async fn spawn_task(self: &Arc<Self>, tid: u64, backend: String) {
        let spec = match self.runtimes.lock().remove(&tid) {
            Some(s) => s,
            None => return,
        };
        let mut runtime = TaskRuntime::new(tid, spec);
        let cancel_handle = runtime.cancel_handle();
        {
            let mut tasks = self.tasks.lock().await;
            if let Some(record) = tasks.get_mut(&tid) {
                record.cancel = cancel_handle;
                record.state = TaskState::Running;
            }
        }

        let server = self.clone();
        let backend_for_log = backend.clone();
        let handle = tokio::spawn(async move {
            let result = runtime
                .run(&server.registry, server.compiler.as_ref(), &server.muxer, |p: Progress| {
                    log::debug!("tid {} sid {}/{}", p.tid, p.sid, p.total);
                })
                .await;
            {
                let mut tasks = server.tasks.lock().await;
                if let Some(record) = tasks.get_mut(&tid) {
                    record.state = runtime.state;
                    record.index = runtime.index;
                    record.last = runtime.index;
                    record.dataset = runtime.dataset;
                    record.artifacts = runtime.artifacts;
                    if let Err(e) = result {
                        record.error = Some(e.to_string());
                        log::error!("task {tid} on `{backend_for_log}` failed: {e}");
                    }
                }
            }
            server.running_on.lock().remove(&backend);
            server.try_admit().await;
        });

        if let Some(record) = self.tasks.lock().await.get_mut(&tid) {
            record.handle = Some(handle);
        }
    }

    /// `cancel(tid)` (spec.md §4.7): sets the cooperative cancellation flag.
    pub async fn cancel(&self, tid: u64) -> Result<(), TaskError> {
        let tasks = self.tasks.lock().await;
        let record = tasks.get(&tid).ok_or(TaskError::Cancelled)?;
        record.cancel.store(true, AtomicOrdering::SeqCst);
        Ok(())
    }

    /// `track(tid)` (spec.md §4.7): current state and progress pointers.
    pub async fn track(&self, tid: u64) -> Option<(TaskState, usize, usize)> {
        let tasks = self.tasks.lock().await;
        tasks.get(&tid).map(|r| (r.state, r.index, r.last))
    }

    /// `report(tid)` (spec.md §4.7): a terse status line.
    pub async fn report(&self, tid: u64) -> Option<String> {
        let tasks = self.tasks.lock().await;
        tasks.get(&tid).map(|r| format!("tid={} owner={} state={:?} index={}", r.tid, r.owner, r.state, r.index))
    }

    /// `fetch(tid, start, meta?)` (spec.md §4.7): data accumulated since
    /// `start` points into each signal's flat append log.
    pub async fn fetch(&self, tid: u64, start: usize) -> Option<BTreeMap<String, Vec<f64>>> {
        let tasks = self.tasks.lock().await;
        let record = tasks.get(&tid)?;
        let mut out = BTreeMap::new();
        for (name, buf) in &record.dataset.signals {
            let (_, flat) = buf.reshape(&[buf.points_len()]);
            let from = start.min(flat.len());
            out.insert(name.clone(), flat[from..].to_vec());
        }
        Some(out)
    }

    /// `review(tid, sid)` (spec.md §4.7): stored intermediate artifacts.
    pub async fn review(&self, tid: u64, sid: usize) -> Option<StepArtifacts> {
        let tasks = self.tasks.lock().await;
        tasks.get(&tid)?.artifacts.get(&sid).cloned()
    }

    /// `snapshot(tid?)` (spec.md §4.1/§4.7).
    pub fn snapshot(&self, tid: Option<u64>) -> crate::registry::Snapshot {
        self.registry.snapshot(tid)
    }

    /// The shared Registry this server admits tasks against, for the RPC
    /// front-end's direct `query`/`update`/`create`/`delete` surface
    /// (spec.md §6).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn checkpoint(&self, tid: u64) -> Option<Checkpoint> {
        self.registry.checkpoint(tid)
    }

    /// `adduser` (spec.md §6). Credential storage is out of scope (spec.md
    /// Non-goals: authentication) — this keeps just enough state for `login`
    /// to issue a [`SessionKey`].
    pub fn adduser(&self, name: impl Into<String>, secret: impl Into<String>) {
        self.users.lock().insert(name.into(), secret.into());
    }

    /// `login` (spec.md §6): establishes or reuses a session for
    /// `(thread, user, host, port)`.
    pub fn login(&self, thread: u64, user: &str, host: &str, port: u16, connected_at: impl Into<String>) -> Option<SessionKey> {
        if !self.users.lock().contains_key(user) {
            return None;
        }
        let key = SessionKey { thread, user: user.to_string(), host: host.to_string(), port };
        self.sessions.lock().insert(key.clone(), SessionHandle { connected_at: connected_at.into() });
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CType, CompileOpts, Context, DataMap};
    use crate::drivers::{DriverKind, MockDriver};
    use crate::error::CompileError;
    use crate::task::SweepAxis;
    use crate::value::Value;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct NopCompiler;
    impl CircuitCompiler for NopCompiler {
        fn qcompile(
            &self,
            _gates: &[(String, Vec<String>)],
            _ctx: &Context,
            _opts: &CompileOpts,
        ) -> Result<(BTreeMap<String, Vec<(CType, String, Value, String)>>, DataMap), CompileError> {
            Ok((BTreeMap::new(), DataMap::default()))
        }
    }

    fn basic_spec() -> TaskSpec {
        TaskSpec {
            name: "t".into(),
            owner: "alice".into(),
            priority: 0,
            circuit: crate::compiler::Circuit::default(),
            axes: vec![SweepAxis { name: "freq".into(), entries: vec![("Q0.setting.LO".into(), vec![json!(5.0e9)], "Hz".into())] }],
            init: BTreeMap::new(),
            post: BTreeMap::new(),
            rules: vec![],
            shots: 1024,
            signal: "iq".into(),
            align_right: false,
            fillzero: true,
            timeout: None,
            step_timeout: None,
            arch: "baqis".into(),
        }
    }

    #[tokio::test]
    async fn submit_and_track_runs_to_a_terminal_state() {
        let registry = Arc::new(Registry::new());
        let mut mux = DriverMultiplexer::new();
        mux.register("AWG", DriverKind::Local, Arc::new(tokio::sync::Mutex::new(MockDriver::new(Some(1e9)))));
        let server = Arc::new(TaskServer::new(registry, Arc::new(NopCompiler), Arc::new(mux)));
        let tid = server.submit("alice", "backend-0", 5, basic_spec()).await;
        for _ in 0..50 {
            if let Some((state, _, _)) = server.track(tid).await {
                if state.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let (state, _, _) = server.track(tid).await.unwrap();
        assert!(state.is_terminal());
    }

    #[test]
    fn login_requires_a_known_user() {
        let registry = Arc::new(Registry::new());
        let mux = Arc::new(DriverMultiplexer::new());
        let server = TaskServer::new(registry, Arc::new(NopCompiler), mux);
        assert!(server.login(1, "bob", "localhost", 8000, "now").is_none());
        server.adduser("bob", "hunter2");
        assert!(server.login(1, "bob", "localhost", 8000, "now").is_some());
    }
}
