use std::net::{IpAddr, Ipv4Addr};

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "qcored",
    version,
    about = "Task pipeline and calibration DAG scheduler for a quantum-experiment control platform."
)]
pub struct Opt {
    #[command(subcommand)]
    pub action: Action,
}

#[derive(Debug, Subcommand)]
pub enum Action {
    /// Start the RPC server backing the task pipeline.
    Serve(ServeArgs),
    /// Submit a task description and print its tid.
    Submit(SubmitArgs),
    /// Cancel a running or pending task.
    Cancel(TidArgs),
    /// Print a task's current state and progress.
    Track(TidArgs),
    /// Print a one-line status report for a task.
    Report(TidArgs),
    /// Fetch accumulated signal data since a given point index.
    Fetch(FetchArgs),
    /// Fetch stored intermediate artifacts for one step.
    Review(ReviewArgs),
    /// Take (or fetch) a registry snapshot.
    Snapshot(SnapshotArgs),
    /// Write a value into the registry.
    Update(PathValueArgs),
    /// Read a value from the registry.
    Query(PathArgs),
    /// Create a value in the registry (alias of update).
    Create(PathValueArgs),
    /// Delete a value from the registry.
    Delete(PathArgs),
    /// Print a task's content-addressed registry checkpoint.
    Checkpoint(TidArgs),
    /// Register a user that can later `login`.
    Adduser(UserArgs),
    /// Establish a session for `(thread, user, host, port)`.
    Login(LoginArgs),
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the RPC server to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,
    /// Port to bind the RPC server to.
    #[arg(long, default_value_t = 7890)]
    pub port: u16,
}

#[derive(Debug, Args)]
pub struct ConnArgs {
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value_t = 7890)]
    pub port: u16,
}

#[derive(Debug, Args)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    /// Task name.
    pub name: String,
    /// Owning user.
    #[arg(long, default_value = "anonymous")]
    pub owner: String,
    /// Physical backend to run the task on.
    #[arg(long, default_value = "default")]
    pub backend: String,
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
    /// Path to a JSON task body (see `qcore::server` wire format).
    pub file: std::path::PathBuf,
}

#[derive(Debug, Args)]
pub struct TidArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub tid: u64,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub tid: u64,
    #[arg(long, default_value_t = 0)]
    pub start: usize,
}

#[derive(Debug, Args)]
pub struct ReviewArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub tid: u64,
    pub sid: usize,
}

#[derive(Debug, Args)]
pub struct SnapshotArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub tid: Option<u64>,
}

#[derive(Debug, Args)]
pub struct PathArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub path: String,
}

#[derive(Debug, Args)]
pub struct PathValueArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub path: String,
    /// JSON-encoded value.
    pub value: String,
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub user: String,
    pub secret: String,
}

#[derive(Debug, Args)]
pub struct LoginArgs {
    #[command(flatten)]
    pub conn: ConnArgs,
    pub user: String,
    #[arg(long, default_value_t = 1)]
    pub thread: u64,
    #[arg(long, default_value = "localhost")]
    pub login_host: String,
    #[arg(long, default_value_t = 0)]
    pub login_port: u16,
}

impl ConnArgs {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}
