//! In-memory container runtime for integration tests.
//!
//! Execs are answered by a handler closure. Their output is written as real multiplexed
//! frames (or raw bytes for TTY execs) over a `tokio::io::duplex` pipe, so the production
//! executor and demultiplexer run unchanged.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::Notify;
use underleaf_sandbox::demux::{encode_frame, Channel};
use underleaf_sandbox::runtime::{
    ContainerRecord, ContainerRuntime, ContainerSpec, ContainerState, ExecSpec, ExecStatus,
    ExecStream, RuntimeError, RuntimeResult,
};
use underleaf_sandbox::{ManagerConfig, SandboxManager};

const PIPE_CAPACITY: usize = 64 * 1024;

/// One exec as the fake saw it, stdin included.
#[derive(Clone, Debug)]
pub struct ExecCall {
    pub container_id: String,
    pub argv: Vec<String>,
    pub env: Vec<String>,
    pub stdin: Vec<u8>,
    pub tty: bool,
}

impl ExecCall {
    pub fn script(&self) -> &str {
        match self.argv.as_slice() {
            [shell, flag, script, ..] if shell == "sh" && flag == "-c" => script,
            _ => "",
        }
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.argv.iter().any(|a| a == arg)
    }

    pub fn arg_after(&self, flag: &str) -> Option<&str> {
        self.argv
            .iter()
            .position(|a| a == flag)
            .and_then(|at| self.argv.get(at + 1))
            .map(String::as_str)
    }
}

/// What an exec writes back.
#[derive(Default)]
pub struct ExecReply {
    pub stdout: Vec<Vec<u8>>,
    pub stderr: Vec<Vec<u8>>,
    /// Written verbatim instead of frames.
    pub raw: Option<Vec<u8>>,
    pub exit_code: i64,
    /// Output written once `release` is notified.
    pub later: Option<(Arc<Notify>, Vec<Vec<u8>>)>,
    /// Keep the stream open until the client goes away.
    pub hang: bool,
}

impl ExecReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stdout: vec![text.into().into_bytes()],
            ..Self::default()
        }
    }

    pub fn lines(lines: &[&str]) -> Self {
        Self {
            stdout: lines
                .iter()
                .map(|line| format!("{line}\n").into_bytes())
                .collect(),
            ..Self::default()
        }
    }

    pub fn failed(exit_code: i64, stderr: impl Into<String>) -> Self {
        Self {
            stderr: vec![stderr.into().into_bytes()],
            exit_code,
            ..Self::default()
        }
    }

    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }
}

pub type ExecHandler = Arc<dyn Fn(&ExecCall) -> ExecReply + Send + Sync>;

struct FakeContainer {
    name: String,
    labels: HashMap<String, String>,
    running: bool,
    created_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct State {
    volumes: HashMap<String, HashMap<String, String>>,
    containers: HashMap<String, FakeContainer>,
    pending_execs: HashMap<String, (String, ExecSpec)>,
    exit_codes: HashMap<String, i64>,
    files: HashMap<String, Vec<u8>>,
    log: Vec<ExecCall>,
}

pub struct FakeRuntime {
    state: Arc<Mutex<State>>,
    handler: Mutex<ExecHandler>,
    next_id: AtomicUsize,
    containers_created: AtomicUsize,
    volumes_created: AtomicUsize,
    fail_start: AtomicBool,
    unsettled_inspects: AtomicUsize,
    inspect_delay_ms: AtomicUsize,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            handler: Mutex::new(Arc::new(|_: &ExecCall| ExecReply::ok())),
            next_id: AtomicUsize::new(1),
            containers_created: AtomicUsize::new(0),
            volumes_created: AtomicUsize::new(0),
            fail_start: AtomicBool::new(false),
            unsettled_inspects: AtomicUsize::new(0),
            inspect_delay_ms: AtomicUsize::new(0),
        }
    }
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_handler<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&ExecCall) -> ExecReply + Send + Sync + 'static,
    {
        let fake = Self::new();
        fake.set_handler(handler);
        fake
    }

    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&ExecCall) -> ExecReply + Send + Sync + 'static,
    {
        *self.handler.lock().unwrap() = Arc::new(handler);
    }

    pub fn fail_starts(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// The next `count` exec inspections report the exec as still running.
    pub fn unsettled_exit_status(&self, count: usize) {
        self.unsettled_inspects.store(count, Ordering::SeqCst);
    }

    /// Makes every container inspection take `millis`.
    pub fn slow_inspect(&self, millis: usize) {
        self.inspect_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn containers_created(&self) -> usize {
        self.containers_created.load(Ordering::SeqCst)
    }

    pub fn volumes_created(&self) -> usize {
        self.volumes_created.load(Ordering::SeqCst)
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().volumes.contains_key(name)
    }

    pub fn add_volume(&self, name: &str) {
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(name.to_string(), HashMap::new());
    }

    pub fn container_count(&self) -> usize {
        self.state.lock().unwrap().containers.len()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .is_some_and(|c| c.running)
    }

    pub fn stop(&self, id: &str) {
        if let Some(container) = self.state.lock().unwrap().containers.get_mut(id) {
            container.running = false;
        }
    }

    pub fn vanish(&self, id: &str) {
        self.state.lock().unwrap().containers.remove(id);
    }

    /// Adds a container as if a previous daemon run had left it behind.
    pub fn add_container(&self, id: &str, name: &str, labels: &[(&str, &str)], running: bool) {
        self.state.lock().unwrap().containers.insert(
            id.to_string(),
            FakeContainer {
                name: name.to_string(),
                labels: labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                running,
                created_at: Utc::now(),
            },
        );
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_vec());
    }

    pub fn execs(&self) -> Vec<ExecCall> {
        self.state.lock().unwrap().log.clone()
    }

    /// Polls the exec log until `matches` holds for some exec.
    pub async fn wait_for_exec<F>(&self, matches: F) -> Option<ExecCall>
    where
        F: Fn(&ExecCall) -> bool,
    {
        for _ in 0..200 {
            if let Some(call) = self.execs().into_iter().find(|call| matches(call)) {
                return Some(call);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn resolve(state: &State, id_or_name: &str) -> Option<String> {
        if state.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        state
            .containers
            .iter()
            .find(|(_, c)| c.name == id_or_name)
            .map(|(id, _)| id.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn volume_exists(&self, name: &str) -> RuntimeResult<bool> {
        Ok(self.state.lock().unwrap().volumes.contains_key(name))
    }

    async fn create_volume(&self, name: &str, labels: HashMap<String, String>) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.volumes.contains_key(name) {
            return Err(RuntimeError::AlreadyExists(name.to_string()));
        }
        state.volumes.insert(name.to_string(), labels);
        self.volumes_created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        // Widen the window for racing creators.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let mut state = self.state.lock().unwrap();
        if state.containers.values().any(|c| c.name == spec.name) {
            return Err(RuntimeError::AlreadyExists(spec.name.clone()));
        }
        if !state.volumes.contains_key(&spec.volume) {
            return Err(RuntimeError::NotFound(spec.volume.clone()));
        }
        let id = self.next("container");
        state.containers.insert(
            id.clone(),
            FakeContainer {
                name: spec.name.clone(),
                labels: spec.labels.clone(),
                running: false,
                created_at: Utc::now(),
            },
        );
        self.containers_created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> RuntimeResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api("image not found".into()));
        }
        let mut state = self.state.lock().unwrap();
        let id = Self::resolve(&state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(container) = state.containers.get_mut(&id) {
            container.running = true;
        }
        Ok(())
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = Self::resolve(&state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        if let Some(container) = state.containers.get_mut(&id) {
            container.running = false;
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> RuntimeResult<()> {
        let mut state = self.state.lock().unwrap();
        let id = Self::resolve(&state, id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.containers.remove(&id);
        Ok(())
    }

    async fn inspect_container(&self, id: &str) -> RuntimeResult<Option<ContainerState>> {
        let delay = self.inspect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(id)
            .map(|c| ContainerState { running: c.running }))
    }

    async fn list_containers(&self, label: &str) -> RuntimeResult<Vec<ContainerRecord>> {
        let (key, value) = label.split_once('=').unwrap_or((label, ""));
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| {
                c.labels
                    .get(key)
                    .is_some_and(|v| value.is_empty() || v == value)
            })
            .map(|(id, c)| ContainerRecord {
                id: id.clone(),
                name: c.name.clone(),
                labels: c.labels.clone(),
                running: c.running,
                created_at: c.created_at,
            })
            .collect())
    }

    async fn create_exec(&self, container_id: &str, spec: &ExecSpec) -> RuntimeResult<String> {
        let mut state = self.state.lock().unwrap();
        match state.containers.get(container_id) {
            Some(container) if container.running => {}
            Some(_) => return Err(RuntimeError::Api(format!("{container_id} is not running"))),
            None => return Err(RuntimeError::NotFound(container_id.to_string())),
        }
        let id = self.next("exec");
        state
            .pending_execs
            .insert(id.clone(), (container_id.to_string(), spec.clone()));
        Ok(id)
    }

    async fn start_exec(&self, exec_id: &str, tty: bool) -> RuntimeResult<ExecStream> {
        let (container_id, spec) = self
            .state
            .lock()
            .unwrap()
            .pending_execs
            .remove(exec_id)
            .ok_or_else(|| RuntimeError::NotFound(exec_id.to_string()))?;
        let handler = Arc::clone(&*self.handler.lock().unwrap());
        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);

        let exec_id = exec_id.to_string();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            serve_exec(server, state, handler, exec_id, container_id, spec, tty).await;
        });
        Ok(Box::new(client))
    }

    async fn inspect_exec(&self, exec_id: &str) -> RuntimeResult<ExecStatus> {
        let unsettled = self
            .unsettled_inspects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if unsettled {
            return Ok(ExecStatus {
                running: true,
                exit_code: None,
            });
        }
        let state = self.state.lock().unwrap();
        Ok(match state.exit_codes.get(exec_id) {
            Some(code) => ExecStatus {
                running: false,
                exit_code: Some(*code),
            },
            None => ExecStatus {
                running: true,
                exit_code: None,
            },
        })
    }

    async fn download_archive(&self, _container_id: &str, path: &str) -> RuntimeResult<Vec<u8>> {
        let contents = self
            .state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(path.to_string()))?;
        let name = path.rsplit('/').next().unwrap_or(path);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_data(&mut header, name, contents.as_slice())?;
        Ok(builder.into_inner()?)
    }
}

async fn serve_exec(
    mut server: DuplexStream,
    state: Arc<Mutex<State>>,
    handler: ExecHandler,
    exec_id: String,
    container_id: String,
    spec: ExecSpec,
    tty: bool,
) {
    let mut stdin = Vec::new();
    if spec.attach_stdin && !tty {
        let _ = server.read_to_end(&mut stdin).await;
    }
    let call = ExecCall {
        container_id,
        argv: spec.argv.clone(),
        env: spec.env.clone(),
        stdin,
        tty,
    };
    state.lock().unwrap().log.push(call.clone());
    let reply = handler(&call);

    let encode = |channel: Channel, chunk: &[u8]| {
        if tty {
            chunk.to_vec()
        } else {
            encode_frame(channel, chunk)
        }
    };
    if let Some(raw) = &reply.raw {
        let _ = server.write_all(raw).await;
    }
    for chunk in &reply.stdout {
        let _ = server.write_all(&encode(Channel::Stdout, chunk)).await;
    }
    for chunk in &reply.stderr {
        let _ = server.write_all(&encode(Channel::Stderr, chunk)).await;
    }
    if let Some((release, chunks)) = &reply.later {
        release.notified().await;
        for chunk in chunks {
            let _ = server.write_all(&encode(Channel::Stdout, chunk)).await;
        }
    }

    state
        .lock()
        .unwrap()
        .exit_codes
        .insert(exec_id, reply.exit_code);

    if reply.hang {
        let mut sink = [0u8; 1024];
        while let Ok(n) = server.read(&mut sink).await {
            if n == 0 {
                break;
            }
        }
    }
}

/// A manager over a fresh fake runtime, with short timeouts.
pub fn harness(fake: &Arc<FakeRuntime>) -> SandboxManager {
    let config = ManagerConfig {
        signal_poll_ms: 10,
        setup_timeout_secs: 2,
        verify_timeout_secs: 2,
        ..ManagerConfig::default()
    };
    harness_with(fake, config)
}

pub fn harness_with(fake: &Arc<FakeRuntime>, config: ManagerConfig) -> SandboxManager {
    SandboxManager::new(Arc::clone(fake) as Arc<dyn ContainerRuntime>, config)
}
