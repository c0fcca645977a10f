//! Child-process bridge: runs a synchronous [`ProcessSection`] in a
//! separate OS process, framing items over its stdio pipes.
//!
//! Rust has no `fork`-and-share-memory equivalent safe to use from an
//! already-multithreaded tokio process, so unlike the dynamically typed
//! original this bridge re-execs the current binary (grounded in
//! `remotemedia_runtime`'s `ProcessManager::spawn_node`, which does the
//! same) and looks the section up by name in a small in-process registry.
//! The host binary must call [`run_worker_if_requested`] at the very top
//! of `main`, before anything else, so a re-exec'd child dispatches
//! straight into the worker body instead of running normal startup code.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use weld_core::section::{ItemStream, OutputSink, ProcessSection, Section, SyncItemIter, SyncOutput};
use weld_core::{Error, Result};

const WORKER_ENV_VAR: &str = "WELD_BRIDGE_WORKER";
const EOS_MARKER: u32 = u32::MAX;

/// Tuning for the child process's spawn and teardown.
#[derive(Debug, Clone)]
pub struct ProcessBridgeConfig {
    /// How long to wait for a clean exit after SIGTERM before SIGKILL.
    pub termination_grace: Duration,
}

impl Default for ProcessBridgeConfig {
    fn default() -> Self {
        ProcessBridgeConfig {
            termination_grace: Duration::from_secs(3),
        }
    }
}

type WorkerMain = Arc<dyn Fn() + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, WorkerMain>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, WorkerMain>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Registers a [`ProcessSection`] constructor under `name`, so a re-exec'd
/// child process can find it via [`run_worker_if_requested`]. Call this
/// during normal startup, before `run_worker_if_requested` — both the
/// parent and every child run the same registration code, since both are
/// the same binary.
pub fn register_process_worker<T, S>(name: impl Into<String>, make_section: impl Fn() -> S + Send + Sync + 'static)
where
    T: Send + Serialize + DeserializeOwned + 'static,
    S: ProcessSection<T> + 'static,
{
    let name = name.into();
    let entry: WorkerMain = Arc::new(move || {
        let section = make_section();
        run_worker_body::<T, S>(&section);
    });
    registry().lock().unwrap().insert(name, entry);
}

/// If the current process was re-exec'd as a worker (`WELD_BRIDGE_WORKER`
/// is set), runs the registered worker body and returns `true`. The
/// caller should return from `main` immediately when this is `true`.
pub fn run_worker_if_requested() -> bool {
    let Ok(name) = std::env::var(WORKER_ENV_VAR) else {
        return false;
    };
    let entry = registry().lock().unwrap().get(&name).cloned();
    match entry {
        Some(run) => {
            run();
            true
        }
        None => {
            eprintln!("weld-bridge: no process worker registered for '{name}'");
            std::process::exit(1);
        }
    }
}

fn run_worker_body<T, S>(section: &S)
where
    T: Send + Serialize + DeserializeOwned + 'static,
    S: ProcessSection<T> + ?Sized,
{
    let (item_tx, item_rx) = std::sync::mpsc::sync_channel::<T>(0);
    let (out_tx, out_rx) = std::sync::mpsc::sync_channel::<T>(0);

    let reader = std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut locked = stdin.lock();
        loop {
            match read_frame_sync(&mut locked) {
                Ok(Some(bytes)) => {
                    let item: T = match bincode::deserialize(&bytes) {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    if item_tx.send(item).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let writer = std::thread::spawn(move || {
        let stdout = std::io::stdout();
        let mut locked = stdout.lock();
        while let Ok(item) = out_rx.recv() {
            if let Ok(bytes) = bincode::serialize(&item) {
                if write_frame_sync(&mut locked, &bytes).is_err() {
                    break;
                }
            }
        }
        let _ = write_sentinel_sync(&mut locked);
    });

    let sync_input = SyncItemIter::new(item_rx);
    let sync_output = SyncOutput::new(out_tx);
    let _ = section.run(Some(sync_input), sync_output);

    let _ = reader.join();
    let _ = writer.join();
}

/// Adapts a [`ProcessSection`] into an ordinary [`Section`] by running it
/// in a child instance of the current executable.
pub struct ProcessBridge<T: Send + 'static> {
    worker_name: String,
    config: ProcessBridgeConfig,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Send + Serialize + DeserializeOwned + 'static> ProcessBridge<T> {
    /// `worker_name` must match the name passed to
    /// [`register_process_worker`] for this section.
    pub fn new(worker_name: impl Into<String>) -> Self {
        ProcessBridge {
            worker_name: worker_name.into(),
            config: ProcessBridgeConfig::default(),
            _marker: PhantomData,
        }
    }

    pub fn with_config(mut self, config: ProcessBridgeConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<T: Send + Serialize + DeserializeOwned + 'static> Section<T> for ProcessBridge<T> {
    async fn run(&self, input: Option<&mut ItemStream<T>>, output: &OutputSink<T>) -> Result<()> {
        let exe = std::env::current_exe()?;
        let mut command = tokio::process::Command::new(exe);
        command
            .env(WORKER_ENV_VAR, &self.worker_name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid().ok();
                    Ok(())
                });
            }
        }

        let mut child = command.spawn()?;
        let mut child_stdin = child.stdin.take().expect("stdin was piped");
        let mut child_stdout = child.stdout.take().expect("stdout was piped");
        let child_stderr = child.stderr.take().expect("stderr was piped");

        tokio::spawn(async move {
            let mut lines = BufReader::new(child_stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::warn!(target: "weld_bridge::process", "{line}");
            }
        });

        let send_items = async {
            if let Some(input) = input {
                while let Some(item) = input.next().await {
                    let bytes = bincode::serialize(&item)?;
                    write_frame_async(&mut child_stdin, &bytes).await?;
                }
            }
            write_sentinel_async(&mut child_stdin).await
        };

        let recv_items = async {
            loop {
                match read_frame_async(&mut child_stdout).await? {
                    Some(bytes) => {
                        let item: T = bincode::deserialize(&bytes)?;
                        if output.send(item).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            Ok::<(), Error>(())
        };

        let (send_result, recv_result) = tokio::join!(send_items, recv_items);
        send_result?;
        recv_result?;

        terminate_gracefully(&mut child, self.config.termination_grace).await;
        Ok(())
    }
}

async fn terminate_gracefully(child: &mut tokio::process::Child, grace: Duration) {
    if let Ok(Some(status)) = child.try_wait() {
        tracing::info!(?status, "process section exited on its own");
        return;
    }
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        let _ = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM);
    }
    let waited = tokio::time::timeout(grace, child.wait()).await;
    if waited.is_err() {
        tracing::warn!("process section did not exit within grace period, killing");
        let _ = child.kill().await;
    }
}

fn read_frame_sync(reader: &mut impl std::io::Read) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    if reader.read_exact(&mut len_bytes).is_err() {
        return Ok(None);
    }
    let len = u32::from_le_bytes(len_bytes);
    if len == EOS_MARKER {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn write_frame_sync(writer: &mut impl std::io::Write, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(bytes)?;
    writer.flush()
}

fn write_sentinel_sync(writer: &mut impl std::io::Write) -> std::io::Result<()> {
    writer.write_all(&EOS_MARKER.to_le_bytes())?;
    writer.flush()
}

async fn read_frame_async<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Vec<u8>>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(_) => return Ok(None),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len == EOS_MARKER {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame_async<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
) -> Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn write_sentinel_async<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer.write_all(&EOS_MARKER.to_le_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_a_cursor() {
        let mut buf = Vec::new();
        write_frame_sync(&mut buf, b"hello").unwrap();
        write_sentinel_sync(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let first = read_frame_sync(&mut cursor).unwrap();
        assert_eq!(first, Some(b"hello".to_vec()));
        let second = read_frame_sync(&mut cursor).unwrap();
        assert_eq!(second, None);
    }
}
