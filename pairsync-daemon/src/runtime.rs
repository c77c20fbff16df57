use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, RwLock};

use pairsync_core::{config, JobName};

use crate::error::{io_err, DaemonError};
use crate::job::JobHandle;
use crate::paths::{run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse, DaemonStatus, JobSyncResult, RejectedJob};
use crate::scheduler::Scheduler;

/// State shared by every socket client.
struct Context {
    home: PathBuf,
    config_path: PathBuf,
    started_at: DateTime<Utc>,
    rejected: Vec<RejectedJob>,
    scheduler: Arc<RwLock<Scheduler>>,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path, config_path: &Path, json_logs: bool) -> Result<(), DaemonError> {
    init_tracing(json_logs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf(), config_path.to_path_buf()))
}

/// Run the daemon: start every valid job, serve the control socket, and on
/// ctrl-c or `stop` wait for in-flight cycles before returning.
pub async fn run(home: PathBuf, config_path: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let config = {
        let path = config_path.clone();
        tokio::task::spawn_blocking(move || config::load_from(&path))
            .await
            .map_err(|err| DaemonError::Protocol(format!("config load join error: {err}")))??
    };

    let (mut scheduler, mut rejected) = Scheduler::from_config(&config, &home);
    rejected.extend(scheduler.start().await);
    if scheduler.is_empty() {
        tracing::warn!("no runnable jobs; serving status only");
    }
    let rejected = rejected
        .into_iter()
        .map(|(job, err)| RejectedJob {
            job,
            error: err.to_string(),
        })
        .collect();

    let scheduler = Arc::new(RwLock::new(scheduler));
    let context = Arc::new(Context {
        home,
        config_path,
        started_at: Utc::now(),
        rejected,
        scheduler: Arc::clone(&scheduler),
    });

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            let result = socket_server_task(context, shutdown.clone(), shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (socket_result, signal_result) = tokio::join!(socket_handle, signal_handle);

    scheduler.write().await.stop().await;

    handle_join("socket_server", socket_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn socket_server_task(
    context: Arc<Context>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = socket_path(&context.home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let context = Arc::clone(&context);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, context, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    context: Arc<Context>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let response = match request.cmd.as_str() {
            "status" => match serde_json::to_value(build_status(&context).await) {
                Ok(payload) => DaemonResponse::ok(payload),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "sync" => match run_requested_syncs(&context, request.job).await {
                Ok(results) => DaemonResponse::ok(json!(results)),
                Err(err) => DaemonResponse::error(err.to_string()),
            },
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if request.cmd == "stop" {
            break;
        }
    }

    Ok(())
}

async fn build_status(context: &Context) -> DaemonStatus {
    let jobs = context.scheduler.read().await.status();
    DaemonStatus {
        running: true,
        pid: std::process::id(),
        started_at: context.started_at,
        socket: socket_path(&context.home),
        config: context.config_path.clone(),
        jobs,
        rejected: context.rejected.clone(),
    }
}

async fn run_requested_syncs(
    context: &Context,
    job: Option<String>,
) -> Result<Vec<JobSyncResult>, DaemonError> {
    // Handles are cloned out so a long cycle never holds the scheduler lock.
    let handles: Vec<JobHandle> = {
        let scheduler = context.scheduler.read().await;
        match job {
            Some(name) => {
                let name = JobName::from(name);
                vec![scheduler
                    .handle(&name)
                    .ok_or(DaemonError::UnknownJob(name))?]
            }
            None => scheduler.handles(),
        }
    };

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let outcome = handle.sync_now().await;
        results.push(JobSyncResult {
            job: handle.name().clone(),
            error: outcome.as_ref().err().map(ToString::to_string),
            report: outcome.ok(),
        });
    }
    Ok(results)
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    let run = run_dir(home);
    if !run.exists() {
        fs::create_dir_all(&run).map_err(|e| io_err(&run, e))?;
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// Install the global subscriber, writing to stderr. `RUST_LOG` overrides
/// the `info` default. Safe to call more than once; later calls are no-ops.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{request_status, request_stop, request_sync};
    use tempfile::TempDir;

    fn write_config(home: &Path, a: &Path, b: &Path) -> PathBuf {
        let path = config::config_path_at(home);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let yaml = format!(
            "jobs:\n  docs:\n    directory: {}\n    peer_directory: {}\n    sync_interval_seconds: 3600\n    storage: memory\n  broken:\n    directory: /no/such/dir\n    peer_directory: {}\n    sync_interval_seconds: 1\n",
            a.display(),
            b.display(),
            b.display(),
        );
        fs::write(&path, yaml).unwrap();
        path
    }

    #[test]
    fn stale_socket_is_removed_before_bind() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("daemon.sock");
        fs::write(&socket, "").unwrap();
        prepare_socket_for_bind(&socket).unwrap();
        assert!(!socket.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn socket_serves_status_sync_and_stop() {
        let home = TempDir::new().unwrap();
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        fs::write(a.path().join("a.txt"), "a").unwrap();
        let config_path = write_config(home.path(), a.path(), b.path());

        let daemon = tokio::spawn(run(home.path().to_path_buf(), config_path));
        let home_path = home.path().to_path_buf();
        let client = tokio::task::spawn_blocking(move || {
            for _ in 0..100 {
                if socket_path(&home_path).exists() {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            let status = request_status(&home_path).expect("status");
            let synced = request_sync(&home_path, Some("docs".into())).expect("sync");
            let unknown = request_sync(&home_path, Some("nope".into()));
            request_stop(&home_path).expect("stop");
            (status, synced, unknown)
        });
        let (status, synced, unknown) = client.await.unwrap();
        daemon.await.unwrap().unwrap();

        assert!(status.running);
        assert_eq!(status.jobs.len(), 1);
        assert_eq!(status.rejected.len(), 1);
        assert_eq!(status.rejected[0].job, JobName::from("broken"));
        assert_eq!(synced.len(), 1);
        assert!(synced[0].error.is_none());
        assert!(unknown.is_err());
        assert_eq!(fs::read_to_string(b.path().join("a.txt")).unwrap(), "a");
        assert!(!socket_path(home.path()).exists());
    }
}
