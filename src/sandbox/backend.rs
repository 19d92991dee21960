//! Docker-backed execution controller.
//!
//! One [`DockerBackend`] owns at most one live container at a time. Every
//! run follows the same path: acquire a pooled client, compute bindings and
//! host configuration, create and start the container, wait for exit under
//! the hard timeout, then tear everything down unconditionally. Teardown is
//! serialized with the public [`kill`](DockerBackend::kill) entry point, so
//! a timeout-triggered teardown and an explicit kill can never double-remove
//! the same container.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Instant;

use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerApiError;
use bollard::image::ListImagesOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ConfigError, RegistrationError, SandboxError};
use crate::sandbox::config::BackendConfig;
use crate::sandbox::mounts::{MountEntry, MountTable, FILE_MOUNT_DIR};
use crate::sandbox::pool::{ContextToken, DockerClientPool};
use crate::sandbox::result::ExecutionResult;
use crate::sandbox::stats::{self, STATS_LOG_FILE_NAME};

/// Outcome of waiting on a container.
enum WaitOutcome {
    /// The container exited and reported a code.
    Exited(i64),
    /// The hard wall-clock limit elapsed first.
    TimedOut,
    /// The engine lost track of the container; already logged.
    Lost,
}

/// Per-run state shared between `run()` and `kill()`.
#[derive(Debug, Default)]
struct RunState {
    client: Option<Docker>,
    container_id: Option<String>,
    log_path: PathBuf,
    out_of_memory: bool,
    ended_at: Option<Instant>,
}

/// Sandboxed execution backend on top of the Docker engine.
///
/// Constructed once per worker with an immutable [`BackendConfig`]; each
/// [`run`](Self::run) call produces one [`ExecutionResult`]. The backend
/// guarantees that whatever happens during a run (completion, timeout,
/// engine error, explicit kill), the container is removed, its logs are
/// captured, and the pooled client is handed back before the call returns.
pub struct DockerBackend {
    config: BackendConfig,
    resolved_user: Option<String>,
    image_id: String,
    program_in_sandbox: PathBuf,
    stats_shim_in_sandbox: Option<PathBuf>,
    mounts: StdMutex<MountTable>,
    state: Mutex<RunState>,
    pool: Arc<DockerClientPool>,
    token: ContextToken,
}

impl DockerBackend {
    /// Validates `config`, resolves the image against the engine's catalog,
    /// and returns a backend ready to run.
    ///
    /// A pooled client is acquired only for this validation step and
    /// released immediately afterwards; `run()` always re-acquires.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on any invalid option, when the daemon is
    /// unreachable, or when the image is missing or ambiguous. All of these
    /// are fatal to the instance being built.
    pub async fn new(
        pool: Arc<DockerClientPool>,
        token: ContextToken,
        config: BackendConfig,
    ) -> Result<Self, ConfigError> {
        let resolved_user = config.validate()?;
        if let Some(user) = &resolved_user {
            info!(user = %user, "using user inside container");
        }

        // file_name() is checked by validate().
        let program_name = config
            .program_path
            .file_name()
            .ok_or_else(|| ConfigError::InvalidProgramPath(config.program_path.clone()))?
            .to_string_lossy()
            .into_owned();
        let program_in_sandbox = Path::new(FILE_MOUNT_DIR).join(&program_name);

        // The program binding is mandatory and must never be shadowed.
        if let Some(mount) = config
            .extra_mounts
            .iter()
            .find(|mount| mount.container_path == program_in_sandbox)
        {
            return Err(ConfigError::DuplicateMountTarget(
                mount.container_path.clone(),
            ));
        }

        let mut mounts = MountTable::new(config.extra_mounts.clone());
        mounts.reserve_name(&program_name);

        let stats_shim_in_sandbox = match &config.stats_shim {
            Some(shim) => {
                let in_sandbox = mounts
                    .add_file(shim, true)
                    .map_err(ConfigError::ShimRegistration)?;
                Some(in_sandbox)
            }
            None => None,
        };

        let client = pool
            .acquire(token)
            .map_err(|err| ConfigError::DaemonUnavailable(err.to_string()))?;
        let image_id = Self::resolve_image(&client, &config.image).await;
        pool.release(token);
        let image_id = image_id?;

        Ok(Self {
            config,
            resolved_user,
            image_id,
            program_in_sandbox,
            stats_shim_in_sandbox,
            mounts: StdMutex::new(mounts),
            state: Mutex::new(RunState::default()),
            pool,
            token,
        })
    }

    async fn resolve_image(client: &Docker, image: &str) -> Result<String, ConfigError> {
        client
            .ping()
            .await
            .map_err(|err| ConfigError::DaemonUnavailable(err.to_string()))?;

        let images = client
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await?;
        let matches: Vec<_> = images
            .into_iter()
            .filter(|summary| summary.repo_tags.iter().any(|tag| tag == image))
            .collect();

        match matches.as_slice() {
            [] => Err(ConfigError::ImageNotFound(image.to_string())),
            [found] => {
                debug!(image, id = %found.id, "resolved docker image");
                Ok(found.id.clone())
            }
            _ => Err(ConfigError::AmbiguousImage {
                image: image.to_string(),
                count: matches.len(),
            }),
        }
    }

    /// Backend name, for harness-facing logs and reports.
    pub fn name(&self) -> &'static str {
        "Docker"
    }

    /// The configuration this backend was built with.
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Path the program is mounted at inside the sandbox.
    pub fn program_path_in_sandbox(&self) -> &Path {
        &self.program_in_sandbox
    }

    /// Working directory inside the sandbox.
    pub fn working_dir_in_sandbox(&self) -> &Path {
        &self.config.image_work_dir
    }

    /// Host path of the exit-stats document, when the shim is enabled.
    pub fn stats_log_on_host(&self) -> PathBuf {
        self.config.working_dir.join(STATS_LOG_FILE_NAME)
    }

    /// Sandbox path of the exit-stats document, when the shim is enabled.
    pub fn stats_log_in_sandbox(&self) -> PathBuf {
        self.config.image_work_dir.join(STATS_LOG_FILE_NAME)
    }

    /// Registers a host file to be mounted at `/tmp/<basename>` inside the
    /// sandbox for every subsequent run.
    ///
    /// # Errors
    ///
    /// Fails on relative or missing paths and on base-name collisions with
    /// previously registered files, extra mounts, or the program binding.
    /// A failed registration leaves existing registrations untouched.
    pub fn add_file(&self, host_path: &Path, read_only: bool) -> Result<(), RegistrationError> {
        self.mounts().add_file(host_path, read_only).map(|_| ())
    }

    /// Sandbox path a registered file is mounted at.
    pub fn file_path_in_sandbox(&self, host_path: &Path) -> Result<PathBuf, RegistrationError> {
        self.mounts().file_path_in_sandbox(host_path)
    }

    /// Runs `cmd_line` inside a fresh container and reports how it ended.
    ///
    /// Combined stdout/stderr is written to `log_path` (overwritten each
    /// run). The container is removed and the pooled client released on
    /// every exit path.
    ///
    /// # Errors
    ///
    /// Only client acquisition and container creation failures surface as
    /// `Err`; everything after that (timeout, OOM kill, engine losing the
    /// container, teardown hiccups) is encoded in the returned
    /// [`ExecutionResult`] and logged.
    pub async fn run(
        &self,
        cmd_line: &[String],
        log_path: &Path,
        env: &HashMap<String, String>,
    ) -> Result<ExecutionResult, SandboxError> {
        let client = self
            .pool
            .acquire(self.token)
            .map_err(|err| SandboxError::DaemonUnavailable(err.to_string()))?;

        {
            let mut state = self.state.lock().await;
            if state.container_id.is_some() {
                return Err(SandboxError::AlreadyRunning);
            }
            state.client = Some(client.clone());
            state.log_path = log_path.to_path_buf();
            state.out_of_memory = false;
            state.ended_at = None;
        }

        let binds = {
            let work = MountEntry::new(
                self.config.working_dir.clone(),
                self.config.image_work_dir.clone(),
            );
            let program = MountEntry::read_only(
                self.config.program_path.clone(),
                self.program_in_sandbox.clone(),
            );
            self.mounts().bindings(&work, &program)
        };
        debug!(?binds, "declaring bindings");

        if self.config.limits.memory_limit > 0 {
            info!(mib = self.config.limits.memory_limit, "setting memory limit");
        }
        let ulimits = self.config.limits.ulimits();
        let host_config = HostConfig {
            binds: Some(binds),
            privileged: Some(false),
            memory: self.config.limits.memory_bytes(),
            memory_swap: self.config.limits.memory_bytes(),
            ulimits: if ulimits.is_empty() { None } else { Some(ulimits) },
            ..Default::default()
        };

        let final_cmd = self.shimmed_command(cmd_line);
        debug!(?final_cmd, "command line inside container");

        let env_strings: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let container_config = Config {
            image: Some(self.image_id.clone()),
            cmd: Some(final_cmd),
            env: if env_strings.is_empty() {
                None
            } else {
                Some(env_strings)
            },
            working_dir: Some(self.config.image_work_dir.to_string_lossy().into_owned()),
            user: self.resolved_user.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: format!("benchbox-{}", Uuid::new_v4()),
            platform: None,
        };

        let created = match client.create_container(Some(options), container_config).await {
            Ok(response) => response,
            Err(err) => {
                // Nothing to tear down yet; hand the client back and bail.
                self.state.lock().await.client = None;
                self.pool.release(self.token);
                return Err(SandboxError::Api(err));
            }
        };
        if !created.warnings.is_empty() {
            warn!(warnings = ?created.warnings, "warnings emitted when creating container");
        }
        debug!(container = %created.id, "created container");
        self.state.lock().await.container_id = Some(created.id.clone());

        let started_at = Instant::now();
        let mut exit_code = None;
        let mut out_of_time = false;

        match client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => match self.wait_for_exit(&client, &created.id).await {
                WaitOutcome::Exited(code) => exit_code = Some(code),
                WaitOutcome::TimedOut => {
                    info!("timeout occurred");
                    out_of_time = true;
                }
                WaitOutcome::Lost => {}
            },
            Err(err) => {
                error!(container = %created.id, %err, "failed to start container");
            }
        }

        self.kill().await;

        let (out_of_memory, ended_at) = {
            let state = self.state.lock().await;
            (
                state.out_of_memory,
                state.ended_at.unwrap_or_else(Instant::now),
            )
        };
        let wall_time = ended_at.saturating_duration_since(started_at);

        let (user_cpu_time, sys_cpu_time) = if self.config.stats_shim.is_some() {
            let stats_path = self.stats_log_on_host();
            match stats::read_cpu_times(&stats_path) {
                Ok((user, sys)) => (Some(user), Some(sys)),
                Err(err) => {
                    error!(path = %stats_path.display(), %err, "failed to retrieve exit stats");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        Ok(ExecutionResult {
            exit_code,
            wall_time,
            out_of_time,
            out_of_memory,
            user_cpu_time,
            sys_cpu_time,
        })
    }

    async fn wait_for_exit(&self, client: &Docker, container_id: &str) -> WaitOutcome {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = client.wait_container(container_id, Some(options));

        let next = match self.config.limits.wait_timeout() {
            Some(timeout) => {
                info!(seconds = timeout.as_secs(), "using timeout");
                match tokio::time::timeout(timeout, wait.next()).await {
                    Ok(item) => item,
                    Err(_) => return WaitOutcome::TimedOut,
                }
            }
            None => wait.next().await,
        };

        match next {
            Some(Ok(response)) => WaitOutcome::Exited(response.status_code),
            // bollard reports non-zero exits through the error channel.
            Some(Err(DockerApiError::DockerContainerWaitError { code, .. })) => {
                WaitOutcome::Exited(code)
            }
            Some(Err(err)) => {
                error!(container = %container_id, %err, "failed to wait on container");
                WaitOutcome::Lost
            }
            None => {
                error!(container = %container_id, "wait stream ended without a response");
                WaitOutcome::Lost
            }
        }
    }

    /// Tears down the current container: signal-kill if still running,
    /// capture logs, record the OOM flag, remove it, release the client.
    ///
    /// Safe to call at any time from any task. A second call while nothing
    /// is running is a no-op apart from pool bookkeeping, and each teardown
    /// step is best-effort: an engine failure is logged and the remaining
    /// steps still run.
    pub async fn kill(&self) {
        let mut state = self.state.lock().await;
        state.ended_at = Some(Instant::now());

        if let (Some(client), Some(container_id)) = (state.client.clone(), state.container_id.take())
        {
            info!(container = %container_id, "stopping container");

            match client
                .inspect_container(&container_id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspection)
                    if inspection
                        .state
                        .as_ref()
                        .and_then(|state| state.running)
                        .unwrap_or(false) =>
                {
                    if let Err(err) = client
                        .kill_container(&container_id, Some(KillContainerOptions { signal: "SIGKILL" }))
                        .await
                    {
                        error!(container = %container_id, %err, "failed to kill container");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!(container = %container_id, %err, "failed to inspect container before kill");
                }
            }

            info!(path = %state.log_path.display(), "writing log");
            if let Err(err) = capture_logs(&client, &container_id, &state.log_path).await {
                error!(
                    container = %container_id,
                    path = %state.log_path.display(),
                    %err,
                    "failed to capture container logs"
                );
            }

            match client
                .inspect_container(&container_id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspection) => {
                    state.out_of_memory = inspection
                        .state
                        .and_then(|state| state.oom_killed)
                        .unwrap_or(false);
                }
                Err(err) => {
                    error!(container = %container_id, %err, "failed to read final container state");
                }
            }

            info!(container = %container_id, "destroying container");
            if let Err(err) = client
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        v: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                error!(container = %container_id, %err, "failed to remove container");
            }
        }

        state.client = None;
        self.pool.release(self.token);
    }

    /// Checks that `tool_path` exists inside the image by running
    /// `ls <tool_path>` in a throwaway container.
    ///
    /// Skipped entirely when the configuration says so. The probe uses its
    /// own pooled client and shares no state with the main controller.
    pub async fn check_tool_exists(&self, tool_path: &Path) -> Result<(), SandboxError> {
        if self.config.skip_tool_check {
            info!("skipping tool check");
            return Ok(());
        }
        if !tool_path.is_absolute() {
            return Err(SandboxError::RelativePath(tool_path.to_path_buf()));
        }

        debug!(tool = %tool_path.display(), "checking tool exists in image");
        let client = self
            .pool
            .acquire(self.token)
            .map_err(|err| SandboxError::DaemonUnavailable(err.to_string()))?;
        let result = probe_tool(&client, &self.image_id, tool_path).await;
        self.pool.release(self.token);
        result
    }

    /// Prefixes `cmd_line` with the stats-shim invocation when enabled.
    fn shimmed_command(&self, cmd_line: &[String]) -> Vec<String> {
        match &self.stats_shim_in_sandbox {
            Some(shim) => {
                let mut cmd = vec![
                    shim.to_string_lossy().into_owned(),
                    self.stats_log_in_sandbox().to_string_lossy().into_owned(),
                ];
                cmd.extend(cmd_line.iter().cloned());
                cmd
            }
            None => cmd_line.to_vec(),
        }
    }

    fn mounts(&self) -> MutexGuard<'_, MountTable> {
        self.mounts.lock().expect("mount table mutex poisoned")
    }
}

/// Writes the container's combined stdout/stderr to `log_path`, overwriting
/// any previous contents.
async fn capture_logs(
    client: &Docker,
    container_id: &str,
    log_path: &Path,
) -> Result<(), SandboxError> {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        timestamps: false,
        tail: "all".to_string(),
        ..Default::default()
    };

    let mut file = File::create(log_path)?;
    let mut logs = client.logs(container_id, Some(options));
    while let Some(chunk) = logs.next().await {
        let output = chunk?;
        file.write_all(&output.into_bytes())?;
    }
    Ok(())
}

async fn probe_tool(
    client: &Docker,
    image_id: &str,
    tool_path: &Path,
) -> Result<(), SandboxError> {
    let config = Config {
        image: Some(image_id.to_string()),
        cmd: Some(vec![
            "ls".to_string(),
            tool_path.to_string_lossy().into_owned(),
        ]),
        ..Default::default()
    };

    let created = client
        .create_container(None::<CreateContainerOptions<String>>, config)
        .await?;
    debug!(container = %created.id, "created temporary container");
    client
        .start_container(&created.id, None::<StartContainerOptions<String>>)
        .await?;

    let exit_code = probe_exit_code(client, &created.id).await;
    if let Err(err) = client
        .remove_container(
            &created.id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        error!(container = %created.id, %err, "failed to remove temporary container");
    }

    let exit_code = exit_code?;
    if exit_code != 0 {
        return Err(SandboxError::ToolMissing {
            tool: tool_path.to_path_buf(),
            exit_code,
        });
    }
    Ok(())
}

async fn probe_exit_code(client: &Docker, container_id: &str) -> Result<i64, SandboxError> {
    let options = WaitContainerOptions {
        condition: "not-running",
    };
    let mut wait = client.wait_container(container_id, Some(options));
    match wait.next().await {
        Some(Ok(response)) => Ok(response.status_code),
        Some(Err(DockerApiError::DockerContainerWaitError { code, .. })) => Ok(code),
        Some(Err(err)) => Err(SandboxError::Api(err)),
        None => {
            // Fall back to the final inspected state.
            let inspection = client
                .inspect_container(container_id, None::<InspectContainerOptions>)
                .await?;
            Ok(inspection
                .state
                .and_then(|state| state.exit_code)
                .unwrap_or(-1))
        }
    }
}
