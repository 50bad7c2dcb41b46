//! Sandbox executor.
//!
//! Runs a generated program in an isolated child process: minimal
//! environment from an allowlist, its own session/process group, resource
//! limits installed between fork and exec (CPU seconds, address space, open
//! files), a wall-clock watchdog that terminates then kills, and a dedicated
//! audit pipe on fd 3 drained before the child is reaped.
//!
//! Session state machine:
//! `Created -> Configured -> Spawned -> Running -> terminal -> Reaped`,
//! driven only by the parent; reaping twice is a no-op.

use crate::audit::AuditLog;
use crate::capability::CapabilityToken;
use crate::codegen::{RUNTIME_MODULE, RUNTIME_PREAMBLE};
use crate::error::SandboxError;
use std::fs;
use std::io::{Read, Write};
use std::os::fd::FromRawFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub cpu_time_limit: Duration,
    pub wall_time_limit: Duration,
    pub memory_limit_bytes: u64,
    pub max_open_files: u64,
    pub network_allowed: bool,
    /// Directories the program may address through the capability layer.
    /// The child's working directory is always the scratch dir.
    pub filesystem_roots: Vec<PathBuf>,
    pub env_allowlist: Vec<String>,
    pub stdin: Option<String>,
    /// Host interpreter for the generated program.
    pub interpreter: String,
    /// Delay between SIGTERM and SIGKILL on limit expiry.
    pub grace_period: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        SandboxConfig {
            cpu_time_limit: Duration::from_secs(10),
            wall_time_limit: Duration::from_secs(30),
            memory_limit_bytes: 256 * 1024 * 1024,
            max_open_files: 64,
            network_allowed: false,
            filesystem_roots: Vec::new(),
            env_allowlist: vec!["PATH".to_string(), "LANG".to_string()],
            stdin: None,
            interpreter: "python3".to_string(),
            grace_period: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Completed,
    TimedOut,
    MemoryExceeded,
    Killed,
    Crashed,
}

impl SandboxStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Completed => "completed",
            SandboxStatus::TimedOut => "timeout",
            SandboxStatus::MemoryExceeded => "memory_exceeded",
            SandboxStatus::Killed => "killed",
            SandboxStatus::Crashed => "crashed",
        }
    }
}

#[derive(Debug)]
pub struct SandboxResult {
    pub status: SandboxStatus,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cpu_time: Duration,
    pub wall_time: Duration,
    pub peak_memory_bytes: u64,
    pub audit: AuditLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Created,
    Configured,
    Spawned,
    Running,
    Terminal(SandboxStatus),
    Reaped,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Created => "created",
            SessionState::Configured => "configured",
            SessionState::Spawned => "spawned",
            SessionState::Running => "running",
            SessionState::Terminal(_) => "terminal",
            SessionState::Reaped => "reaped",
        }
    }
}

pub struct SandboxSession {
    config: SandboxConfig,
    state: SessionState,
    workdir: Option<TempDir>,
    program_path: Option<PathBuf>,
    result: Option<SandboxResult>,
}

impl SandboxSession {
    pub fn new(config: SandboxConfig) -> Self {
        SandboxSession {
            config,
            state: SessionState::Created,
            workdir: None,
            program_path: None,
            result: None,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    /// Write the generated program, the runtime preamble, and the serialized
    /// policy tokens into a scratch directory.
    pub fn configure(
        &mut self,
        python_source: &str,
        tokens: &[Arc<CapabilityToken>],
    ) -> Result<(), SandboxError> {
        if self.state != SessionState::Created {
            return Err(SandboxError::InvalidState {
                state: self.state.name(),
                action: "configure",
            });
        }

        let workdir = TempDir::new().map_err(SandboxError::Workspace)?;
        let program_path = workdir.path().join("program.py");
        fs::write(&program_path, python_source).map_err(SandboxError::Workspace)?;
        fs::write(
            workdir.path().join(format!("{}.py", RUNTIME_MODULE)),
            RUNTIME_PREAMBLE,
        )
        .map_err(SandboxError::Workspace)?;

        let token_refs: Vec<&CapabilityToken> = tokens.iter().map(Arc::as_ref).collect();
        let policy_json =
            serde_json::to_string_pretty(&token_refs).expect("tokens serialize");
        fs::write(workdir.path().join("policy.json"), policy_json)
            .map_err(SandboxError::Workspace)?;

        self.program_path = Some(program_path);
        self.workdir = Some(workdir);
        self.state = SessionState::Configured;
        Ok(())
    }

    /// Spawn the child and run it to completion under the configured limits.
    pub fn run(&mut self) -> Result<(), SandboxError> {
        if self.state != SessionState::Configured {
            return Err(SandboxError::InvalidState {
                state: self.state.name(),
                action: "run",
            });
        }

        let workdir = self.workdir.as_ref().expect("configured workdir");
        let program_path = self.program_path.as_ref().expect("configured program");

        // Dedicated audit pipe; the write end becomes fd 3 in the child.
        let (audit_read_fd, audit_write_fd) = create_pipe()?;

        let mut command = Command::new(&self.config.interpreter);
        command
            .arg(program_path)
            .current_dir(workdir.path())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env_clear();

        for key in &self.config.env_allowlist {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        command.env("ML_POLICY_FILE", workdir.path().join("policy.json"));
        command.env("ML_SESSION", format!("mlc-{}", std::process::id()));
        command.env("PYTHONDONTWRITEBYTECODE", "1");
        if !self.config.network_allowed {
            command.env("ML_NO_NETWORK", "1");
        }
        if !self.config.filesystem_roots.is_empty() {
            let roots: Vec<String> = self
                .config
                .filesystem_roots
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            command.env("ML_FS_ROOTS", roots.join(":"));
        }

        let cpu_seconds = self.config.cpu_time_limit.as_secs().max(1);
        let memory_bytes = self.config.memory_limit_bytes;
        let max_open_files = self.config.max_open_files;
        unsafe {
            command.pre_exec(move || {
                // Own session and process group, so limit enforcement can
                // signal the whole tree.
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::dup2(audit_write_fd, 3) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                set_rlimit(libc::RLIMIT_CPU, cpu_seconds)?;
                set_rlimit(libc::RLIMIT_AS, memory_bytes)?;
                set_rlimit(libc::RLIMIT_NOFILE, max_open_files)?;
                set_rlimit(libc::RLIMIT_CORE, 0)?;
                Ok(())
            });
        }

        let spawn_started = Instant::now();
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                unsafe {
                    libc::close(audit_read_fd);
                    libc::close(audit_write_fd);
                }
                let source = err;
                return Err(if source.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::InterpreterMissing(self.config.interpreter.clone())
                } else {
                    SandboxError::Spawn(source)
                });
            }
        };
        self.state = SessionState::Spawned;
        let pid = child.id() as libc::pid_t;
        info!(pid, "sandbox child spawned");

        // The parent must not hold the write end open or the reader never
        // sees EOF.
        unsafe {
            libc::close(audit_write_fd);
        }

        // Stream readers.
        let audit_handle = spawn_fd_reader(audit_read_fd);
        let stdout_handle = spawn_pipe_reader(child.stdout.take());
        let stderr_handle = spawn_pipe_reader(child.stderr.take());

        if let Some(mut stdin_pipe) = child.stdin.take() {
            if let Some(input) = self.config.stdin.clone() {
                // Best effort; the child may exit before reading.
                let _ = stdin_pipe.write_all(input.as_bytes());
            }
            drop(stdin_pipe);
        }

        self.state = SessionState::Running;

        // Blocking wait4 on a worker; the parent enforces the wall clock.
        let (wait_sender, wait_receiver) = mpsc::channel();
        std::thread::spawn(move || {
            let mut status: libc::c_int = 0;
            let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
            let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
            let _ = wait_sender.send((rc, status, usage));
        });

        let mut timed_out = false;
        let waited = match wait_receiver.recv_timeout(self.config.wall_time_limit) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => {
                timed_out = true;
                warn!(pid, "wall-clock limit exceeded; terminating child");
                // Terminate the whole process group, then kill after a grace
                // period.
                unsafe {
                    libc::kill(-pid, libc::SIGTERM);
                }
                match wait_receiver.recv_timeout(self.config.grace_period) {
                    Ok(result) => result,
                    Err(_) => {
                        unsafe {
                            libc::kill(-pid, libc::SIGKILL);
                        }
                        wait_receiver
                            .recv_timeout(Duration::from_secs(5))
                            .map_err(|_| SandboxError::Pipe("child did not die".to_string()))?
                    }
                }
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(SandboxError::Pipe("wait worker vanished".to_string()));
            }
        };
        let wall_time = spawn_started.elapsed();
        let (_, raw_status, usage) = waited;

        // Drain in-flight audit events before reaping.
        let audit_text = audit_handle
            .join()
            .map_err(|_| SandboxError::Pipe("audit reader panicked".to_string()))?;
        let stdout = stdout_handle
            .join()
            .map_err(|_| SandboxError::Pipe("stdout reader panicked".to_string()))?;
        let stderr = stderr_handle
            .join()
            .map_err(|_| SandboxError::Pipe("stderr reader panicked".to_string()))?;

        let mut audit = AuditLog::collect(&audit_text);

        let cpu_time = rusage_cpu_time(&usage);
        let peak_memory_bytes = (usage.ru_maxrss as u64) * 1024;

        let (status, exit_code) = decode_status(raw_status, timed_out, cpu_time, &self.config);
        if matches!(status, SandboxStatus::TimedOut | SandboxStatus::MemoryExceeded) {
            audit.push_infrastructure("terminated_by_limit");
        }
        debug!(
            status = status.as_str(),
            exit_code,
            cpu_ms = cpu_time.as_millis() as u64,
            wall_ms = wall_time.as_millis() as u64,
            "sandbox child finished"
        );

        self.result = Some(SandboxResult {
            status,
            exit_code,
            stdout,
            stderr,
            cpu_time,
            wall_time,
            peak_memory_bytes,
            audit,
        });
        self.state = SessionState::Terminal(status);
        // wait4 already collected the child; dropping `Child` neither kills
        // nor waits.
        drop(child);
        Ok(())
    }

    /// Take the result and tear the session down. Idempotent: a second reap
    /// returns `None` and changes nothing.
    pub fn reap(&mut self) -> Option<SandboxResult> {
        match self.state {
            SessionState::Terminal(_) => {
                self.state = SessionState::Reaped;
                self.workdir.take();
                self.result.take()
            }
            _ => None,
        }
    }

    /// Convenience driver for the whole lifecycle.
    pub fn execute(
        python_source: &str,
        tokens: &[Arc<CapabilityToken>],
        config: SandboxConfig,
    ) -> Result<SandboxResult, SandboxError> {
        let mut session = SandboxSession::new(config);
        session.configure(python_source, tokens)?;
        session.run()?;
        session.reap().ok_or_else(|| SandboxError::InvalidState {
            state: "reaped",
            action: "take result",
        })
    }
}

fn create_pipe() -> Result<(libc::c_int, libc::c_int), SandboxError> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
        return Err(SandboxError::Pipe(
            std::io::Error::last_os_error().to_string(),
        ));
    }
    // Close-on-exec in the parent; the child re-acquires the write end via
    // dup2, which clears the flag on fd 3.
    for fd in fds {
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
    Ok((fds[0], fds[1]))
}

fn set_rlimit(resource: libc::__rlimit_resource_t, limit: u64) -> std::io::Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: limit,
        rlim_max: limit,
    };
    if unsafe { libc::setrlimit(resource, &rlimit) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn spawn_fd_reader(fd: libc::c_int) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut file = unsafe { fs::File::from_raw_fd(fd) };
        let mut text = String::new();
        let _ = file.read_to_string(&mut text);
        text
    })
}

fn spawn_pipe_reader<R: Read + Send + 'static>(
    pipe: Option<R>,
) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

fn rusage_cpu_time(usage: &libc::rusage) -> Duration {
    let user = Duration::new(
        usage.ru_utime.tv_sec as u64,
        (usage.ru_utime.tv_usec as u32) * 1000,
    );
    let system = Duration::new(
        usage.ru_stime.tv_sec as u64,
        (usage.ru_stime.tv_usec as u32) * 1000,
    );
    user + system
}

/// Map the raw wait status plus parent-side observations onto the sandbox
/// status taxonomy.
fn decode_status(
    raw_status: libc::c_int,
    timed_out: bool,
    cpu_time: Duration,
    config: &SandboxConfig,
) -> (SandboxStatus, i32) {
    if timed_out {
        return (SandboxStatus::TimedOut, 124);
    }

    if libc::WIFEXITED(raw_status) {
        let code = libc::WEXITSTATUS(raw_status);
        return match code {
            40 => (SandboxStatus::MemoryExceeded, 40),
            code => (SandboxStatus::Completed, code),
        };
    }

    if libc::WIFSIGNALED(raw_status) {
        let signal = libc::WTERMSIG(raw_status);
        return match signal {
            libc::SIGXCPU => (SandboxStatus::TimedOut, 124),
            libc::SIGKILL => {
                // SIGKILL without our watchdog: either the CPU hard limit or
                // the kernel OOM killer.
                if cpu_time >= config.cpu_time_limit {
                    (SandboxStatus::TimedOut, 124)
                } else {
                    (SandboxStatus::MemoryExceeded, 137)
                }
            }
            libc::SIGTERM => (SandboxStatus::Killed, 143),
            libc::SIGSEGV | libc::SIGABRT | libc::SIGBUS => (SandboxStatus::Crashed, 128 + signal),
            other => (SandboxStatus::Killed, 128 + other),
        };
    }

    (SandboxStatus::Crashed, -1)
}
