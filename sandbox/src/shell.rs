use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::errors::{Result, SandboxError};

const TRUNCATION_MARKER: &str = "\n... output truncated";
const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Debug)]
pub struct ShellConfig {
    program: String,
    python: String,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ShellConfig {
    pub fn new(program: impl Into<String>, timeout: Duration, max_output_bytes: usize) -> Result<Self> {
        let program = program.into().trim().to_string();
        if program.is_empty() {
            return Err(SandboxError::InvalidOperation(
                "shell program must not be empty".to_string(),
            ));
        }
        if timeout.is_zero() {
            return Err(SandboxError::InvalidOperation(
                "shell timeout must be greater than zero".to_string(),
            ));
        }
        if max_output_bytes == 0 {
            return Err(SandboxError::InvalidOperation(
                "max_output_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            program,
            python: default_python().to_string(),
            timeout,
            max_output_bytes,
        })
    }

    /// `cmd.exe` on Windows, `/bin/sh` elsewhere.
    pub fn platform_default() -> Self {
        let program = if cfg!(windows) { "cmd.exe" } else { "/bin/sh" };
        Self {
            program: program.to_string(),
            python: default_python().to_string(),
            timeout: Duration::from_secs(30),
            max_output_bytes: 1024 * 1024,
        }
    }

    /// Interpreter used for `run_python` and `pip_install`.
    pub fn with_python(mut self, python: impl Into<String>) -> Result<Self> {
        let python = python.into().trim().to_string();
        if python.is_empty() {
            return Err(SandboxError::InvalidOperation(
                "python program must not be empty".to_string(),
            ));
        }
        self.python = python;
        Ok(self)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    fn command_flag(&self) -> &'static str {
        let lower = self.program.to_ascii_lowercase();
        if lower.ends_with("cmd.exe") || lower.ends_with("cmd") {
            "/C"
        } else {
            "-c"
        }
    }
}

fn default_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

#[derive(Clone, Debug)]
pub struct ShellRunner {
    config: ShellConfig,
}

#[derive(Debug)]
pub struct ShellOutput {
    pub exit_code: Option<i32>,
    /// Standard output followed by standard error, trimmed.
    pub output: String,
    pub truncated: bool,
    pub duration: Duration,
}

impl ShellRunner {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Runs `command_line` through the configured shell inside `working_dir`.
    /// The child is killed when the timeout elapses.
    #[instrument(skip(self), fields(program = %self.config.program))]
    pub async fn execute(&self, command_line: &str, working_dir: &Path) -> Result<ShellOutput> {
        let mut command = Command::new(&self.config.program);
        command.arg(self.config.command_flag());
        command.arg(command_line);
        self.run(command, &self.config.program, working_dir).await
    }

    /// Runs `program` directly with `args`, without a shell in between.
    #[instrument(skip(self, args))]
    pub async fn execute_program(
        &self,
        program: &str,
        args: &[&str],
        working_dir: &Path,
    ) -> Result<ShellOutput> {
        let mut command = Command::new(program);
        command.args(args);
        self.run(command, program, working_dir).await
    }

    async fn run(
        &self,
        mut command: Command,
        program: &str,
        working_dir: &Path,
    ) -> Result<ShellOutput> {
        command.current_dir(working_dir);
        command.kill_on_drop(true);
        command.stdin(Stdio::null());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| SandboxError::Spawn {
            program: program.to_string(),
            source,
        })?;

        let start = Instant::now();
        let max = self.config.max_output_bytes;
        let outcome = timeout(self.config.timeout, async {
            let captured = capture_output(&mut child, max).await?;
            let status = child.wait().await?;
            Ok::<_, io::Error>((captured, status))
        })
        .await;
        let (captured, status) = match outcome {
            Ok(result) => result.map_err(|err| SandboxError::io(working_dir, err))?,
            Err(_) => {
                if let Err(err) = child.start_kill() {
                    warn!(%err, "failed to kill timed out child");
                }
                return Err(SandboxError::Timeout(self.config.timeout));
            }
        };
        let duration = start.elapsed();

        let mut merged = captured.stdout;
        merged.extend_from_slice(&captured.stderr);
        let truncated = captured.capped || merged.len() > max;
        if truncated {
            merged.truncate(max);
        }
        let mut text = String::from_utf8_lossy(&merged).trim().to_string();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        debug!(exit_code = ?status.code(), ?duration, truncated, "command finished");

        Ok(ShellOutput {
            exit_code: status.code(),
            output: text,
            truncated,
            duration,
        })
    }
}

struct Captured {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    capped: bool,
}

enum Chunk {
    Stdout(usize),
    Stderr(usize),
}

/// Drains both pipes until they close. Once more than `max` bytes have
/// arrived the child is killed and reading stops.
async fn capture_output(child: &mut Child, max: usize) -> io::Result<Captured> {
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut captured = Captured {
        stdout: Vec::new(),
        stderr: Vec::new(),
        capped: false,
    };
    let mut out_buf = [0u8; READ_CHUNK];
    let mut err_buf = [0u8; READ_CHUNK];

    while stdout.is_some() || stderr.is_some() {
        let chunk = tokio::select! {
            read = read_some(stdout.as_mut(), &mut out_buf) => Chunk::Stdout(read?),
            read = read_some(stderr.as_mut(), &mut err_buf) => Chunk::Stderr(read?),
        };
        match chunk {
            Chunk::Stdout(0) => stdout = None,
            Chunk::Stderr(0) => stderr = None,
            Chunk::Stdout(n) => captured.stdout.extend_from_slice(&out_buf[..n]),
            Chunk::Stderr(n) => captured.stderr.extend_from_slice(&err_buf[..n]),
        }
        if captured.stdout.len() + captured.stderr.len() > max {
            captured.capped = true;
            child.start_kill()?;
            break;
        }
    }
    Ok(captured)
}

async fn read_some<R>(reader: Option<&mut R>, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    match reader {
        Some(reader) => reader.read(buf).await,
        None => std::future::pending().await,
    }
}
