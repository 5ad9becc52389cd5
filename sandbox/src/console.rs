//! Shell-like command interpreter over the sandbox.
//!
//! Each [`VirtualConsole`] is one session with its own working directory.
//! Bad arguments produce a normal response carrying an error message; only
//! sandbox violations and spawn failures come back as `Err`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, instrument};

use crate::errors::{Result, SandboxError};
use crate::fs::{blocking, SandboxFs};
use crate::path::RelativePath;
use crate::shell::{ShellOutput, ShellRunner};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleCommand {
    Cd(String),
    List,
    Pwd,
    Echo(Vec<String>),
    Cat(Option<String>),
    Mkdir(Option<String>),
    Touch(Option<String>),
    /// Anything unrecognised, passed to the real shell untouched.
    Shell(String),
    Empty,
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        let mut tokens = line.split_whitespace();
        let name = match tokens.next() {
            Some(name) => name.to_lowercase(),
            None => return ConsoleCommand::Empty,
        };
        let first = tokens.clone().next().map(str::to_string);
        match name.as_str() {
            "cd" => ConsoleCommand::Cd(first.unwrap_or_else(|| ".".to_string())),
            "ls" => ConsoleCommand::List,
            "dir" if cfg!(windows) => ConsoleCommand::List,
            "pwd" => ConsoleCommand::Pwd,
            "echo" => ConsoleCommand::Echo(tokens.map(str::to_string).collect()),
            "cat" | "type" => ConsoleCommand::Cat(first),
            "mkdir" => ConsoleCommand::Mkdir(first),
            "touch" | "echo." => ConsoleCommand::Touch(first),
            _ => ConsoleCommand::Shell(line.trim().to_string()),
        }
    }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct ConsoleResponse {
    pub result: String,
    /// Sandbox-relative working directory after the command, `.` for the root.
    pub cwd: String,
}

#[derive(Debug)]
pub struct VirtualConsole {
    fs: SandboxFs,
    shell: ShellRunner,
    cwd: Mutex<PathBuf>,
}

impl VirtualConsole {
    pub fn new(fs: SandboxFs, shell: ShellRunner) -> Self {
        let cwd = Mutex::new(fs.base_dir().to_path_buf());
        Self { fs, shell, cwd }
    }

    /// Absolute working directory of this session.
    pub fn current_directory(&self) -> PathBuf {
        self.cwd.lock().clone()
    }

    pub fn relative_cwd(&self) -> RelativePath {
        let cwd = self.current_directory();
        self.fs.relative(&cwd).unwrap_or_default()
    }

    #[instrument(skip(self))]
    pub async fn execute(&self, command_line: &str) -> Result<ConsoleResponse> {
        let result = match ConsoleCommand::parse(command_line) {
            ConsoleCommand::Cd(dir) => self.cd(&dir).await?,
            ConsoleCommand::List => self.ls().await?,
            ConsoleCommand::Pwd => self.current_directory().display().to_string(),
            ConsoleCommand::Echo(args) => args.join(" "),
            ConsoleCommand::Cat(file) => self.cat(file.as_deref()).await?,
            ConsoleCommand::Mkdir(dir) => self.mkdir(dir.as_deref()).await?,
            ConsoleCommand::Touch(file) => self.touch(file.as_deref()).await?,
            ConsoleCommand::Shell(line) => self.run_shell(&line).await?,
            ConsoleCommand::Empty => String::new(),
        };
        Ok(self.respond(result))
    }

    fn respond(&self, result: String) -> ConsoleResponse {
        ConsoleResponse {
            result,
            cwd: self.relative_cwd().display_or_dot().to_string(),
        }
    }

    /// Resolves `arg` against the session cwd; a leading separator means the root.
    async fn resolve_arg(&self, arg: &str) -> Result<PathBuf> {
        let normalized = arg.replace('\\', "/");
        let joined = if normalized.starts_with('/') {
            normalized
        } else {
            format!("{}/{}", self.relative_cwd().as_str(), normalized)
        };
        let base = self.fs.base_dir().to_path_buf();
        blocking(move || crate::path::resolve(&base, &joined)).await
    }

    async fn cd(&self, dir: &str) -> Result<String> {
        let target = self.resolve_arg(dir).await?;
        let candidate = target.clone();
        let is_dir = blocking(move || Ok(candidate.is_dir())).await?;
        if !is_dir {
            return Ok(format!("Directory not found or access denied: {dir}"));
        }
        *self.cwd.lock() = target;
        let rel = self.relative_cwd();
        info!(cwd = %rel, "changed directory");
        Ok(format!("Changed directory to: {}", rel.display_or_dot()))
    }

    async fn ls(&self) -> Result<String> {
        let cwd = self.current_directory();
        let listing = blocking(move || {
            let mut names = Vec::new();
            let entries = match fs::read_dir(&cwd) {
                Ok(entries) => entries,
                Err(err) => return Ok(Err(err.to_string())),
            };
            for entry in entries.flatten() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
            names.sort();
            Ok(Ok(names.join("\n")))
        })
        .await?;
        Ok(listing.unwrap_or_else(|err| format!("Error listing directory: {err}")))
    }

    async fn cat(&self, file: Option<&str>) -> Result<String> {
        let Some(file) = file else {
            return Ok("Error reading file: missing file operand".to_string());
        };
        let target = self.resolve_arg(file).await?;
        let name = file.to_string();
        let max = self.fs.max_file_size();
        blocking(move || {
            if target.is_dir() {
                return Ok(format!("Error reading file: {name}: Is a directory"));
            }
            if let Ok(meta) = fs::metadata(&target) {
                if meta.len() > max {
                    return Ok(format!(
                        "Error reading file: {name}: File too large ({} bytes, limit {max})",
                        meta.len()
                    ));
                }
            }
            match fs::read(&target) {
                Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Ok(format!("Error reading file: {name}: No such file or directory"))
                }
                Err(err) => Ok(format!("Error reading file: {name}: {err}")),
            }
        })
        .await
    }

    async fn mkdir(&self, dir: Option<&str>) -> Result<String> {
        let Some(dir) = dir else {
            return Ok("Error creating directory: missing operand".to_string());
        };
        let target = self.resolve_arg(dir).await?;
        let rel = self.fs.relative(&target)?;
        Ok(match self.fs.create_folder(rel.as_str()).await {
            Ok(_) => format!("Directory created: {dir}"),
            Err(err @ SandboxError::OutsideRoot { .. }) => return Err(err),
            Err(err) => format!("Error creating directory: {err}"),
        })
    }

    async fn touch(&self, file: Option<&str>) -> Result<String> {
        let Some(file) = file else {
            return Ok("Error touching file: missing file operand".to_string());
        };
        let target = self.resolve_arg(file).await?;
        let candidate = target.clone();
        let exists = blocking(move || Ok(candidate.exists())).await?;
        let outcome = if exists {
            blocking(move || touch_existing(&target)).await
        } else {
            let rel = self.fs.relative(&target)?;
            self.fs.create_file(rel.as_str(), b"").await.map(|_| ())
        };
        Ok(match outcome {
            Ok(()) => format!("File touched: {file}"),
            Err(err @ SandboxError::OutsideRoot { .. }) => return Err(err),
            Err(err) => format!("Error touching file: {err}"),
        })
    }

    async fn run_shell(&self, line: &str) -> Result<String> {
        let cwd = self.current_directory();
        match self.shell.execute(line, &cwd).await {
            Ok(output) => Ok(output.output),
            Err(SandboxError::Timeout(limit)) => Ok(timed_out(limit)),
            Err(err) => Err(err),
        }
    }

    /// Runs `code` with the configured Python interpreter in the session cwd.
    #[instrument(skip(self, code))]
    pub async fn run_python(&self, code: &str) -> Result<ConsoleResponse> {
        let result = match self.run_python_args(&["-c", code]).await? {
            Ok(output) => output.output,
            Err(message) => message,
        };
        Ok(self.respond(result))
    }

    /// Installs whitespace-separated packages through `python -m pip`.
    #[instrument(skip(self))]
    pub async fn pip_install(&self, packages: &str) -> Result<ConsoleResponse> {
        let names: Vec<&str> = packages.split_whitespace().collect();
        if names.is_empty() {
            return Ok(self.respond("Error: no packages given".to_string()));
        }
        let mut args = vec!["-m", "pip", "install"];
        args.extend(names);
        let result = match self.run_python_args(&args).await? {
            Ok(output) if output.exit_code == Some(0) => output.output,
            Ok(output) => format!("Error: {}", output.output),
            Err(message) => message,
        };
        info!(packages, "pip install finished");
        Ok(self.respond(result))
    }

    /// Outer error is a fault; inner error is a message for the caller.
    async fn run_python_args(
        &self,
        args: &[&str],
    ) -> Result<std::result::Result<ShellOutput, String>> {
        let python = self.shell.config().python().to_string();
        let cwd = self.current_directory();
        match self.shell.execute_program(&python, args, &cwd).await {
            Ok(output) => Ok(Ok(output)),
            Err(SandboxError::Spawn { program, source }) => Ok(Err(format!(
                "Error: Python executable not found: {program}: {source}"
            ))),
            Err(SandboxError::Timeout(limit)) => Ok(Err(timed_out(limit))),
            Err(err) => Err(err),
        }
    }
}

fn timed_out(limit: Duration) -> String {
    format!(
        "Command timed out after {:.1}s and was terminated",
        limit.as_secs_f64()
    )
}

fn touch_existing(target: &Path) -> Result<()> {
    let handle = if target.is_dir() {
        fs::File::open(target)
    } else {
        fs::OpenOptions::new().write(true).open(target)
    };
    handle
        .and_then(|file| file.set_modified(SystemTime::now()))
        .map_err(|err| SandboxError::io(target, err))
}
