//! Sandboxed project workspace.
//!
//! Every path goes through [`path::resolve`] before it reaches the disk.
//! Mutations are verified and retried by [`SandboxFs`], mirrored into the
//! [`StateStore`], and the [`VirtualConsole`] offers a small shell on top.

pub mod archive;
pub mod console;
pub mod errors;
pub mod fs;
pub mod path;
pub mod retry;
pub mod shell;
pub mod state;
pub mod templates;

pub use console::{ConsoleCommand, ConsoleResponse, VirtualConsole};
pub use errors::{Result, SandboxError};
pub use fs::{FileEntry, SandboxConfig, SandboxFs, UPLOADS_DIR};
pub use path::RelativePath;
pub use retry::RetryPolicy;
pub use shell::{ShellConfig, ShellOutput, ShellRunner};
pub use state::{ProjectState, StateStore};
pub use templates::ProjectTemplate;
