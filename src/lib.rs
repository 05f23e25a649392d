//! Compose and run external processes with pipes, redirection and
//! background jobs.
//!
//! A [`Command`] describes a command line without running it. Descriptors
//! are combined with `|`, customized with builder methods and evaluated
//! lazily: the process runs when its results are first looked at.
//!
//! ```
//! use pipe_commands::Command;
//!
//! let echo = Command::new("echo");
//! let grep = Command::new("grep");
//!
//! let chain = echo.arg("aaa\nbbb") | grep.arg("bbb");
//! assert_eq!(chain.to_string(), "bbb\n");
//! assert!(chain.success()?);
//! # Ok::<(), pipe_commands::Error>(())
//! ```
//!
//! The [`command`] module documents the descriptor itself, [`pipe`] the
//! operand kinds `|` accepts, [`jobs`] the registry of background
//! processes and [`env`] the working directory and environment helpers.

mod args;
pub mod command;
pub mod config;
mod data;
pub mod env;
mod error;
mod external;
mod io_adapters;
pub mod jobs;
pub mod pipe;
mod process;

pub use args::FlagValue;
pub use command::{Command, ExitCode, Lines, Words};
pub use config::Config;
pub use data::{Codec, Data};
pub use error::{Error, Result};
pub use external::{find_command_path, lookup};
pub use io_adapters::{Feed, Input};
pub use pipe::{Args, Callback, Conversation, Coroutine, PipeTarget, Step, Yielding, map_lines};
pub use process::Session;

/// Re-exported so callers can name signals without depending on `nix`.
pub use nix::sys::signal::Signal;
