//! Configuration context shared by every descriptor created on a thread.
//!
//! Descriptors hold `Rc` handles and never leave the thread that created
//! them, so the default context is kept per controlling thread. Tests and
//! scripts can override it for a scope with [`Config::install`].

use std::cell::Cell;
use std::env as stdenv;

/// Process-wide switches consulted when a descriptor leaves them unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Fail with [`crate::Error::NonZero`] whenever a process exits nonzero.
    pub always_raise: bool,
    /// Pass stdout/stderr through instead of capturing them.
    pub always_stream: bool,
    /// Render descriptors in `Debug` output by running them and showing output.
    pub interactive: bool,
}

thread_local! {
    static CURRENT: Cell<Config> = Cell::new(Config::from_env());
}

impl Config {
    /// Read the defaults from `PIPE_COMMANDS_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            always_raise: env_flag("PIPE_COMMANDS_ALWAYS_RAISE"),
            always_stream: env_flag("PIPE_COMMANDS_ALWAYS_STREAM"),
            interactive: env_flag("PIPE_COMMANDS_INTERACTIVE"),
        }
    }

    /// The default context of the current thread.
    pub fn current() -> Self {
        CURRENT.with(|c| c.get())
    }

    /// Replace the default context of the current thread.
    pub fn set_current(config: Config) {
        CURRENT.with(|c| c.set(config));
    }

    /// Make `self` the default until the returned guard is dropped.
    pub fn install(self) -> ConfigGuard {
        let previous = Config::current();
        Config::set_current(self);
        ConfigGuard { previous }
    }

    /// Fail on nonzero return codes unless a descriptor says otherwise.
    pub fn with_always_raise(mut self, value: bool) -> Self {
        self.always_raise = value;
        self
    }

    /// Pass output through unless a descriptor says otherwise.
    pub fn with_always_stream(mut self, value: bool) -> Self {
        self.always_stream = value;
        self
    }

    /// Make debug formatting evaluate and show the output.
    pub fn with_interactive(mut self, value: bool) -> Self {
        self.interactive = value;
        self
    }
}

/// Restores the previous default context on drop.
#[must_use = "the override is undone as soon as the guard is dropped"]
pub struct ConfigGuard {
    previous: Config,
}

impl Drop for ConfigGuard {
    fn drop(&mut self) {
        Config::set_current(self.previous);
    }
}

/// Set the default raise-policy.
pub fn set_always_raise(value: bool) {
    Config::set_current(Config::current().with_always_raise(value));
}

/// Set the default stream-vs-capture policy.
pub fn set_always_stream(value: bool) {
    Config::set_current(Config::current().with_always_stream(value));
}

/// Set the interactive echo display mode.
pub fn set_interactive(value: bool) {
    Config::set_current(Config::current().with_interactive(value));
}

fn env_flag(key: &str) -> bool {
    match stdenv::var(key) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
