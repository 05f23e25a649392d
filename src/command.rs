//! The command descriptor: a lazy, composable description of one external
//! command, its configuration and (once evaluated) its result.

use crate::args::{self, FlagValue};
use crate::config::Config;
use crate::data::{Codec, Data};
use crate::error::{Error, Result};
use crate::io_adapters::{Drain, Input};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout};
use std::rc::Rc;
use std::thread::JoinHandle;

/// Conventional process exit code type used by this crate.
///
/// A value of 0 indicates success; a process killed by a signal reports
/// `128 + signo`, like POSIX shells do.
pub type ExitCode = i32;

/// Per-descriptor overrides. `None` defers to the parent on customization
/// and to the configuration context at evaluation time.
#[derive(Debug, Clone, Default)]
pub(crate) struct Options {
    pub(crate) text: Option<bool>,
    pub(crate) codec: Option<Codec>,
    pub(crate) stream_stdout: Option<bool>,
    pub(crate) stream_stderr: Option<bool>,
    pub(crate) raise: Option<bool>,
}

impl Options {
    fn merged_over(&self, parent: &Options) -> Options {
        Options {
            text: self.text.or(parent.text),
            codec: self.codec.or(parent.codec),
            stream_stdout: self.stream_stdout.or(parent.stream_stdout),
            stream_stderr: self.stream_stderr.or(parent.stream_stderr),
            raise: self.raise.or(parent.raise),
        }
    }
}

pub(crate) struct State {
    pub(crate) argv: Vec<String>,
    pub(crate) input: Input,
    pub(crate) options: Options,
    pub(crate) lazy: bool,
    pub(crate) config: Option<Config>,

    pub(crate) child: Option<Child>,
    pub(crate) stdout: Option<Vec<u8>>,
    pub(crate) stderr: Option<Vec<u8>>,
    pub(crate) returncode: Option<ExitCode>,
    pub(crate) input_closed: bool,
    /// Whether stdout ends up in `stdout` (false when passed through or
    /// handed to a downstream process).
    pub(crate) stdout_captured: bool,
    pub(crate) stderr_captured: bool,
    /// Output already handed out by live iteration, prepended on collect.
    pub(crate) stdout_seen: Vec<u8>,
    /// Readers draining the output pipes of the running process.
    pub(crate) drain: Option<Drain>,
    /// Helper thread writing the input, joined on wait.
    pub(crate) feeder: Option<JoinHandle<()>>,
}

impl State {
    fn new(argv: Vec<String>, lazy: bool) -> Self {
        Self {
            argv,
            input: Input::None,
            options: Options::default(),
            lazy,
            config: None,
            child: None,
            stdout: None,
            stderr: None,
            returncode: None,
            input_closed: false,
            stdout_captured: false,
            stderr_captured: false,
            stdout_seen: Vec::new(),
            drain: None,
            feeder: None,
        }
    }

    pub(crate) fn config(&self) -> Config {
        self.config.unwrap_or_else(Config::current)
    }

    pub(crate) fn text(&self) -> bool {
        self.options.text.unwrap_or(true)
    }

    pub(crate) fn codec(&self) -> Codec {
        self.options.codec.unwrap_or_default()
    }

    pub(crate) fn streams_stdout(&self) -> bool {
        self.options
            .stream_stdout
            .unwrap_or_else(|| self.config().always_stream)
    }

    pub(crate) fn streams_stderr(&self) -> bool {
        self.options
            .stream_stderr
            .unwrap_or_else(|| self.config().always_stream)
    }

    pub(crate) fn raises(&self) -> bool {
        self.options
            .raise
            .unwrap_or_else(|| self.config().always_raise)
    }

    pub(crate) fn view(&self, bytes: &Option<Vec<u8>>) -> Result<Option<Data>> {
        bytes
            .as_deref()
            .map(|b| self.codec().view(b, self.text()))
            .transpose()
    }

    pub(crate) fn lossy_view(&self, bytes: &Option<Vec<u8>>) -> Option<Data> {
        bytes.as_deref().map(|b| {
            if self.text() {
                Data::Text(self.codec().decode_lossy(b))
            } else {
                Data::Bytes(b.to_vec())
            }
        })
    }
}

impl Drop for State {
    fn drop(&mut self) {
        if let Some(child) = &self.child {
            tracing::warn!(
                pid = child.id(),
                argv = ?self.argv,
                "descriptor dropped while its process was never waited"
            );
        }
    }
}

/// A lazy, composable description of an external command.
///
/// Cloning a `Command` yields another handle to the same descriptor. Every
/// customization (adding arguments, changing options, piping input into
/// it) produces a new descriptor instead, so templates such as
/// `let git = Command::new("git")` can be reused freely.
///
/// Fresh descriptors are not lazy: every result access runs the command
/// again. Customized descriptors are lazy and run at most once; afterwards
/// their results are cached.
#[derive(Clone)]
pub struct Command {
    pub(crate) state: Rc<RefCell<State>>,
}

impl Command {
    /// Descriptor for a single program, resolved through `PATH` at spawn time.
    pub fn new(program: impl ToString) -> Self {
        Self::from_tokens([program])
    }

    /// Descriptor from a list of tokens. Each token is stringified and
    /// glob-expanded.
    pub fn from_tokens<I, T>(tokens: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let argv = tokens
            .into_iter()
            .flat_map(|t| args::expand_token(&t.to_string()))
            .collect();
        Self::from_state(State::new(argv, false))
    }

    pub(crate) fn from_state(state: State) -> Self {
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Derive a new lazy descriptor, carrying forward argv, input,
    /// overrides and configuration.
    pub(crate) fn customize(&self, f: impl FnOnce(&mut State)) -> Command {
        let parent = self.state.borrow();
        let mut state = State::new(parent.argv.clone(), true);
        state.input = parent.input.clone();
        state.options = parent.options.clone();
        state.config = parent.config;
        drop(parent);
        f(&mut state);
        Self::from_state(state)
    }

    fn customize_options(&self, options: Options) -> Command {
        self.customize(|s| s.options = options.merged_over(&s.options))
    }

    /// Append a positional token (glob-expanded).
    pub fn arg(&self, token: impl ToString) -> Command {
        self.args([token])
    }

    /// Append positional tokens (each glob-expanded).
    pub fn args<I, T>(&self, tokens: I) -> Command
    where
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let tokens: Vec<String> = tokens
            .into_iter()
            .flat_map(|t| args::expand_token(&t.to_string()))
            .collect();
        self.customize(|s| s.argv.extend(tokens))
    }

    /// Append a keyword option, e.g. `flag("max_count", 3)` → `--max-count=3`.
    pub fn flag(&self, name: &str, value: impl Into<FlagValue>) -> Command {
        let tokens = args::flag_tokens(name, value.into());
        self.customize(|s| s.argv.extend(tokens))
    }

    /// Append `-x` for a single character, `--name` otherwise.
    ///
    /// Also available as `cmd - "l"`.
    pub fn switch(&self, name: &str) -> Command {
        let token = args::switch_token(name);
        self.customize(|s| s.argv.push(token))
    }

    /// Fluent subcommand: `git.sub("status")` is `git status`.
    ///
    /// Unlike other customizations the result is not lazy, so it behaves
    /// like a fresh template.
    pub fn sub(&self, name: &str) -> Command {
        let cmd = self.customize(|s| {
            s.argv.push(name.to_string());
            s.input = Input::None;
        });
        cmd.state.borrow_mut().lazy = false;
        cmd
    }

    /// Replace the input source.
    pub fn with_stdin(&self, input: impl Into<Input>) -> Command {
        let input = input.into();
        self.customize(|s| s.input = input)
    }

    /// Stream `path` into the process during feeding.
    pub fn read_from(&self, path: impl AsRef<Path>) -> Command {
        self.with_stdin(Input::file(path.as_ref()))
    }

    /// Inject an explicit configuration context.
    pub fn with_config(&self, config: Config) -> Command {
        self.customize(|s| s.config = Some(config))
    }

    /// Text mode (`true`, the default) or binary mode.
    pub fn text(&self, text: bool) -> Command {
        self.customize_options(Options {
            text: Some(text),
            ..Default::default()
        })
    }

    /// Binary mode: results are raw bytes and literal input is written as is.
    pub fn binary(&self) -> Command {
        self.text(false)
    }

    /// Use `codec` to convert between text and bytes.
    pub fn codec(&self, codec: Codec) -> Command {
        self.customize_options(Options {
            codec: Some(codec),
            ..Default::default()
        })
    }

    /// Use the encoding named by `label` for text conversion.
    pub fn encoding(&self, label: &str) -> Result<Command> {
        Ok(self.codec(Codec::for_label(label)?))
    }

    /// Pass both streams through (`true`) or capture both (`false`).
    pub fn stream(&self, stream: bool) -> Command {
        self.customize_options(Options {
            stream_stdout: Some(stream),
            stream_stderr: Some(stream),
            ..Default::default()
        })
    }

    /// Shorthand for `stream(true)`.
    pub fn streaming(&self) -> Command {
        self.stream(true)
    }

    /// Pass stdout through to the controlling process instead of capturing it.
    pub fn stream_stdout(&self, stream: bool) -> Command {
        self.customize_options(Options {
            stream_stdout: Some(stream),
            ..Default::default()
        })
    }

    /// Pass stderr through to the controlling process instead of capturing it.
    pub fn stream_stderr(&self, stream: bool) -> Command {
        self.customize_options(Options {
            stream_stderr: Some(stream),
            ..Default::default()
        })
    }

    /// Per-descriptor raise-policy override.
    pub fn raise_on_nonzero(&self, raise: bool) -> Command {
        self.customize_options(Options {
            raise: Some(raise),
            ..Default::default()
        })
    }

    /// Always fail on a nonzero return code.
    pub fn raising(&self) -> Command {
        self.raise_on_nonzero(true)
    }

    /// Never fail on a nonzero return code.
    pub fn quiet(&self) -> Command {
        self.raise_on_nonzero(false)
    }

    /// A lazy copy: it runs at most once and keeps its results.
    pub fn lazy(&self) -> Command {
        self.customize(|_| {})
    }

    /// Zero-argument call: derive a lazy copy and run it now.
    pub fn run(&self) -> Result<Command> {
        let cmd = self.lazy();
        cmd.evaluate()?;
        Ok(cmd)
    }

    /// Program and arguments, after glob expansion.
    pub fn argv(&self) -> Vec<String> {
        self.state.borrow().argv.clone()
    }

    /// Where stdin comes from.
    pub fn input(&self) -> Input {
        self.state.borrow().input.clone()
    }

    /// Lazy descriptors run at most once and cache their results.
    pub fn is_lazy(&self) -> bool {
        self.state.borrow().lazy
    }

    /// Effective text mode.
    pub fn is_text(&self) -> bool {
        self.state.borrow().text()
    }

    /// Whether stdout is passed through, taking the configuration into account.
    pub fn streams_stdout(&self) -> bool {
        self.state.borrow().streams_stdout()
    }

    /// Whether stderr is passed through, taking the configuration into account.
    pub fn streams_stderr(&self) -> bool {
        self.state.borrow().streams_stderr()
    }

    /// Effective raise-policy.
    pub fn raises(&self) -> bool {
        self.state.borrow().raises()
    }

    /// True once a result has been recorded and no process is outstanding.
    pub fn is_finished(&self) -> bool {
        let st = self.state.borrow();
        st.returncode.is_some() && st.child.is_none()
    }

    fn is_cached(&self) -> bool {
        self.is_lazy() && self.is_finished()
    }

    /// Evaluate and return the exit code.
    pub fn returncode(&self) -> Result<ExitCode> {
        self.evaluate()?;
        Ok(self.state.borrow().returncode.unwrap_or(-1))
    }

    /// Captured stdout; `None` when it was passed through.
    pub fn stdout(&self) -> Result<Option<Data>> {
        self.evaluate()?;
        let st = self.state.borrow();
        st.view(&st.stdout)
    }

    /// Captured stderr; `None` when it was passed through.
    pub fn stderr(&self) -> Result<Option<Data>> {
        self.evaluate()?;
        let st = self.state.borrow();
        st.view(&st.stderr)
    }

    /// Stdout decoded as text regardless of mode, replacing malformed input.
    pub fn output(&self) -> Result<String> {
        self.evaluate()?;
        let st = self.state.borrow();
        Ok(st
            .stdout
            .as_deref()
            .map(|b| st.codec().decode_lossy(b))
            .unwrap_or_default())
    }

    /// True iff the return code is zero.
    pub fn success(&self) -> Result<bool> {
        Ok(self.returncode()? == 0)
    }

    /// Evaluate and fail if the return code is nonzero, whatever the
    /// raise-policy says.
    pub fn raise_for_returncode(&self) -> Result<()> {
        self.evaluate()?;
        self.nonzero_error().map_or(Ok(()), Err)
    }

    pub(crate) fn nonzero_error(&self) -> Option<Error> {
        let st = self.state.borrow();
        match st.returncode {
            Some(code) if code != 0 => Some(Error::NonZero {
                argv: st.argv.clone(),
                returncode: code,
                stdout: st.lossy_view(&st.stdout),
                stderr: st.lossy_view(&st.stderr),
            }),
            _ => None,
        }
    }

    /// Output lines, terminators included.
    ///
    /// A finished lazy descriptor replays its captured output. Otherwise the
    /// process is started in the background and lines are read as they
    /// arrive; the process is waited on once the output is exhausted.
    pub fn lines(&self) -> Lines {
        self.lines_as(self.is_text())
    }

    pub(crate) fn lines_as(&self, text: bool) -> Lines {
        Lines::new(self.clone(), text)
    }

    /// Whitespace separated words of the output.
    pub fn words(&self) -> Words {
        Words {
            lines: self.lines(),
            pending: VecDeque::new(),
        }
    }

    /// Parse tabular output: the first line names the columns, every other
    /// line is split into at most that many fields.
    pub fn as_table(&self) -> Result<Vec<BTreeMap<String, String>>> {
        let text = self.output()?;
        let mut lines = text.lines();
        let Some(header) = lines.next() else {
            return Ok(Vec::new());
        };
        let fields: Vec<&str> = header.split_whitespace().collect();
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        Ok(lines
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                fields
                    .iter()
                    .map(|f| f.to_string())
                    .zip(split_max(line, fields.len()))
                    .collect()
            })
            .collect())
    }

    /// Truncate `path` and write the output into it.
    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path.as_ref())?;
        self.write_into(&mut file)
    }

    /// Append the output to `path`, creating it if needed.
    pub fn append_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path.as_ref())?;
        self.write_into(&mut file)
    }

    /// Write the raw output bytes into any sink.
    ///
    /// An unevaluated descriptor is drained line by line as it runs.
    pub fn write_into<W: Write + ?Sized>(&self, sink: &mut W) -> Result<()> {
        if self.is_cached() {
            if let Some(out) = &self.state.borrow().stdout {
                sink.write_all(out)?;
            }
        } else {
            for line in self.lines_as(false) {
                sink.write_all(line?.as_bytes())?;
            }
        }
        sink.flush()?;
        Ok(())
    }
}

/// Split on whitespace into at most `n` fields, the last one keeping the rest.
fn split_max(line: &str, n: usize) -> Vec<String> {
    let mut fields = Vec::with_capacity(n);
    let mut rest = line.trim();
    while !rest.is_empty() {
        if fields.len() + 1 == n {
            fields.push(rest.to_string());
            break;
        }
        match rest.find(char::is_whitespace) {
            Some(idx) => {
                fields.push(rest[..idx].to_string());
                rest = rest[idx..].trim_start();
            }
            None => {
                fields.push(rest.to_string());
                break;
            }
        }
    }
    fields
}

enum LineSource {
    Pending,
    Replay(std::vec::IntoIter<Data>),
    Live(BufReader<ChildStdout>),
    Done,
}

/// Iterator over output lines. See [`Command::lines`].
pub struct Lines {
    command: Command,
    text: bool,
    source: LineSource,
    seen: Vec<u8>,
}

impl Lines {
    fn new(command: Command, text: bool) -> Self {
        Self {
            command,
            text,
            source: LineSource::Pending,
            seen: Vec::new(),
        }
    }

    fn open(&mut self) -> Result<()> {
        if self.command.is_cached() {
            return self.replay();
        }
        self.command.start(false, false)?;
        let stdout = self.command.take_stdout();
        self.command.drain_output();
        self.command.feed()?;
        match stdout {
            Some(out) => self.source = LineSource::Live(BufReader::new(out)),
            None => {
                // Already drained elsewhere, e.g. a background job.
                self.command.wait(None)?;
                self.replay()?;
            }
        }
        Ok(())
    }

    fn replay(&mut self) -> Result<()> {
        let st = self.command.state.borrow();
        let replay = match &st.stdout {
            Some(out) => st.codec().view(out, self.text)?.split_lines(),
            None => Vec::new(),
        };
        drop(st);
        self.source = LineSource::Replay(replay.into_iter());
        Ok(())
    }

    fn finish(&mut self) -> Option<Result<Data>> {
        self.source = LineSource::Done;
        self.command
            .state
            .borrow_mut()
            .stdout_seen
            .append(&mut self.seen);
        self.command.wait(None).err().map(Err)
    }
}

impl Iterator for Lines {
    type Item = Result<Data>;

    fn next(&mut self) -> Option<Self::Item> {
        if matches!(self.source, LineSource::Pending) {
            if let Err(e) = self.open() {
                self.source = LineSource::Done;
                return Some(Err(e));
            }
        }
        match &mut self.source {
            LineSource::Pending | LineSource::Done => None,
            LineSource::Replay(lines) => lines.next().map(Ok),
            LineSource::Live(reader) => {
                let mut buf = Vec::new();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => self.finish(),
                    Ok(_) => {
                        self.seen.extend_from_slice(&buf);
                        let codec = self.command.state.borrow().codec();
                        Some(codec.view(&buf, self.text))
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reading live output failed");
                        let _ = self.finish();
                        Some(Err(e.into()))
                    }
                }
            }
        }
    }
}

/// Iterator over whitespace separated words. See [`Command::words`].
pub struct Words {
    lines: Lines,
    pending: VecDeque<String>,
}

impl Iterator for Words {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(word) = self.pending.pop_front() {
                return Some(Ok(word));
            }
            match self.lines.next()? {
                Ok(line) => self.pending.extend(
                    line.to_string_lossy()
                        .split_whitespace()
                        .map(str::to_string),
                ),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl fmt::Display for Command {
    /// The decoded standard output. A failing evaluation still shows the
    /// output carried by the error.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.output() {
            Ok(text) => f.write_str(&text),
            Err(Error::NonZero {
                stdout: Some(out), ..
            }) => f.write_str(&out.to_string_lossy()),
            Err(e) => write!(f, "<{e}>"),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let interactive = self.state.borrow().config().interactive;
        if interactive {
            if let Err(e) = self.evaluate() {
                return write!(f, "<{e}>");
            }
            let st = self.state.borrow();
            let codec = st.codec();
            for stream in [&st.stdout, &st.stderr].into_iter().flatten() {
                f.write_str(&codec.decode_lossy(stream))?;
            }
            return Ok(());
        }

        let st = self.state.borrow();
        write!(f, "Command({:?}", st.argv)?;
        if !st.input.is_none() {
            write!(f, ", stdin={:?}", st.input)?;
        }
        if let Some(code) = st.returncode {
            write!(f, ", returncode={code}")?;
            if let Some(out) = st.lossy_view(&st.stdout) {
                write!(f, ", stdout={:?}", out.to_string_lossy())?;
            }
            if let Some(err) = st.lossy_view(&st.stderr).filter(|e| !e.is_empty()) {
                write!(f, ", stderr={:?}", err.to_string_lossy())?;
            }
        }
        f.write_str(")")
    }
}

impl std::ops::Sub<&str> for Command {
    type Output = Command;

    fn sub(self, name: &str) -> Command {
        self.switch(name)
    }
}

impl std::ops::Sub<&str> for &Command {
    type Output = Command;

    fn sub(self, name: &str) -> Command {
        self.switch(name)
    }
}

impl std::ops::Not for Command {
    type Output = Command;

    /// Stream stderr only; applied twice, stream stdout only.
    fn not(self) -> Command {
        if self.streams_stderr() {
            self.customize_options(Options {
                stream_stdout: Some(true),
                stream_stderr: Some(false),
                ..Default::default()
            })
        } else {
            self.customize_options(Options {
                stream_stdout: Some(false),
                stream_stderr: Some(true),
                ..Default::default()
            })
        }
    }
}

impl From<&str> for Command {
    fn from(program: &str) -> Self {
        Command::new(program)
    }
}

impl From<PathBuf> for Command {
    fn from(program: PathBuf) -> Self {
        Command::new(program.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn echo(text: &str) -> Command {
        Command::new("echo").arg(text)
    }

    #[test]
    fn test_no_modify() {
        assert_eq!(Command::new("foo").argv(), vec!["foo"]);
    }

    #[test]
    fn test_converts_to_string() {
        assert_eq!(Command::new(3).argv(), vec!["3"]);
    }

    #[test]
    fn test_glob_in_constructor() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("globtest1")).unwrap();
        File::create(dir.path().join("globtest2")).unwrap();
        let cmd = Command::from_tokens(["ls".to_string(), format!("{}/globtest*", dir.path().display())]);
        let mut names: Vec<String> = cmd.argv()[1..]
            .iter()
            .map(|p| Path::new(p).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["globtest1", "globtest2"]);
    }

    #[test]
    fn test_flags_keep_call_order() {
        let cmd = Command::new("x").flag("key", "value").arg("a");
        assert_eq!(cmd.argv(), vec!["x", "--key=value", "a"]);
        assert_eq!(Command::new("x").flag("key_key", "v").argv(), vec!["x", "--key-key=v"]);
        assert_eq!(Command::new("x").flag("k", "v").argv(), vec!["x", "-k", "v"]);
        assert_eq!(Command::new("x").flag("key", false).argv(), vec!["x", "--no-key"]);
    }

    #[test]
    fn test_switch_and_sub() {
        let ls = Command::new("ls");
        assert_eq!((ls.clone() - "l").argv(), vec!["ls", "-l"]);
        assert_eq!((&ls - "escape").argv(), vec!["ls", "--escape"]);
        let status = Command::new("git").sub("status");
        assert_eq!(status.argv(), vec!["git", "status"]);
        assert!(!status.is_lazy());
    }

    #[test]
    fn test_customization_is_lazy_and_copies() {
        let base = Command::new("echo");
        let derived = base.arg("hi");
        assert!(!base.is_lazy());
        assert!(derived.is_lazy());
        assert_eq!(base.argv(), vec!["echo"]);
        assert!(!derived.binary().is_text());
        assert!(derived.is_text());
    }

    #[test]
    fn test_overrides_carry_forward() {
        let quiet_binary = Command::new("cat").binary().quiet();
        let derived = quiet_binary.arg("x").streaming();
        assert!(!derived.is_text());
        assert!(!derived.raises());
        assert!(derived.streams_stdout());
    }

    #[test]
    fn test_return_properties() {
        assert_eq!(Command::new("true").returncode().unwrap(), 0);
        assert_ne!(Command::new("false").returncode().unwrap(), 0);
        assert_eq!(echo("hello world").stdout().unwrap().unwrap(), "hello world\n");
        let err = Command::from_tokens(["sh", "-c", "echo oops >&2"]);
        assert_eq!(err.stderr().unwrap().unwrap(), "oops\n");
    }

    #[test]
    fn test_truthiness() {
        assert!(Command::new("true").success().unwrap());
        assert!(!Command::new("false").success().unwrap());
    }

    #[test]
    fn test_lazy_results_are_idempotent() {
        let cmd = Command::from_tokens(["sh", "-c", "date +%s%N; echo err >&2; exit 3"]).arg("x");
        let first = (cmd.returncode().unwrap(), cmd.stdout().unwrap(), cmd.stderr().unwrap());
        for _ in 0..3 {
            let again = (cmd.returncode().unwrap(), cmd.stdout().unwrap(), cmd.stderr().unwrap());
            assert_eq!(again, first);
        }
        assert_eq!(first.0, 3);
    }

    #[test]
    fn test_fresh_descriptor_runs_every_time() {
        let cmd = Command::from_tokens(["sh", "-c", "date +%s%N"]);
        let a = cmd.output().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = cmd.output().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_decodes_regardless_of_mode() {
        assert_eq!(echo("hello world").to_string(), "hello world\n");
        assert_eq!(echo("καλημέρα").binary().to_string(), "καλημέρα\n");
        let greek = Codec::for_label("iso-8859-7").unwrap();
        let cat = Command::new("cat").binary().codec(greek);
        let cmd = cat.with_stdin(greek.encode("καλημέρα"));
        assert_eq!(cmd.to_string(), "καλημέρα");
        assert_eq!(cmd.stdout().unwrap().unwrap(), Data::Bytes(greek.encode("καλημέρα")));
    }

    #[test]
    fn test_strict_text_decode_fails_but_display_is_lossy() {
        let cmd = Command::new("cat").with_stdin(vec![0xff_u8, 0xfe, b'\n']);
        assert!(matches!(cmd.stdout(), Err(Error::Decode { .. })));
        assert!(cmd.to_string().contains('\u{FFFD}'));
    }

    #[test]
    fn test_binary_mode_yields_bytes() {
        let out = echo("x").binary().stdout().unwrap().unwrap();
        assert_eq!(out, Data::Bytes(b"x\n".to_vec()));
    }

    #[test]
    fn test_iter_lines_and_words() {
        let lines: Vec<Data> = echo("a\nb\nc").lines().map(|l| l.unwrap()).collect();
        assert_eq!(lines, vec![Data::from("a\n"), Data::from("b\n"), Data::from("c\n")]);

        let words: Vec<String> = Command::from_tokens(["echo", "a", "b", "c"])
            .words()
            .map(|w| w.unwrap())
            .collect();
        assert_eq!(words, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_live_iteration_is_incremental() {
        let cmd = Command::from_tokens(["sh", "-c", "for i in 0 1 2; do echo line $i; sleep 0.05; done"]).arg("x");
        let mut previous: Option<std::time::Instant> = None;
        for (i, line) in cmd.lines().enumerate() {
            let now = std::time::Instant::now();
            if let Some(prev) = previous {
                assert!(now - prev >= std::time::Duration::from_millis(30));
            }
            assert_eq!(line.unwrap().to_string().trim(), format!("line {i}"));
            previous = Some(now);
        }
        // Consumed output is kept as the captured result.
        assert_eq!(cmd.returncode().unwrap(), 0);
        assert_eq!(cmd.output().unwrap(), "line 0\nline 1\nline 2\n");
    }

    #[test]
    fn test_replay_after_evaluation() {
        let cmd = echo("x\ny").run().unwrap();
        let first: Vec<_> = cmd.lines().map(|l| l.unwrap()).collect();
        let second: Vec<_> = cmd.lines().map(|l| l.unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
    }

    #[test]
    fn test_as_table() {
        let cmd = Command::new("cat")
            .with_stdin("field1 field2\nvalue1 value2\nvalue3 value4 with spaces\n");
        let table = cmd.as_table().unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table[0]["field1"], "value1");
        assert_eq!(table[0]["field2"], "value2");
        assert_eq!(table[1]["field2"], "value4 with spaces");
    }

    #[test]
    fn test_split_max() {
        assert_eq!(split_max("  a   b c d ", 2), vec!["a", "b c d"]);
        assert_eq!(split_max("a", 3), vec!["a"]);
        assert!(split_max("   ", 3).is_empty());
    }

    #[test]
    fn test_redirects_to_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.txt");
        echo("hello world").write_to(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world\n");

        echo("hello world").append_to(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello world\nhello world\n");

        let cat = Command::new("cat").read_from(&path);
        assert_eq!(cat.to_string(), "hello world\nhello world\n");
    }

    #[test]
    fn test_redirect_into_buffer_and_from_reader() {
        let mut buf = Vec::new();
        echo("hello world").write_into(&mut buf).unwrap();
        assert_eq!(buf, b"hello world\n");

        let evaluated = echo("again").run().unwrap();
        let mut buf = b"foo ".to_vec();
        evaluated.write_into(&mut buf).unwrap();
        assert_eq!(buf, b"foo again\n");

        let grep = Command::new("grep").arg("aaa").with_stdin(Input::reader(Cursor::new("aaa\nbbb")));
        assert_eq!(grep.to_string(), "aaa\n");
    }

    #[test]
    fn test_streams_are_not_captured() {
        let result = Command::new("true").stream(true).run().unwrap();
        assert!(result.success().unwrap());
        assert!(result.stdout().unwrap().is_none());
        assert!(result.stderr().unwrap().is_none());

        let captured = Command::new("true").stream(false).run().unwrap();
        assert_eq!(captured.stdout().unwrap(), Some(Data::from("")));
        assert_eq!(captured.stderr().unwrap(), Some(Data::from("")));
    }

    #[test]
    fn test_always_stream_default_and_override() {
        let _guard = Config::current().with_always_stream(true).install();
        let streamed = Command::new("true").run().unwrap();
        assert!(streamed.stdout().unwrap().is_none());
        let captured = Command::new("true").stream(false).run().unwrap();
        assert!(captured.stdout().unwrap().is_some());
    }

    #[test]
    fn test_not_toggles_streams() {
        let cmd = !Command::new("true");
        assert!(cmd.streams_stderr());
        assert!(!cmd.streams_stdout());
        let cmd = !cmd;
        assert!(cmd.streams_stdout());
        assert!(!cmd.streams_stderr());
    }

    #[test]
    fn test_raise_policy_layering() {
        {
            let _guard = Config::current().with_always_raise(true).install();
            assert!(matches!(
                Command::new("false").returncode(),
                Err(Error::NonZero { returncode: 1, .. })
            ));
            assert_eq!(Command::new("false").quiet().returncode().unwrap(), 1);
        }
        {
            let _guard = Config::current().with_always_raise(false).install();
            assert_eq!(Command::new("false").returncode().unwrap(), 1);
            assert!(Command::new("false").raising().run().is_err());
        }
        let injected = Command::new("false").with_config(Config::default().with_always_raise(true));
        assert!(injected.run().is_err());
        assert!(injected.quiet().run().is_ok());
    }

    #[test]
    fn test_raise_for_returncode() {
        Command::new("true").raise_for_returncode().unwrap();
        let err = Command::from_tokens(["sh", "-c", "echo out; echo err >&2; exit 4"])
            .raise_for_returncode()
            .unwrap_err();
        assert_eq!(err.returncode(), Some(4));
        assert_eq!(err.stdout().unwrap(), "out\n");
        assert_eq!(err.stderr().unwrap(), "err\n");
    }

    #[test]
    fn test_debug_summary_and_interactive() {
        let cmd = echo("hi").run().unwrap();
        let summary = format!("{cmd:?}");
        assert!(summary.starts_with("Command([\"echo\", \"hi\"]"));
        assert!(summary.contains("returncode=0"));

        let _guard = Config::current().with_interactive(true).install();
        assert_eq!(format!("{:?}", echo("hi")), "hi\n");
    }

    #[test]
    fn test_missing_program_is_spawn_error() {
        let err = Command::new("definitely-not-a-program-9876").run().unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
