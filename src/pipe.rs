//! The `|` operator: wiring descriptors to each other, to literal or
//! iterable input, to callbacks and to coroutines.

use crate::command::{Command, ExitCode, Lines};
use crate::data::Data;
use crate::error::{Error, Result};
use crate::io_adapters::{self, Feed, Input};
use std::io::{BufRead, BufReader};
use std::ops::BitOr;
use std::process::{ChildStderr, ChildStdout};

/// Anything that can stand on the right of `command | ...`.
pub trait PipeTarget {
    type Output;

    /// Consume `source` as the left-hand side of `|`.
    fn pipe_from(self, source: Command) -> Self::Output;
}

impl<T: PipeTarget> BitOr<T> for Command {
    type Output = T::Output;

    fn bitor(self, target: T) -> T::Output {
        target.pipe_from(self)
    }
}

impl<T: PipeTarget> BitOr<T> for &Command {
    type Output = T::Output;

    fn bitor(self, target: T) -> T::Output {
        target.pipe_from(self.clone())
    }
}

/// Chaining: the target reads the source's output. Nothing runs until the
/// target is evaluated.
impl PipeTarget for Command {
    type Output = Command;

    fn pipe_from(self, source: Command) -> Command {
        self.with_stdin(Input::Command(source))
    }
}

impl PipeTarget for &Command {
    type Output = Command;

    fn pipe_from(self, source: Command) -> Command {
        self.with_stdin(Input::Command(source))
    }
}

macro_rules! pipe_into_command {
    ($($t:ty),*) => {
        $(impl BitOr<Command> for $t {
            type Output = Command;

            fn bitor(self, target: Command) -> Command {
                target.with_stdin(Input::from(self))
            }
        }

        impl BitOr<&Command> for $t {
            type Output = Command;

            fn bitor(self, target: &Command) -> Command {
                target.with_stdin(Input::from(self))
            }
        })*
    };
}

pipe_into_command!(&str, String, Vec<u8>, &[u8], Data, Feed);

impl BitOr<Command> for Lines {
    type Output = Command;

    fn bitor(self, target: Command) -> Command {
        target.with_stdin(Feed::try_new(self))
    }
}

/// Parameters a callback can ask for.
///
/// Only the fields named when the [`Callback`] was declared are filled in.
#[derive(Default)]
pub struct Args {
    pub returncode: Option<ExitCode>,
    /// Captured stdout, text or bytes depending on the source's mode.
    pub output: Option<Data>,
    /// Captured stderr, text or bytes depending on the source's mode.
    pub errors: Option<Data>,
    /// Live stdout of the still running source.
    pub stdout: Option<BufReader<ChildStdout>>,
    /// Live stderr of the still running source.
    pub stderr: Option<ChildStderr>,
}

const CAPTURED: [&str; 3] = ["returncode", "output", "errors"];
const STREAMS: [&str; 2] = ["stdout", "stderr"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Captured,
    Streams,
}

fn mode_for(params: &[String]) -> Result<Mode> {
    if params.iter().all(|p| CAPTURED.contains(&p.as_str())) {
        Ok(Mode::Captured)
    } else if params.iter().all(|p| STREAMS.contains(&p.as_str())) {
        Ok(Mode::Streams)
    } else {
        Err(Error::Signature(format!(
            "callback parameters {params:?} are neither a subset of {CAPTURED:?} nor of {STREAMS:?}"
        )))
    }
}

fn wants(params: &[String], name: &str) -> bool {
    params.iter().any(|p| p == name)
}

/// Gather the arguments for `params`.
///
/// Captured parameters evaluate the source completely. Stream parameters
/// start it in the background and hand out its live pipes; the caller has
/// to wait on the source afterwards.
fn prepare(source: &Command, params: &[String]) -> Result<(Mode, Args)> {
    let mode = mode_for(params)?;
    let mut args = Args::default();
    match mode {
        Mode::Captured => {
            source.evaluate()?;
            let st = source.state.borrow();
            if wants(params, "returncode") {
                args.returncode = st.returncode;
            }
            if wants(params, "output") {
                args.output = st.view(&st.stdout)?;
            }
            if wants(params, "errors") {
                args.errors = st.view(&st.stderr)?;
            }
        }
        Mode::Streams => {
            source.start(false, wants(params, "stdout"))?;
            {
                let mut st = source.state.borrow_mut();
                if let Some(child) = st.child.as_mut() {
                    if wants(params, "stdout") {
                        args.stdout = child.stdout.take().map(BufReader::new);
                    }
                    if wants(params, "stderr") {
                        args.stderr = child.stderr.take();
                    }
                }
            }
            source.drain_output();
            source.feed()?;
        }
    }
    Ok((mode, args))
}

/// A function receiving a descriptor's results by parameter name.
///
/// `returncode`, `output` and `errors` evaluate the source first;
/// `stdout` and `stderr` hand over the live streams of a background run,
/// which is waited on once the function returns. Mixing the two groups or
/// naming anything else is an [`Error::Signature`].
///
/// A lazy source that has already finished does not run again, so it has
/// no live streams: `stdout` and `stderr` are `None` and its results are
/// only available through the captured names.
pub struct Callback<F> {
    params: Vec<String>,
    f: F,
}

impl<F, R> Callback<F>
where
    F: FnOnce(Args) -> R,
{
    /// Declare the parameter names `f` receives.
    pub fn new(params: &[&str], f: F) -> Self {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
            f,
        }
    }
}

impl<F, R> PipeTarget for Callback<F>
where
    F: FnOnce(Args) -> R,
{
    type Output = Result<R>;

    fn pipe_from(self, source: Command) -> Result<R> {
        let (mode, args) = prepare(&source, &self.params)?;
        let result = (self.f)(args);
        if mode == Mode::Streams {
            source.wait(None)?;
        }
        Ok(result)
    }
}

/// Like [`Callback`], but the function returns a sequence of chunks.
///
/// The result is a [`Feed`] over that sequence; draining it waits on the
/// source. It can be piped onwards into another descriptor.
pub struct Yielding<F> {
    params: Vec<String>,
    f: F,
}

impl<F, I> Yielding<F>
where
    F: FnOnce(Args) -> I,
    I: IntoIterator,
    I::IntoIter: 'static,
    I::Item: Into<Data>,
{
    /// Declare the parameter names `f` receives.
    pub fn new(params: &[&str], f: F) -> Self {
        Self {
            params: params.iter().map(|p| p.to_string()).collect(),
            f,
        }
    }
}

impl<F, I> PipeTarget for Yielding<F>
where
    F: FnOnce(Args) -> I,
    I: IntoIterator,
    I::IntoIter: 'static,
    I::Item: Into<Data>,
{
    type Output = Result<Feed>;

    fn pipe_from(self, source: Command) -> Result<Feed> {
        let (mode, args) = prepare(&source, &self.params)?;
        let feed = Feed::new((self.f)(args));
        Ok(match mode {
            Mode::Streams => feed.then(move || source.wait(None)),
            Mode::Captured => feed,
        })
    }
}

/// What a [`Coroutine`] produced at a suspension point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Suspended, optionally handing out a value. A value is written to the
    /// source's stdin and, unless it came from [`Coroutine::prime`],
    /// repeated in the resulting sequence.
    Yield(Option<Data>),
    /// Finished; no more lines are sent.
    Complete,
}

/// A two-state conversation partner for a running process.
///
/// The driver calls [`prime`](Coroutine::prime) exactly once before the
/// first output line is available, then [`resume`](Coroutine::resume) once
/// per non-blank output line (trailing whitespace removed) until the
/// coroutine completes or the output ends.
pub trait Coroutine {
    /// Run up to the first suspension point.
    fn prime(&mut self) -> Step {
        Step::Yield(None)
    }

    /// Receive the next output line.
    fn resume(&mut self, line: Data) -> Step;

    /// Called once the conversation is over.
    fn close(&mut self) {}
}

/// Pipe target driving a [`Coroutine`] against the source's output.
pub struct Conversation<C>(pub C);

impl<C: Coroutine> PipeTarget for Conversation<C> {
    type Output = Result<Feed>;

    fn pipe_from(self, source: Command) -> Result<Feed> {
        let Conversation(mut coroutine) = self;
        let source = if source.is_lazy() { source } else { source.lazy() };
        source.start(true, true)?;
        source.feed()?;

        let (text, codec) = {
            let st = source.state.borrow();
            (st.text(), st.codec())
        };
        let mut stdin = source.take_head_stdin();
        let mut stdout = source.take_stdout().map(BufReader::new);
        source.drain_output();
        let mut seen = Vec::new();
        let mut mirrored = Vec::new();

        let mut step = coroutine.prime();
        loop {
            match step {
                Step::Complete => break,
                Step::Yield(Some(value)) => {
                    if let Some(pipe) = stdin.as_mut() {
                        if !io_adapters::write_chunk(pipe, &codec.to_wire(&value), true)? {
                            stdin = None;
                        }
                    }
                }
                Step::Yield(None) => {}
            }
            let Some(line) = next_nonblank_line(stdout.as_mut(), &mut seen)? else {
                break;
            };
            step = coroutine.resume(codec.view(&line, text)?);
            if let Step::Yield(Some(value)) = &step {
                mirrored.push(value.clone());
            }
        }
        coroutine.close();

        drop(stdin);
        {
            let mut guard = source.state.borrow_mut();
            let st = &mut *guard;
            st.stdout_seen.append(&mut seen);
            if let (Some(reader), Some(child)) = (stdout, st.child.as_mut()) {
                st.stdout_seen.extend_from_slice(reader.buffer());
                child.stdout = Some(reader.into_inner());
            }
        }
        source.wait(None)?;
        Ok(Feed::new(mirrored))
    }
}

fn next_nonblank_line(
    stdout: Option<&mut BufReader<ChildStdout>>,
    seen: &mut Vec<u8>,
) -> Result<Option<Vec<u8>>> {
    let Some(reader) = stdout else {
        return Ok(None);
    };
    loop {
        let mut buf = Vec::new();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(None);
        }
        seen.extend_from_slice(&buf);
        let end = buf
            .iter()
            .rposition(|c| !c.is_ascii_whitespace())
            .map_or(0, |i| i + 1);
        if end > 0 {
            buf.truncate(end);
            return Ok(Some(buf));
        }
    }
}

/// Coroutine applying `f` to every line and yielding the result.
pub fn map_lines<F>(f: F) -> Conversation<MapLines<F>>
where
    F: FnMut(Data) -> Data,
{
    Conversation(MapLines(f))
}

pub struct MapLines<F>(F);

impl<F> Coroutine for MapLines<F>
where
    F: FnMut(Data) -> Data,
{
    fn resume(&mut self, line: Data) -> Step {
        Step::Yield(Some((self.0)(line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::process::tests::within;
    use std::cell::RefCell;
    use std::io::Read;
    use std::rc::Rc;
    use std::time::Duration;

    fn echo(text: &str) -> Command {
        Command::new("echo").arg(text)
    }

    fn grep(pattern: &str) -> Command {
        Command::new("grep").arg(pattern)
    }

    #[test]
    fn test_pipe_command_to_command() {
        assert_eq!((echo("aaa\nbbb") | grep("bbb")).to_string(), "bbb\n");

        let result = echo("aaa\nbbb").run().unwrap();
        assert_eq!((&result | grep("bbb")).to_string(), "bbb\n");
    }

    #[test]
    fn test_pipe_does_not_run_until_evaluated() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let touch = Command::new("touch").arg(marker.display());
        let chain = touch | Command::new("cat");
        assert!(!marker.exists());
        assert_eq!(chain.returncode().unwrap(), 0);
        assert!(marker.exists());
    }

    #[test]
    fn test_long_chain_of_live_processes() {
        let chain = echo("foo\nbar\nfoo bar")
            | Command::new("cat")
            | grep("foo")
            | Command::new("cat")
            | grep("bar");
        assert_eq!(chain.to_string(), "foo bar\n");
    }

    #[test]
    fn test_pipe_string_and_bytes_to_command() {
        assert_eq!(("aaa\nbbb" | grep("b")).to_string(), "bbb\n");
        assert_eq!((b"xx\nyy".as_slice() | grep("y")).to_string(), "yy\n");
        assert_eq!(
            (String::from("one\ntwo\n") | Command::new("cat").binary())
                .stdout()
                .unwrap()
                .unwrap(),
            Data::from(b"one\ntwo\n")
        );
    }

    #[test]
    fn test_pipe_iterable_to_command() {
        let feed = Feed::new(vec!["line one\n", "line two\n", "line two\n", "something else\n", "line three\n"]);
        let chain = feed | Command::new("cat") | grep("two");
        assert_eq!(chain.to_string(), "line two\nline two\n");
    }

    #[test]
    fn test_pipe_literal_respects_codec() {
        let greek = crate::data::Codec::for_label("iso-8859-7").unwrap();
        let cmd = "καλημέρα" | Command::new("cat").codec(greek).binary();
        assert_eq!(cmd.stdout().unwrap().unwrap(), Data::Bytes(greek.encode("καλημέρα")));
    }

    #[test]
    fn test_pipe_command_to_callback() {
        let words = echo("aaa\nbbb")
            | Callback::new(&["output"], |args: Args| {
                args.output
                    .map(|o| o.to_string().split_whitespace().map(str::to_uppercase).collect::<Vec<_>>())
                    .unwrap_or_default()
            });
        assert_eq!(words.unwrap(), vec!["AAA", "BBB"]);

        let summary = Command::from_tokens(["sh", "-c", "echo out; echo err >&2; exit 3"])
            | Callback::new(&["errors", "returncode"], |args: Args| {
                (args.returncode, args.errors.map(|e| e.to_string()), args.output.is_none())
            });
        assert_eq!(summary.unwrap(), (Some(3), Some("err\n".to_string()), true));
    }

    #[test]
    fn test_pipe_command_to_stream_callback() {
        let cmd = echo("aaa\nbbb").arg("x");
        let upper = &cmd
            | Callback::new(&["stdout"], |args: Args| {
                args.stdout
                    .map(|out| out.lines().map(|l| l.unwrap().trim().to_uppercase()).collect::<Vec<_>>())
                    .unwrap_or_default()
            });
        assert_eq!(upper.unwrap(), vec!["AAA", "BBB X"]);
        // The source has been waited on.
        assert!(cmd.is_finished());
        assert_eq!(cmd.returncode().unwrap(), 0);
    }

    #[test]
    fn test_stream_callback_reads_stderr() {
        let errors = Command::from_tokens(["sh", "-c", "echo oops >&2"])
            | Callback::new(&["stderr"], |mut args: Args| {
                let mut text = String::new();
                if let Some(err) = args.stderr.as_mut() {
                    err.read_to_string(&mut text).unwrap();
                }
                text
            });
        assert_eq!(errors.unwrap(), "oops\n");
    }

    #[test]
    fn test_callback_signature_errors() {
        let mixed = echo("x") | Callback::new(&["output", "stdout"], |_| ());
        assert!(matches!(mixed, Err(Error::Signature(_))));
        let unknown = echo("x") | Callback::new(&["foo"], |_| ());
        assert!(matches!(unknown, Err(Error::Signature(_))));
    }

    #[test]
    fn test_callback_honours_raise_policy() {
        let _guard = Config::default().with_always_raise(true).install();
        let res = Command::new("false") | Callback::new(&["returncode"], |a: Args| a.returncode);
        assert!(matches!(res, Err(Error::NonZero { .. })));
    }

    #[test]
    fn test_long_pipe_through_generator_callback() {
        let source = Feed::new(vec!["line one\n", "line two\n", "line two\n", "something else\n", "line three\n"])
            | Command::new("cat")
            | grep("line");
        let upper = (source
            | Yielding::new(&["stdout"], |args: Args| {
                args.stdout
                    .into_iter()
                    .flat_map(|out| out.lines())
                    .map(|l| format!("{}\n", l.unwrap().to_uppercase()))
            }))
        .unwrap();
        let result = upper | grep("TWO");
        assert_eq!(result.to_string().trim(), "LINE TWO\nLINE TWO");
    }

    #[test]
    fn test_yielding_waits_on_exhaustion() {
        let cmd = echo("a\nb").arg("x");
        let feed = (&cmd | Yielding::new(&["stdout"], |args: Args| {
            args.stdout.into_iter().flat_map(|out| out.lines()).map(|l| l.unwrap())
        }))
        .unwrap();
        assert!(cmd.is_running());
        let items: Vec<Data> = feed.map(|c| c.unwrap()).collect();
        assert_eq!(items.len(), 2);
        assert!(cmd.is_finished());
    }

    struct Upperize;

    impl Coroutine for Upperize {
        fn resume(&mut self, line: Data) -> Step {
            Step::Yield(Some(Data::from(format!("{}\n", line.to_string().to_uppercase()))))
        }
    }

    #[test]
    fn test_pipe_to_coroutine() {
        let items: Vec<Data> = (echo("aaa\nbbb") | Conversation(Upperize))
            .unwrap()
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(items, vec![Data::from("AAA\n"), Data::from("BBB\n")]);

        let filtered = (echo("aaa\nbbb") | Conversation(Upperize)).unwrap() | grep("AAA");
        assert_eq!(filtered.to_string(), "AAA\n");
    }

    #[test]
    fn test_coroutine_skips_blank_lines_and_stops_on_complete() {
        struct FirstTwo(Rc<RefCell<Vec<String>>>);

        impl Coroutine for FirstTwo {
            fn resume(&mut self, line: Data) -> Step {
                let mut lines = self.0.borrow_mut();
                lines.push(line.to_string());
                if lines.len() == 2 { Step::Complete } else { Step::Yield(None) }
            }
        }

        let received = Rc::new(RefCell::new(Vec::new()));
        let source = Command::new("printf").arg("a  \n\n   \nb\nc\n");
        let feed = (source | Conversation(FirstTwo(received.clone()))).unwrap();
        assert_eq!(feed.count(), 0);
        assert_eq!(*received.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn test_coroutine_talks_to_process() {
        // The process answers every line it reads; the coroutine asks
        // three questions and collects the answers.
        struct Quiz {
            asked: usize,
        }

        impl Coroutine for Quiz {
            fn prime(&mut self) -> Step {
                self.asked = 1;
                Step::Yield(Some(Data::from("q1\n")))
            }

            fn resume(&mut self, line: Data) -> Step {
                assert_eq!(line.to_string(), format!("answer q{}", self.asked));
                if self.asked == 3 {
                    return Step::Complete;
                }
                self.asked += 1;
                Step::Yield(Some(Data::from(format!("q{}\n", self.asked))))
            }
        }

        let responder = Command::from_tokens(["sh", "-c", "while read q; do echo \"answer $q\"; done"]);
        let feed = (responder | Conversation(Quiz { asked: 0 })).unwrap();
        let mirrored: Vec<String> = feed.map(|c| c.unwrap().to_string()).collect();
        assert_eq!(mirrored, vec!["q2\n", "q3\n"]);
    }

    #[test]
    fn test_map_lines() {
        let feed = (echo("x\ny") | map_lines(|l| Data::from(format!("<{l}>\n")))).unwrap();
        let out: Vec<String> = feed.map(|c| c.unwrap().to_string()).collect();
        assert_eq!(out, vec!["<x>\n", "<y>\n"]);
    }

    #[test]
    fn test_captured_upstream_larger_than_pipe_into_filter() {
        let (upstream, downstream) = within(Duration::from_secs(20), || {
            let numbers = Command::new("seq").arg(1).arg(200_000).run().unwrap();
            let copy = &numbers | Command::new("cat");
            (numbers.output().unwrap().len(), copy.output().unwrap().len())
        });
        assert_eq!(upstream, downstream);
    }

    #[test]
    fn test_large_literal_at_head_of_chain() {
        let count = within(Duration::from_secs(20), || {
            let input: String = (0..100_000).map(|i| format!("{i}\n")).collect();
            let chain = input | Command::new("cat") | grep("0$");
            chain.lines().count()
        });
        assert_eq!(count, 10_000);
    }

    #[test]
    fn test_stream_callback_on_finished_source() {
        let done = echo("cached").run().unwrap();
        let got = &done
            | Callback::new(&["stdout", "stderr"], |args: Args| {
                (args.stdout.is_none(), args.stderr.is_none())
            });
        assert_eq!(got.unwrap(), (true, true));
        assert_eq!(done.output().unwrap(), "cached\n");
    }
}
