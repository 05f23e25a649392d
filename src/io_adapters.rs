use crate::command::Command;
use crate::data::Data;
use crate::error::Result;
use std::cell::RefCell;
use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::process::{ChildStderr, ChildStdin, ChildStdout};
use std::rc::Rc;
use std::thread::JoinHandle;

/// Where a descriptor's standard input comes from.
///
/// Cloning an input shares single-pass sources (iterators and readers)
/// instead of duplicating them.
#[derive(Clone, Default)]
pub enum Input {
    /// Inherit the controlling process's stdin.
    #[default]
    None,
    /// Output of another descriptor; forms a pipeline chain.
    Command(Command),
    /// A literal converted with the receiving descriptor's codec.
    Data(Data),
    /// Chunks written one by one while the process runs.
    Chunks(Rc<RefCell<Feed>>),
    /// A file streamed line by line.
    File(PathBuf),
    /// Any reader, streamed line by line.
    Reader(Rc<RefCell<Box<dyn Read>>>),
}

impl Input {
    /// Stream the file at `path`.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Input::File(path.into())
    }

    /// Stream an arbitrary reader.
    pub fn reader(reader: impl Read + 'static) -> Self {
        Input::Reader(Rc::new(RefCell::new(Box::new(reader))))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Input::None)
    }
}

impl fmt::Debug for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Input::None => f.write_str("None"),
            Input::Command(c) => write!(f, "Command({:?})", c.argv()),
            Input::Data(d) => write!(f, "Data({:?})", d),
            Input::Chunks(_) => f.write_str("Chunks(..)"),
            Input::File(p) => write!(f, "File({})", p.display()),
            Input::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

impl From<Data> for Input {
    fn from(d: Data) -> Self {
        Input::Data(d)
    }
}

impl From<&str> for Input {
    fn from(s: &str) -> Self {
        Input::Data(s.into())
    }
}

impl From<String> for Input {
    fn from(s: String) -> Self {
        Input::Data(s.into())
    }
}

impl From<Vec<u8>> for Input {
    fn from(b: Vec<u8>) -> Self {
        Input::Data(b.into())
    }
}

impl From<&[u8]> for Input {
    fn from(b: &[u8]) -> Self {
        Input::Data(b.into())
    }
}

impl From<Command> for Input {
    fn from(c: Command) -> Self {
        Input::Command(c)
    }
}

impl From<Feed> for Input {
    fn from(feed: Feed) -> Self {
        Input::Chunks(Rc::new(RefCell::new(feed)))
    }
}

/// A lazy, single-pass sequence of chunks.
///
/// Used both as a pipe source (`Feed | command`) and as the value returned
/// by generator-style pipe targets.
pub struct Feed {
    iter: Box<dyn Iterator<Item = Result<Data>>>,
}

impl Feed {
    /// Wrap any iterable of chunk-like values.
    pub fn new<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: 'static,
        T: Into<Data>,
    {
        Self {
            iter: Box::new(chunks.into_iter().map(|c| Ok(c.into()))),
        }
    }

    /// Like [`Feed::new`] for sources that can fail.
    pub fn try_new<I, T>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Result<T>>,
        I::IntoIter: 'static,
        T: Into<Data>,
    {
        Self {
            iter: Box::new(chunks.into_iter().map(|c| c.map(Into::into))),
        }
    }

    /// Run `finalizer` once the chunks are exhausted. Its error, if any,
    /// becomes the last item.
    pub(crate) fn then(self, finalizer: impl FnOnce() -> Result<()> + 'static) -> Feed {
        let mut inner = self.iter;
        let mut finalizer: Option<Box<dyn FnOnce() -> Result<()>>> = Some(Box::new(finalizer));
        Feed {
            iter: Box::new(std::iter::from_fn(move || match inner.next() {
                Some(item) => Some(item),
                None => finalizer.take().and_then(|f| f().err().map(Err)),
            })),
        }
    }
}

impl Iterator for Feed {
    type Item = Result<Data>;

    fn next(&mut self) -> Option<Self::Item> {
        self.iter.next()
    }
}

impl fmt::Debug for Feed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Feed(..)")
    }
}

/// Write one chunk to a child's stdin.
///
/// Returns `Ok(false)` when the reader has gone away; the caller should stop
/// feeding. Output already produced is still collected later.
pub(crate) fn write_chunk(stdin: &mut ChildStdin, bytes: &[u8], flush: bool) -> Result<bool> {
    let res = stdin.write_all(bytes).and_then(|_| {
        if flush { stdin.flush() } else { Ok(()) }
    });
    match res {
        Ok(()) => {
            tracing::trace!(len = bytes.len(), flush, "fed chunk");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            tracing::warn!("process closed its stdin, dropping remaining input");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Stream a reader into a child's stdin line by line.
pub(crate) fn copy_lines(reader: &mut dyn Read, stdin: &mut ChildStdin) -> Result<()> {
    let mut reader = std::io::BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = std::io::BufRead::read_until(&mut reader, b'\n', &mut line)?;
        if n == 0 || !write_chunk(stdin, &line, true)? {
            return Ok(());
        }
    }
}

/// Input whose bytes can be written from a helper thread.
pub(crate) enum Payload {
    Bytes(Vec<u8>),
    File(std::fs::File),
}

/// Write `payload` into `stdin` on a helper thread and close it afterwards.
///
/// The process can then produce output while its input is still being
/// written. Failures other than a closed pipe are logged.
pub(crate) fn feed_in_background(mut stdin: ChildStdin, payload: Payload) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let res = match payload {
            Payload::Bytes(bytes) => write_chunk(&mut stdin, &bytes, true).map(drop),
            Payload::File(mut file) => copy_lines(&mut file, &mut stdin),
        };
        if let Err(e) = res {
            tracing::warn!(error = %e, "feeding stdin failed");
        }
    })
}

/// Output pipes read to the end on helper threads.
///
/// Reading starts as soon as a pipe is added, so the process never blocks
/// on a full pipe no matter when it is waited on. A read error keeps
/// whatever arrived before it; a pipe that was never added yields `None`.
#[derive(Default)]
pub(crate) struct Drain {
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl Drain {
    pub(crate) fn add_stdout(&mut self, pipe: Option<ChildStdout>) {
        if let Some(pipe) = pipe {
            self.stdout = Some(spawn_reader(pipe, "stdout"));
        }
    }

    pub(crate) fn add_stderr(&mut self, pipe: Option<ChildStderr>) {
        if let Some(pipe) = pipe {
            self.stderr = Some(spawn_reader(pipe, "stderr"));
        }
    }

    /// Wait for both readers to hit end of file.
    pub(crate) fn join(self) -> (Option<Vec<u8>>, Option<Vec<u8>>) {
        (join_reader(self.stdout, "stdout"), join_reader(self.stderr, "stderr"))
    }
}

fn spawn_reader(mut pipe: impl Read + Send + 'static, name: &'static str) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || read_partial(&mut pipe, name))
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>, name: &str) -> Option<Vec<u8>> {
    match handle?.join() {
        Ok(buf) => Some(buf),
        Err(_) => {
            tracing::warn!(stream = name, "reader panicked, treating output as empty");
            Some(Vec::new())
        }
    }
}

fn read_partial(reader: &mut dyn Read, name: &str) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = reader.read_to_end(&mut buf) {
        tracing::warn!(stream = name, error = %e, kept = buf.len(), "partial read");
    }
    buf
}
