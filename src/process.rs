//! Running descriptors: start, feed, wait, and process control.

use crate::command::{Command, ExitCode};
use crate::data::Data;
use crate::error::{Error, Result};
use crate::io_adapters::{self, Drain, Input, Payload};
use crate::jobs;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::BufReader;
use std::process::{ChildStderr, ChildStdin, ChildStdout, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

impl Command {
    /// Launch the process (and its upstream chain) without waiting.
    ///
    /// `interactive` leaves the head of the chain with a writable stdin
    /// instead of the inherited one. `pipe_stdout` forces stdout into a
    /// pipe, as needed when a downstream process reads from it.
    pub(crate) fn start(&self, interactive: bool, pipe_stdout: bool) -> Result<()> {
        {
            let st = self.state.borrow();
            if st.child.is_some() || (st.lazy && st.returncode.is_some()) {
                return Ok(());
            }
        }

        let input = self.input();
        let stdin = match &input {
            Input::None if interactive => Stdio::piped(),
            Input::None => Stdio::inherit(),
            Input::Command(upstream) if upstream.has_captured_stdout() => Stdio::piped(),
            Input::Command(upstream) => {
                upstream.start(interactive, true)?;
                match upstream.hand_over_stdout() {
                    Some(out) => Stdio::from(out),
                    None => Stdio::null(),
                }
            }
            _ => Stdio::piped(),
        };

        let mut st = self.state.borrow_mut();
        let program = st.argv.first().cloned().ok_or(Error::EmptyCommand)?;
        let stream_stdout = !pipe_stdout && st.streams_stdout();
        let stream_stderr = st.streams_stderr();

        let child = std::process::Command::new(&program)
            .args(&st.argv[1..])
            .stdin(stdin)
            .stdout(if stream_stdout { Stdio::inherit() } else { Stdio::piped() })
            .stderr(if stream_stderr { Stdio::inherit() } else { Stdio::piped() })
            .spawn()
            .map_err(|source| Error::Spawn {
                program: program.clone(),
                source,
            })?;
        let pid = child.id();
        tracing::debug!(pid, argv = ?st.argv, "started");

        st.stdout = None;
        st.stderr = None;
        st.returncode = None;
        st.input_closed = false;
        st.stdout_seen.clear();
        st.drain = None;
        st.feeder = None;
        st.stdout_captured = !stream_stdout;
        st.stderr_captured = !stream_stderr;
        st.child = Some(child);
        drop(st);

        jobs::register(pid, &self.state);
        Ok(())
    }

    /// Write the configured input into the running process and close its
    /// stdin. Idempotent; a no-op for inherited or interactive stdin.
    ///
    /// Literal data, files and captured upstream output are written from a
    /// helper thread so the process can produce output meanwhile. Chunk
    /// sequences and readers are single-threaded sources and are written
    /// here, before returning.
    pub(crate) fn feed(&self) -> Result<()> {
        let input = {
            let st = self.state.borrow();
            if st.input_closed || st.child.is_none() {
                return Ok(());
            }
            st.input.clone()
        };
        if input.is_none() {
            return Ok(());
        }
        self.state.borrow_mut().input_closed = true;

        let codec = self.state.borrow().codec();
        let Some(mut stdin) = self.take_stdin() else {
            if let Input::Command(upstream) = input {
                upstream.feed()?;
            }
            return Ok(());
        };
        let payload = match input {
            Input::None => return Ok(()),
            Input::Command(upstream) => match upstream.captured_stdout_for(codec) {
                Some(data) => Payload::Bytes(data),
                None => return Ok(()),
            },
            Input::Data(data) => Payload::Bytes(codec.to_wire(&data)),
            Input::File(path) => Payload::File(std::fs::File::open(&path)?),
            Input::Chunks(chunks) => {
                loop {
                    let next = chunks.borrow_mut().next();
                    let Some(chunk) = next else { break };
                    let chunk = chunk?;
                    if !io_adapters::write_chunk(&mut stdin, &codec.to_wire(&chunk), chunk.has_newline())? {
                        break;
                    }
                }
                return Ok(());
            }
            Input::Reader(reader) => {
                let mut reader = reader.borrow_mut();
                return io_adapters::copy_lines(&mut **reader, &mut stdin);
            }
        };
        tracing::trace!(argv = ?self.argv(), "feeding stdin in the background");
        self.state.borrow_mut().feeder = Some(io_adapters::feed_in_background(stdin, payload));
        Ok(())
    }

    /// Start reading whatever output pipes the running process (and its
    /// running upstream) still holds on helper threads.
    pub(crate) fn drain_output(&self) {
        let upstream = {
            let mut guard = self.state.borrow_mut();
            let st = &mut *guard;
            let Some(child) = st.child.as_mut() else { return };
            let drain = st.drain.get_or_insert_with(Drain::default);
            drain.add_stdout(child.stdout.take());
            drain.add_stderr(child.stderr.take());
            match &st.input {
                Input::Command(upstream) => Some(upstream.clone()),
                _ => None,
            }
        };
        if let Some(upstream) = upstream {
            upstream.drain_output();
        }
    }

    /// Wait for the process to finish and record its results.
    ///
    /// The stdin of the head of the chain is closed first. With a timeout,
    /// an expired wait fails with [`Error::Timeout`] and leaves the process
    /// running; it can be waited on again. Output is read while waiting, so
    /// a chatty process cannot stall on a full pipe. Upstream processes of a
    /// chain are waited on after this one. The effective raise-policy is
    /// applied last.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        if self.state.borrow().child.is_none() {
            if self.state.borrow().returncode.is_none() {
                self.start(false, false)?;
                self.drain_output();
                self.feed()?;
                return self.wait(timeout);
            }
            return self.check_raise();
        }
        drop(self.take_head_stdin());
        self.drain_output();
        let child = self.state.borrow_mut().child.take();
        let Some(mut child) = child else {
            return self.check_raise();
        };
        let pid = child.id();

        if let Some(timeout) = timeout {
            let deadline = Instant::now() + timeout;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) if Instant::now() < deadline => {
                        std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
                    }
                    Ok(None) => {
                        let argv = self.argv();
                        self.state.borrow_mut().child = Some(child);
                        tracing::debug!(pid, ?timeout, "wait timed out");
                        return Err(Error::Timeout { argv, timeout });
                    }
                    Err(e) => {
                        self.state.borrow_mut().child = Some(child);
                        return Err(e.into());
                    }
                }
            }
        }

        let (drain, feeder) = {
            let mut st = self.state.borrow_mut();
            (st.drain.take(), st.feeder.take())
        };
        let (stdout, stderr) = drain.map(Drain::join).unwrap_or_default();
        let status = child.wait();
        jobs::deregister(pid);
        if let Some(feeder) = feeder {
            if feeder.join().is_err() {
                tracing::warn!(pid, "stdin feeder panicked");
            }
        }
        let returncode = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                tracing::warn!(pid, error = %e, "waiting for process failed");
                -1
            }
        };
        tracing::debug!(pid, returncode, "finished");

        let input = {
            let mut st = self.state.borrow_mut();
            st.returncode = Some(returncode);
            st.stdout = if st.stdout_captured {
                let mut out = std::mem::take(&mut st.stdout_seen);
                out.extend(stdout.unwrap_or_default());
                Some(out)
            } else {
                None
            };
            st.stderr = if st.stderr_captured {
                Some(stderr.unwrap_or_default())
            } else {
                None
            };
            st.input.clone()
        };

        if let Input::Command(upstream) = input {
            if upstream.is_running() {
                upstream.wait(None)?;
            }
        }
        self.check_raise()
    }

    /// Start, feed and wait unless a cached result is available.
    pub(crate) fn evaluate(&self) -> Result<()> {
        {
            let st = self.state.borrow();
            if st.lazy && st.returncode.is_some() && st.child.is_none() {
                return self.check_raise();
            }
        }
        self.start(false, false)?;
        self.drain_output();
        self.feed()?;
        self.wait(None)
    }

    fn check_raise(&self) -> Result<()> {
        if !self.state.borrow().raises() {
            return Ok(());
        }
        self.nonzero_error().map_or(Ok(()), Err)
    }

    /// Run in the background: a lazy copy that has been started and fed
    /// but not waited on. Its stdin stays writable until the copy is waited.
    pub fn delay(&self) -> Result<Command> {
        let job = self.lazy();
        job.start(true, false)?;
        job.feed()?;
        Ok(job)
    }

    /// Pid of the running process.
    pub fn pid(&self) -> Option<u32> {
        self.state.borrow().child.as_ref().map(|c| c.id())
    }

    /// True while a started process has not been waited on.
    pub fn is_running(&self) -> bool {
        self.state.borrow().child.is_some()
    }

    /// Deliver `signal` to the running process.
    ///
    /// Fails with [`Error::NoProcess`] when nothing is running.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid().ok_or_else(|| Error::NoProcess { argv: self.argv() })?;
        tracing::debug!(pid, ?signal, "sending signal");
        signal::kill(Pid::from_raw(pid as i32), signal).map_err(std::io::Error::from)?;
        Ok(())
    }

    /// Ask the process to stop with `SIGTERM`.
    pub fn terminate(&self) -> Result<()> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Kill the process with `SIGKILL`. It still has to be waited on.
    pub fn kill(&self) -> Result<()> {
        let mut st = self.state.borrow_mut();
        let argv = st.argv.clone();
        let child = st.child.as_mut().ok_or(Error::NoProcess { argv })?;
        child.kill()?;
        Ok(())
    }

    /// Write directly to the stdin of a running interactive process.
    pub fn write_stdin(&self, data: impl Into<Data>) -> Result<bool> {
        let data = data.into();
        let mut st = self.state.borrow_mut();
        let codec = st.codec();
        let argv = st.argv.clone();
        let stdin = st
            .child
            .as_mut()
            .and_then(|c| c.stdin.as_mut())
            .ok_or(Error::NoProcess { argv })?;
        io_adapters::write_chunk(stdin, &codec.to_wire(&data), true)
    }

    /// Close the stdin of a running process, signalling end of input.
    pub fn close_stdin(&self) {
        drop(self.take_stdin());
    }

    /// Start interactively and return handles to the process's streams.
    ///
    /// For a chain, stdin belongs to the head of the chain while stdout and
    /// stderr belong to this descriptor. Call [`Session::finish`] to close
    /// stdin and wait.
    pub fn interact(&self) -> Result<Session> {
        let cmd = if self.is_lazy() { self.clone() } else { self.lazy() };
        cmd.start(true, true)?;
        cmd.feed()?;
        let stdin = cmd.take_head_stdin();
        let (stdout, stderr) = {
            let mut st = cmd.state.borrow_mut();
            match st.child.as_mut() {
                Some(child) => (child.stdout.take(), child.stderr.take()),
                None => (None, None),
            }
        };
        Ok(Session {
            command: cmd,
            stdin,
            stdout: stdout.map(BufReader::new),
            stderr,
            finished: false,
        })
    }

    fn take_stdin(&self) -> Option<ChildStdin> {
        self.state.borrow_mut().child.as_mut()?.stdin.take()
    }

    pub(crate) fn take_head_stdin(&self) -> Option<ChildStdin> {
        if let Some(stdin) = self.take_stdin() {
            return Some(stdin);
        }
        match self.input() {
            Input::Command(upstream) if upstream.is_running() => upstream.take_head_stdin(),
            _ => None,
        }
    }

    /// Take the stdout pipe for reading here; what is read is recorded by
    /// the caller through `stdout_seen`.
    pub(crate) fn take_stdout(&self) -> Option<ChildStdout> {
        self.state.borrow_mut().child.as_mut()?.stdout.take()
    }

    /// Give the stdout pipe to a downstream process.
    fn hand_over_stdout(&self) -> Option<ChildStdout> {
        let mut st = self.state.borrow_mut();
        st.stdout_captured = false;
        st.child.as_mut()?.stdout.take()
    }

    fn has_captured_stdout(&self) -> bool {
        let st = self.state.borrow();
        st.child.is_none() && st.returncode.is_some() && st.stdout.is_some()
    }

    /// Captured stdout as bytes for a reader speaking `codec`.
    fn captured_stdout_for(&self, codec: crate::data::Codec) -> Option<Vec<u8>> {
        let st = self.state.borrow();
        let out = st.stdout.as_ref()?;
        if !st.text() || st.codec() == codec {
            return Some(out.clone());
        }
        Some(codec.encode(&st.codec().decode_lossy(out)))
    }
}

fn exit_code(status: ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => code,
        None => terminated_by_signal(status),
    }
}

#[cfg(unix)]
fn terminated_by_signal(exit_status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = ExitStatusExt::signal(&exit_status) {
        128 + signal
    } else if ExitStatusExt::core_dumped(&exit_status) {
        255
    } else {
        -1
    }
}

#[cfg(not(unix))]
fn terminated_by_signal(_exit_status: ExitStatus) -> i32 {
    -1
}

/// Live handles to an interactively started process.
///
/// Dropping an unfinished session closes stdin and waits, logging any
/// failure instead of reporting it.
pub struct Session {
    command: Command,
    stdin: Option<ChildStdin>,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<ChildStderr>,
    finished: bool,
}

impl Session {
    /// The descriptor this session runs.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Stdin of the head of the chain, until it is closed.
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Buffered stdout. Output read here is not part of the captured result.
    pub fn stdout(&mut self) -> Option<&mut BufReader<ChildStdout>> {
        self.stdout.as_mut()
    }

    /// Take ownership of stdout, e.g. to read it on another thread.
    /// Output read this way is not part of the captured result.
    pub fn take_stdout(&mut self) -> Option<BufReader<ChildStdout>> {
        self.stdout.take()
    }

    /// Stderr, when it is captured.
    pub fn stderr(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    /// Signal end of input without waiting.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Close stdin and wait. Output not read through the session is kept
    /// as the descriptor's captured result.
    pub fn finish(mut self) -> Result<Command> {
        self.finish_inner()?;
        Ok(self.command.clone())
    }

    fn finish_inner(&mut self) -> Result<()> {
        self.finished = true;
        self.stdin = None;
        {
            let mut st = self.command.state.borrow_mut();
            if let Some(reader) = self.stdout.take() {
                let buffered = reader.buffer().to_vec();
                st.stdout_seen.extend(buffered);
                if let Some(child) = st.child.as_mut() {
                    child.stdout = Some(reader.into_inner());
                }
            }
            if let Some(stderr) = self.stderr.take() {
                if let Some(child) = st.child.as_mut() {
                    child.stderr = Some(stderr);
                }
            }
        }
        self.command.wait(None)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.finish_inner() {
                tracing::warn!(argv = ?self.command.argv(), error = %e, "session ended with an error");
            }
        }
    }
}
