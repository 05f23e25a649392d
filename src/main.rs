use anyhow::{Context, Result};
use argh::FromArgs;
use pipe_commands::{Command, Config, jobs};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::io::{BufRead, Write};
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(FromArgs)]
/// Compose external commands with pipes and background jobs.
struct Cli {
    #[argh(switch)]
    /// fail as soon as a command exits with a nonzero return code.
    raise: bool,

    #[argh(switch)]
    /// pass output through instead of capturing it.
    stream: bool,

    #[argh(subcommand)]
    command: Subcommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Subcommand {
    Pipe(PipeArgs),
    Feed(FeedArgs),
    Jobs(JobsArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "pipe")]
/// pipe stages into each other, e.g. `pipe "ls -l" "grep src"`.
struct PipeArgs {
    #[argh(positional, greedy)]
    /// command lines, split on whitespace, piped left to right.
    stages: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "feed")]
/// type lines into a running program.
struct FeedArgs {
    #[argh(positional)]
    /// program to start.
    program: String,

    #[argh(positional, greedy)]
    /// arguments for the program.
    args: Vec<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "jobs")]
/// start a few background jobs, list them and wait for all of them.
struct JobsArgs {
    #[argh(option, default = "3")]
    /// number of jobs to start.
    count: u32,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli: Cli = argh::from_env();
    let _config = Config::current()
        .with_always_raise(cli.raise)
        .with_always_stream(cli.stream)
        .install();

    let result = match cli.command {
        Subcommand::Pipe(args) => run_pipe(args),
        Subcommand::Feed(args) => run_feed(args),
        Subcommand::Jobs(args) => run_jobs(args),
    };
    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn run_pipe(args: PipeArgs) -> Result<i32> {
    let mut stages = args.stages.iter().map(|s| Command::from_tokens(s.split_whitespace()));
    let first = stages.next().context("pipe: at least one stage is required")?;
    let chain = stages.fold(first.lazy(), |chain, stage| chain | stage);

    let mut stdout = std::io::stdout().lock();
    chain
        .write_into(&mut stdout)
        .with_context(|| format!("pipe: running {:?}", chain.argv()))?;
    Ok(chain.returncode()?)
}

fn run_feed(args: FeedArgs) -> Result<i32> {
    let cmd = Command::new(&args.program).args(&args.args);
    let mut session = cmd
        .interact()
        .with_context(|| format!("feed: can't start {}", args.program))?;

    let printer = session.take_stdout().map(|out| {
        std::thread::spawn(move || {
            let mut stdout = std::io::stdout();
            for line in out.lines().map_while(|l| l.ok()) {
                let _ = writeln!(stdout, "{line}");
            }
        })
    });

    let mut rl = DefaultEditor::new().context("feed: failed to create editor")?;
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let _ = rl.add_history_entry(line.as_str());
                let Some(stdin) = session.stdin() else { break };
                if writeln!(stdin, "{line}").and_then(|_| stdin.flush()).is_err() {
                    tracing::warn!("program closed its input");
                    break;
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("feed: reading input"),
        }
    }

    session.close_stdin();
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    let finished = session.finish()?;
    Ok(finished.returncode()?)
}

fn run_jobs(args: JobsArgs) -> Result<i32> {
    let started = (1..=args.count)
        .map(|i| Command::new("sleep").arg(format!("0.{i}")).delay())
        .collect::<pipe_commands::Result<Vec<_>>>()?;
    tracing::debug!(count = started.len(), "started background jobs");
    for job in jobs::jobs() {
        println!("{:>8}  {}", job.pid().unwrap_or_default(), job.argv().join(" "));
    }
    jobs::wait_jobs()?;
    println!("all jobs finished");
    Ok(0)
}
