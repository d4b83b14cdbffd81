mod builtin;
mod errors;
mod eval;
mod global;
mod job;
mod lexer;
mod parser;
mod search;
mod types;
mod wire;

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{signal, SigHandler, Signal};

use errors::ShellError;
use eval::EvalResult;
use global::State;
use job::JobState;

const PROMPT: &str = "jsh> ";

/// A job-control pipeline interpreter.
#[derive(Parser)]
#[command(name = "jsh")]
struct Cli {
    /// Run a single command line and exit.
    #[arg(short = 'c', value_name = "LINE", conflicts_with = "script")]
    command: Option<String>,

    /// Script to read instead of standard input.
    script: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // the shell hands the terminal back and forth; without this it would
    // be stopped for calling tcsetpgrp from a non-foreground group
    unsafe {
        let _ = signal(Signal::SIGTTOU, SigHandler::SigIgn);
    }

    let mut state = State::new();

    if let Some(line) = &cli.command {
        run_line(&mut state, line);
        report_jobs(&mut state);
        process::exit(state.exit.unwrap_or(state.last_status));
    }

    let interactive = cli.script.is_none();
    let mut reader: Box<dyn BufRead> = match &cli.script {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    loop {
        report_jobs(&mut state);
        if interactive {
            print!("{PROMPT}");
            let _ = io::stdout().flush();
        }
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => run_line(&mut state, &line),
            Err(e) => {
                eprintln!("jsh: read error: {e}");
                break;
            }
        }
        if state.exit.is_some() {
            break;
        }
    }
    report_jobs(&mut state);
    process::exit(state.exit.unwrap_or(state.last_status));
}

/// One line through the whole path: tokenize, parse, launch, report.
/// Any error aborts only this line; the interpreter keeps reading.
fn run_line(state: &mut State, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let tokens = match lexer::tokenize(line) {
        Ok(tokens) => tokens,
        Err(e) => {
            eprintln!("jsh: {e}");
            state.last_status = 2;
            return;
        }
    };
    let pipeline = match parser::parse(tokens) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("jsh: {e}");
            state.last_status = 2;
            return;
        }
    };
    match eval::eval(state, &pipeline, line) {
        Ok(EvalResult::Done(status)) => state.last_status = status,
        Ok(EvalResult::Launched { job_id, pgid }) => eprintln!("[{job_id}] {pgid}"),
        Err(e) => {
            state.last_status = match e {
                ShellError::Syntax(_) => 2,
                _ => 1,
            };
            eprintln!("jsh: {e}");
        }
    }
}

/// Drains pending child notifications and renders the resulting job
/// events: completed jobs report one status per stage in pipeline order
/// and leave the table.
fn report_jobs(state: &mut State) {
    job::drain_background(&mut state.jobs);
    for event in state.jobs.take_events() {
        let Some(job) = state.jobs.find(event.job_id) else {
            continue;
        };
        match event.state {
            JobState::Done => {
                let statuses = job
                    .exit_statuses()
                    .iter()
                    .map(i32::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                eprintln!("[{}] done {}\t{}", job.id, statuses, job.line);
                state.jobs.remove(event.job_id);
            }
            JobState::Stopped => eprintln!("[{}] stopped\t{}", job.id, job.line),
            JobState::Running => eprintln!("[{}] continued\t{}", job.id, job.line),
        }
    }
}
