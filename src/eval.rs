use std::env;
use std::ffi::CString;
use std::io::{self, Write};
use std::mem;
use std::os::fd::AsRawFd;

use nix::sys::signal::Signal;
use nix::unistd::{self, ForkResult, Pid};

use crate::builtin;
use crate::errors::ShellError;
use crate::global::State;
use crate::job::{self, Job, JobBuilder, JobState};
use crate::types::{Pipeline, Stage};
use crate::wire::{self, StageFds};

pub enum EvalResult {
    /// The line finished synchronously; the value is its exit status.
    Done(i32),
    /// A background job was launched and registered.
    Launched { job_id: usize, pgid: Pid },
}

/// Launches one parsed pipeline: wires descriptors, spawns a process per
/// stage, registers the job, and for foreground pipelines waits for it.
pub fn eval(state: &mut State, pipeline: &Pipeline, line: &str) -> Result<EvalResult, ShellError> {
    let stages = &pipeline.stages;
    assert!(!stages.is_empty());

    // a lone builtin runs inside the interpreter so it can mutate State;
    // in any other shape builtins resolve in the child instead
    let mut skip_builtin = false;
    if stages.len() == 1
        && stages[0].input.is_none()
        && stages[0].output.is_none()
        && !pipeline.background
    {
        if let Some(func) = builtin::match_builtin(stages[0].program()) {
            return Ok(EvalResult::Done(func(state, &stages[0].argv)));
        }
        skip_builtin = true;
    }

    let plans = wire::plan(pipeline);
    let mut fds = wire::realize(&plans)?;

    let mut builder = JobBuilder::new(stages.len());
    let mut launch_failure = None;
    for (i, stage) in stages.iter().enumerate() {
        match builder.push_fork() {
            Ok(ForkResult::Parent { .. }) => {
                // this stage's endpoints belong to the child now
                fds[i].stdin = None;
                fds[i].stdout = None;
            }
            Ok(ForkResult::Child) => exec_stage(state, stage, fds, i, skip_builtin),
            Err(e) => {
                launch_failure = Some(e);
                break;
            }
        }
    }
    drop(fds);

    if builder.is_empty() {
        return Err(launch_failure.expect("first fork failed").into());
    }
    let job = builder.build(line, pipeline.background);
    let pgid = job.pgid;
    let job_id = state.jobs.register(job);
    if let Some(e) = launch_failure {
        // the stages that did spawn stay registered so they are reaped
        eprintln!("jsh: {e}");
    }

    if pipeline.background {
        Ok(EvalResult::Launched { job_id, pgid })
    } else {
        job::give_terminal_to(pgid);
        let end_state = job::wait_foreground(&mut state.jobs, job_id);
        job::reclaim_terminal();
        let status = match end_state {
            JobState::Stopped => 128 + Signal::SIGTSTP as i32,
            _ => state.jobs.find(job_id).map(Job::last_status).unwrap_or(0),
        };
        Ok(EvalResult::Done(status))
    }
}

/// The child side: apply this stage's descriptor assignments, release
/// every pipe endpoint, then transfer control. Never returns.
fn exec_stage(
    state: &mut State,
    stage: &Stage,
    mut fds: Vec<StageFds>,
    idx: usize,
    skip_builtin: bool,
) -> ! {
    let own = mem::take(&mut fds[idx]);
    if let Some(fd) = &own.stdin {
        if unistd::dup2(fd.as_raw_fd(), libc::STDIN_FILENO).is_err() {
            unsafe { libc::_exit(126) }
        }
    }
    if let Some(fd) = &own.stdout {
        if unistd::dup2(fd.as_raw_fd(), libc::STDOUT_FILENO).is_err() {
            unsafe { libc::_exit(126) }
        }
    }
    // the duplicates on fd 0/1 survive exec; the originals, and every
    // endpoint assigned to another stage, close here or at exec
    drop(own);
    drop(fds);

    if !skip_builtin {
        if let Some(func) = builtin::match_builtin(stage.program()) {
            let status = func(state, &stage.argv);
            unsafe { libc::_exit(status as libc::c_int) }
        }
    }
    let status = do_exec(state, stage);
    unsafe { libc::_exit(status as libc::c_int) }
}

/// Resolves and execs the stage's program; on any failure returns the
/// reserved status for the child to die with (127: not found, 126: the
/// transfer itself failed).
fn do_exec(state: &State, stage: &Stage) -> i32 {
    let program = stage.program();
    let resolved = if program.contains('/') {
        CString::new(program).ok()
    } else {
        state.search_cache.lookup(program).cloned()
    };
    let Some(path) = resolved else {
        let _ = writeln!(io::stderr(), "jsh: command not found: {program}");
        return 127;
    };

    let argv: Result<Vec<CString>, _> = stage
        .argv
        .iter()
        .map(|arg| CString::new(arg.as_str()))
        .collect();
    let Ok(argv) = argv else {
        let _ = writeln!(io::stderr(), "jsh: {program}: argument contains NUL");
        return 126;
    };
    let envp: Vec<CString> = env::vars()
        .filter_map(|(key, value)| CString::new(format!("{key}={value}")).ok())
        .collect();

    match unistd::execve(&path, &argv, &envp) {
        Err(e) => {
            let _ = writeln!(io::stderr(), "jsh: {program}: {e}");
            126
        }
        Ok(infallible) => match infallible {},
    }
}
