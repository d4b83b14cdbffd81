use std::env;

use nix::sys::signal::{killpg, Signal};

use crate::global::State;
use crate::job::{self, JobState};

pub type Builtin = fn(&mut State, &[String]) -> i32;

pub fn match_builtin(name: &str) -> Option<Builtin> {
    match name {
        "cd" => Some(builtin_cd),
        "exit" => Some(builtin_exit),
        "jobs" => Some(builtin_jobs),
        "fg" => Some(builtin_fg),
        "bg" => Some(builtin_bg),
        "kill" => Some(builtin_kill),
        "rehash" => Some(builtin_rehash),
        _ => None,
    }
}

fn builtin_cd(_state: &mut State, args: &[String]) -> i32 {
    let target = match args.get(1) {
        Some(dir) => dir.clone(),
        None => env::var("HOME").unwrap_or_else(|_| "/".to_string()),
    };
    match env::set_current_dir(&target) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("jsh: cd: {target}: {e}");
            1
        }
    }
}

fn builtin_exit(state: &mut State, args: &[String]) -> i32 {
    let code = args
        .get(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(state.last_status);
    state.exit = Some(code);
    code
}

fn builtin_rehash(state: &mut State, _args: &[String]) -> i32 {
    state.search_cache.rehash();
    0
}

fn builtin_jobs(state: &mut State, _args: &[String]) -> i32 {
    for job in state.jobs.iter() {
        println!("[{}] {}\t{}", job.id, job.state(), job.line);
    }
    0
}

/// Resolves an optional `%n` (or bare `n`) argument; with no argument the
/// most recently numbered live job is taken.
fn resolve_job_id(state: &State, args: &[String]) -> Result<usize, String> {
    let id = match args.get(1) {
        Some(arg) => arg
            .trim_start_matches('%')
            .parse()
            .map_err(|_| format!("bad job spec: {arg}"))?,
        None => state.jobs.last_id().ok_or_else(|| "no current job".to_string())?,
    };
    if state.jobs.find(id).is_none() {
        return Err(format!("no such job: %{id}"));
    }
    Ok(id)
}

/// Brings a job to the foreground: continue its group, hand it the
/// terminal, and wait for it like a freshly launched pipeline.
fn builtin_fg(state: &mut State, args: &[String]) -> i32 {
    let id = match resolve_job_id(state, args) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("jsh: fg: {e}");
            return 1;
        }
    };
    let job = state.jobs.find_mut(id).unwrap();
    job.background = false;
    job.mark_continued();
    let pgid = job.pgid;
    job::give_terminal_to(pgid);
    let _ = killpg(pgid, Signal::SIGCONT);
    let end_state = job::wait_foreground(&mut state.jobs, id);
    job::reclaim_terminal();
    match end_state {
        JobState::Stopped => 128 + Signal::SIGTSTP as i32,
        _ => state.jobs.find(id).map(|job| job.last_status()).unwrap_or(0),
    }
}

fn builtin_bg(state: &mut State, args: &[String]) -> i32 {
    let id = match resolve_job_id(state, args) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("jsh: bg: {e}");
            return 1;
        }
    };
    let job = state.jobs.find_mut(id).unwrap();
    job.background = true;
    let was_stopped = job.state() == JobState::Stopped;
    job.mark_continued();
    let pgid = job.pgid;
    let line = job.line.clone();
    let _ = killpg(pgid, Signal::SIGCONT);
    if was_stopped {
        eprintln!("[{id}] continued\t{line}");
    }
    0
}

/// Job-level cancellation: the termination signal reaches every process
/// in the group, and stopped groups are continued so they can die.
fn builtin_kill(state: &mut State, args: &[String]) -> i32 {
    let id = match resolve_job_id(state, args) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("jsh: kill: {e}");
            return 1;
        }
    };
    let pgid = state.jobs.find(id).unwrap().pgid;
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        eprintln!("jsh: kill: %{id}: {e}");
        return 1;
    }
    let _ = killpg(pgid, Signal::SIGCONT);
    0
}
