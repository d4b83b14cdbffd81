use std::fmt;
use std::io;
use std::mem;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::errors::LaunchError;

/// Retries a wrapped syscall until it stops failing with EINTR.
pub fn retry_eintr<T>(mut f: impl FnMut() -> nix::Result<T>) -> nix::Result<T> {
    loop {
        match f() {
            Err(Errno::EINTR) => continue,
            other => return other,
        }
    }
}

/// Aggregate state of a job, derived from its processes: the minimum of
/// the per-process states, so one running process keeps the job `Running`
/// and the job is `Done` only when every process has terminated.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum JobState {
    Running,
    Stopped,
    Done,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobState::Running => write!(f, "running"),
            JobState::Stopped => write!(f, "stopped"),
            JobState::Done => write!(f, "done"),
        }
    }
}

pub trait WaitStatusExt {
    fn pid(self) -> Option<Pid>;
    fn proc_state(self) -> JobState;
}

impl WaitStatusExt for WaitStatus {
    fn pid(self) -> Option<Pid> {
        match self {
            WaitStatus::Exited(pid, _)
            | WaitStatus::Signaled(pid, _, _)
            | WaitStatus::Stopped(pid, _)
            | WaitStatus::Continued(pid) => Some(pid),
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitStatus::PtraceEvent(pid, _, _) | WaitStatus::PtraceSyscall(pid) => Some(pid),
            WaitStatus::StillAlive => None,
        }
    }

    fn proc_state(self) -> JobState {
        match self {
            WaitStatus::Exited(..) | WaitStatus::Signaled(..) => JobState::Done,
            WaitStatus::Stopped(..) => JobState::Stopped,
            #[cfg(any(target_os = "linux", target_os = "android"))]
            WaitStatus::PtraceEvent(..) | WaitStatus::PtraceSyscall(..) => JobState::Stopped,
            WaitStatus::Continued(..) | WaitStatus::StillAlive => JobState::Running,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Proc {
    pub pid: Pid,
    pub status: WaitStatus,
}

/// A launched pipeline: one process per stage, insertion order = pipeline
/// order. Mutated only through `JobSet::update` and the fg/bg builtins.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: usize,
    pub pgid: Pid,
    pub procs: Vec<Proc>,
    pub background: bool,
    pub line: String,
}

impl Job {
    pub fn state(&self) -> JobState {
        self.procs
            .iter()
            .map(|p| p.status.proc_state())
            .min()
            .unwrap_or(JobState::Done)
    }

    /// Exit statuses, one per stage in pipeline order. Meaningful once the
    /// job is `Done`; a death by signal reports as 128 + signal number.
    pub fn exit_statuses(&self) -> Vec<i32> {
        self.procs
            .iter()
            .map(|p| match p.status {
                WaitStatus::Exited(_, code) => code,
                WaitStatus::Signaled(_, sig, _) => 128 + sig as i32,
                _ => 0,
            })
            .collect()
    }

    pub fn last_status(&self) -> i32 {
        self.exit_statuses().last().copied().unwrap_or(0)
    }

    /// Marks stopped processes as running again, ahead of the Continued
    /// notifications a SIGCONT will produce, so a wait on this job blocks
    /// instead of seeing the stale stopped state.
    pub fn mark_continued(&mut self) {
        for proc_ in &mut self.procs {
            if proc_.status.proc_state() == JobState::Stopped {
                proc_.status = WaitStatus::StillAlive;
            }
        }
    }
}

/// Accumulates the processes of one pipeline while they are being spawned,
/// placing every one of them in a single process group.
#[derive(Debug)]
pub struct JobBuilder {
    pgid: Option<Pid>,
    procs: Vec<Proc>,
}

impl JobBuilder {
    pub fn new(size_hint: usize) -> JobBuilder {
        JobBuilder {
            pgid: None,
            procs: Vec::with_capacity(size_hint),
        }
    }

    /// Forks once. The first child becomes the group leader; both sides
    /// call setpgid so the group exists no matter which side runs first.
    pub fn push_fork(&mut self) -> Result<ForkResult, LaunchError> {
        let result = unsafe { unistd::fork() }.map_err(LaunchError::Fork)?;
        match result {
            ForkResult::Parent { child } => {
                let pgid = *self.pgid.get_or_insert(child);
                // may race with the exec'd child; the child-side call won
                let _ = unistd::setpgid(child, pgid);
                self.procs.push(Proc {
                    pid: child,
                    status: WaitStatus::StillAlive,
                });
            }
            ForkResult::Child => {
                let this = Pid::from_raw(0);
                let _ = unistd::setpgid(this, self.pgid.unwrap_or(this));
            }
        }
        Ok(result)
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn build(self, line: &str, background: bool) -> Job {
        assert!(!self.procs.is_empty());
        Job {
            id: 0,
            pgid: self.pgid.unwrap(),
            procs: self.procs,
            background,
            line: line.to_string(),
        }
    }
}

/// A job's aggregate state changed.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct JobEvent {
    pub job_id: usize,
    pub state: JobState,
}

/// The process-wide job registry. Slots are reused, so job ids stay small;
/// ids are 1-based. All mutation happens on the controlling thread.
#[derive(Debug, Default)]
pub struct JobSet {
    jobs: Vec<Option<Job>>,
    events: Vec<JobEvent>,
}

impl JobSet {
    pub fn new() -> JobSet {
        JobSet::default()
    }

    pub fn register(&mut self, mut job: Job) -> usize {
        let idx = match self.jobs.iter().position(|slot| slot.is_none()) {
            Some(idx) => idx,
            None => {
                self.jobs.push(None);
                self.jobs.len() - 1
            }
        };
        job.id = idx + 1;
        let id = job.id;
        self.jobs[idx] = Some(job);
        id
    }

    pub fn find(&self, id: usize) -> Option<&Job> {
        self.jobs.get(id.checked_sub(1)?)?.as_ref()
    }

    pub fn find_mut(&mut self, id: usize) -> Option<&mut Job> {
        self.jobs.get_mut(id.checked_sub(1)?)?.as_mut()
    }

    pub fn remove(&mut self, id: usize) -> Option<Job> {
        let job = self.jobs.get_mut(id.checked_sub(1)?)?.take();
        while matches!(self.jobs.last(), Some(None)) {
            self.jobs.pop();
        }
        job
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter().flatten()
    }

    /// Highest live job id, the default target for fg/bg/kill.
    pub fn last_id(&self) -> Option<usize> {
        self.jobs.iter().rev().flatten().next().map(|job| job.id)
    }

    /// Applies one wait notification to the owning job. A notification for
    /// a pid no job owns (already reaped, or never ours) is a no-op.
    pub fn update(&mut self, status: WaitStatus) {
        let Some(pid) = status.pid() else { return };
        for slot in self.jobs.iter_mut() {
            let Some(job) = slot.as_mut() else { continue };
            if !job.procs.iter().any(|p| p.pid == pid) {
                continue;
            }
            let before = job.state();
            job.procs
                .iter_mut()
                .find(|p| p.pid == pid)
                .unwrap()
                .status = status;
            let after = job.state();
            if before != after {
                self.events.push(JobEvent {
                    job_id: job.id,
                    state: after,
                });
            }
            return;
        }
    }

    pub fn take_events(&mut self) -> Vec<JobEvent> {
        mem::take(&mut self.events)
    }
}

/// Blocks collecting notifications until the given job leaves `Running`,
/// feeding every status into the table on the way (a background job may
/// finish while a foreground job runs). The only suspension point in the
/// interpreter.
pub fn wait_foreground(jobs: &mut JobSet, id: usize) -> JobState {
    loop {
        match jobs.find(id).map(Job::state) {
            None => return JobState::Done,
            Some(JobState::Running) => {}
            Some(state) => return state,
        }
        match retry_eintr(|| waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WUNTRACED))) {
            Ok(status) => jobs.update(status),
            // no children left: only reachable if something else reaped them
            Err(_) => return JobState::Done,
        }
    }
}

/// Collects every pending notification without blocking. Called when the
/// interpreter is idle, before reading the next line.
pub fn drain_background(jobs: &mut JobSet) {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        match retry_eintr(|| waitpid(Pid::from_raw(-1), Some(flags))) {
            Ok(WaitStatus::StillAlive) | Err(Errno::ECHILD) => return,
            Ok(status) => jobs.update(status),
            Err(_) => return,
        }
    }
}

/// Hands the controlling terminal to a job's process group. Best effort:
/// without a terminal there is nothing to hand over.
pub fn give_terminal_to(pgid: Pid) {
    let _ = unistd::tcsetpgrp(io::stdin(), pgid);
}

pub fn reclaim_terminal() {
    let _ = unistd::tcsetpgrp(io::stdin(), unistd::getpgrp());
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    fn running_job(pids: &[i32]) -> Job {
        Job {
            id: 0,
            pgid: Pid::from_raw(pids[0]),
            procs: pids
                .iter()
                .map(|&pid| Proc {
                    pid: Pid::from_raw(pid),
                    status: WaitStatus::StillAlive,
                })
                .collect(),
            background: false,
            line: "test".to_string(),
        }
    }

    fn exited(pid: i32, code: i32) -> WaitStatus {
        WaitStatus::Exited(Pid::from_raw(pid), code)
    }

    #[test]
    fn register_assigns_one_based_ids_and_reuses_slots() {
        let mut jobs = JobSet::new();
        let a = jobs.register(running_job(&[10]));
        let b = jobs.register(running_job(&[20]));
        assert_eq!((a, b), (1, 2));
        jobs.remove(a);
        assert_eq!(jobs.register(running_job(&[30])), 1);
        assert_eq!(jobs.last_id(), Some(2));
    }

    #[test]
    fn job_stays_running_until_every_process_exits() {
        let mut jobs = JobSet::new();
        let id = jobs.register(running_job(&[10, 11]));
        jobs.update(exited(10, 0));
        assert_eq!(jobs.find(id).unwrap().state(), JobState::Running);
        assert!(jobs.take_events().is_empty());

        jobs.update(exited(11, 1));
        assert_eq!(jobs.find(id).unwrap().state(), JobState::Done);
        assert_eq!(
            jobs.take_events(),
            vec![JobEvent {
                job_id: id,
                state: JobState::Done,
            }]
        );
    }

    #[test]
    fn exit_statuses_keep_pipeline_order() {
        let mut jobs = JobSet::new();
        let id = jobs.register(running_job(&[10, 11]));
        // reaped out of order
        jobs.update(exited(11, 3));
        jobs.update(exited(10, 0));
        assert_eq!(jobs.find(id).unwrap().exit_statuses(), vec![0, 3]);
        assert_eq!(jobs.find(id).unwrap().last_status(), 3);
    }

    #[test]
    fn signaled_process_reports_128_plus_signal() {
        let mut jobs = JobSet::new();
        let id = jobs.register(running_job(&[10]));
        jobs.update(WaitStatus::Signaled(
            Pid::from_raw(10),
            Signal::SIGTERM,
            false,
        ));
        assert_eq!(jobs.find(id).unwrap().exit_statuses(), vec![143]);
    }

    #[test]
    fn stopped_job_requires_no_running_process() {
        let mut jobs = JobSet::new();
        let id = jobs.register(running_job(&[10, 11]));
        jobs.update(WaitStatus::Stopped(Pid::from_raw(10), Signal::SIGTSTP));
        assert_eq!(jobs.find(id).unwrap().state(), JobState::Running);
        assert!(jobs.take_events().is_empty());

        jobs.update(exited(11, 0));
        assert_eq!(jobs.find(id).unwrap().state(), JobState::Stopped);
        assert_eq!(
            jobs.take_events(),
            vec![JobEvent {
                job_id: id,
                state: JobState::Stopped,
            }]
        );

        jobs.update(WaitStatus::Continued(Pid::from_raw(10)));
        assert_eq!(jobs.find(id).unwrap().state(), JobState::Running);
    }

    #[test]
    fn unknown_pid_notification_is_a_no_op() {
        let mut jobs = JobSet::new();
        jobs.register(running_job(&[10]));
        jobs.update(exited(99, 0));
        assert!(jobs.take_events().is_empty());
    }

    #[test]
    fn double_notification_does_not_duplicate_the_event() {
        let mut jobs = JobSet::new();
        let id = jobs.register(running_job(&[10]));
        jobs.update(exited(10, 0));
        jobs.update(exited(10, 0));
        assert_eq!(jobs.take_events().len(), 1);

        jobs.remove(id);
        jobs.update(exited(10, 0));
        assert!(jobs.take_events().is_empty());
    }

    #[test]
    fn no_two_jobs_share_a_pid() {
        let mut jobs = JobSet::new();
        let a = jobs.register(running_job(&[10]));
        let b = jobs.register(running_job(&[20]));
        jobs.update(exited(20, 7));
        assert_eq!(jobs.find(a).unwrap().state(), JobState::Running);
        assert_eq!(jobs.find(b).unwrap().exit_statuses(), vec![7]);
    }
}
