use std::fs::{File, OpenOptions};
use std::os::fd::OwnedFd;

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

use crate::errors::{LaunchError, RedirectError, ShellError};
use crate::types::Pipeline;

/// Where a stage's standard input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Inherit,
    Pipe(usize),
    File(String),
}

/// Where a stage's standard output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sink {
    Inherit,
    Pipe(usize),
    File { path: String, append: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stdin: Source,
    pub stdout: Sink,
}

/// Computes the per-stage descriptor plan. Pure: no descriptor is created.
///
/// Stage i reads from pipe i-1 unless it is first, writes to pipe i unless
/// it is last; an explicit redirection overrides the pipe-derived endpoint.
pub fn plan(pipeline: &Pipeline) -> Vec<StagePlan> {
    let last = pipeline.stages.len() - 1;
    pipeline
        .stages
        .iter()
        .enumerate()
        .map(|(i, stage)| {
            let stdin = match &stage.input {
                Some(path) => Source::File(path.clone()),
                None if i > 0 => Source::Pipe(i - 1),
                None => Source::Inherit,
            };
            let stdout = match &stage.output {
                Some(redirect) => Sink::File {
                    path: redirect.path.clone(),
                    append: redirect.append,
                },
                None if i < last => Sink::Pipe(i),
                None => Sink::Inherit,
            };
            StagePlan { stdin, stdout }
        })
        .collect()
}

/// Owned descriptor assignments for one stage. `None` inherits the shell's
/// own descriptor.
#[derive(Debug, Default)]
pub struct StageFds {
    pub stdin: Option<OwnedFd>,
    pub stdout: Option<OwnedFd>,
}

/// Opens redirection targets and creates the N-1 pipe pairs for a plan.
///
/// Redirection targets are opened first, so a bad path aborts the pipeline
/// before any pipe or process exists. Pipes are created close-on-exec; a
/// pipe half displaced by a redirection is dropped here, which gives the
/// stage on the other end an immediate EOF or EPIPE.
pub fn realize(plans: &[StagePlan]) -> Result<Vec<StageFds>, ShellError> {
    let mut fds: Vec<StageFds> = plans.iter().map(|_| StageFds::default()).collect();

    for (i, plan) in plans.iter().enumerate() {
        if let Source::File(path) = &plan.stdin {
            let file = File::open(path).map_err(|e| RedirectError {
                path: path.clone(),
                source: e,
            })?;
            fds[i].stdin = Some(file.into());
        }
        if let Sink::File { path, append } = &plan.stdout {
            let mut options = OpenOptions::new();
            if *append {
                options.append(true);
            } else {
                options.write(true).truncate(true);
            }
            let file = options.create(true).open(path).map_err(|e| RedirectError {
                path: path.clone(),
                source: e,
            })?;
            fds[i].stdout = Some(file.into());
        }
    }

    for i in 0..plans.len().saturating_sub(1) {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(LaunchError::Pipe)?;
        if plans[i].stdout == Sink::Pipe(i) {
            fds[i].stdout = Some(write);
        }
        if plans[i + 1].stdin == Source::Pipe(i) {
            fds[i + 1].stdin = Some(read);
        }
    }

    Ok(fds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse;

    fn pipeline(line: &str) -> Pipeline {
        parse(tokenize(line).unwrap()).unwrap()
    }

    #[test]
    fn single_stage_inherits_both_ends() {
        let plans = plan(&pipeline("ls -l"));
        assert_eq!(
            plans,
            vec![StagePlan {
                stdin: Source::Inherit,
                stdout: Sink::Inherit,
            }]
        );
    }

    #[test]
    fn stages_reference_only_adjacent_pipes() {
        let plans = plan(&pipeline("a | b | c"));
        assert_eq!(plans.len(), 3);
        assert_eq!(plans[0].stdin, Source::Inherit);
        assert_eq!(plans[0].stdout, Sink::Pipe(0));
        assert_eq!(plans[1].stdin, Source::Pipe(0));
        assert_eq!(plans[1].stdout, Sink::Pipe(1));
        assert_eq!(plans[2].stdin, Source::Pipe(1));
        assert_eq!(plans[2].stdout, Sink::Inherit);
    }

    #[test]
    fn redirection_overrides_the_pipe_endpoint() {
        let plans = plan(&pipeline("a > out | b"));
        assert_eq!(
            plans[0].stdout,
            Sink::File {
                path: "out".to_string(),
                append: false,
            }
        );
        // the boundary still exists for stage 1, which will see EOF
        assert_eq!(plans[1].stdin, Source::Pipe(0));
    }

    #[test]
    fn realize_assigns_both_halves_of_each_pipe() {
        let fds = realize(&plan(&pipeline("a | b"))).unwrap();
        assert!(fds[0].stdin.is_none());
        assert!(fds[0].stdout.is_some());
        assert!(fds[1].stdin.is_some());
        assert!(fds[1].stdout.is_none());
    }

    #[test]
    fn realize_opens_output_targets_eagerly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let line = format!("ls > {}", path.display());
        let fds = realize(&plan(&pipeline(&line))).unwrap();
        assert!(path.exists());
        assert!(fds[0].stdout.is_some());
    }

    #[test]
    fn bad_redirect_target_fails_before_any_pipe() {
        let err = realize(&plan(&pipeline("ls > /no/such/dir/x"))).unwrap_err();
        match err {
            ShellError::Redirect(e) => assert_eq!(e.path, "/no/such/dir/x"),
            other => panic!("expected RedirectError, got {other:?}"),
        }
    }

    #[test]
    fn missing_input_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        let line = format!("wc < {}", path.display());
        assert!(matches!(
            realize(&plan(&pipeline(&line))),
            Err(ShellError::Redirect(_))
        ));
    }
}
