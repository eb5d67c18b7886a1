//! Task record and the per-conversation state machine (spec.md §4.4).

use crate::error::Error;
use hasher_priv_proto::TaskKind;
use std::os::unix::io::RawFd;

/// The sequence a conversation moves through. Transitions are linear;
/// `TaskRun` both terminates the conversation and is the only command
/// that produces the client-visible final status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Begin,
    Fds,
    Arguments,
    Environ,
    Run,
}

/// Transient per-conversation record, built incrementally across the
/// commands of one accepted connection.
#[derive(Debug, Default)]
pub struct TaskRecord {
    pub kind: Option<TaskKind>,
    pub caller_num: u32,
    pub fds: Option<[RawFd; 3]>,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl TaskRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// `TASK_BEGIN`: store the task kind and caller index.
    pub fn begin(&mut self, kind: TaskKind, caller_num: u32) {
        self.kind = Some(kind);
        self.caller_num = caller_num;
    }

    /// `TASK_FDS`: install the three stdio descriptors, closing any
    /// descriptors installed by a prior `TASK_FDS` on this record first
    /// (spec.md §8: "no fd leak").
    pub fn set_fds(&mut self, fds: [RawFd; 3]) {
        if let Some(old) = self.fds.take() {
            for fd in old {
                let _ = nix::unistd::close(fd);
            }
        }
        self.fds = Some(fds);
    }

    /// `TASK_ARGUMENTS`: replace argv and validate arity against the
    /// stored task kind.
    pub fn set_arguments(&mut self, argv: Vec<String>) -> Result<(), Error> {
        let kind = self
            .kind
            .ok_or_else(|| Error::protocol("TASK_ARGUMENTS before TASK_BEGIN"))?;
        if !kind.accepts_arg_count(argv.len()) {
            return Err(Error::validation(format!(
                "task {} requires {}, got {}",
                kind,
                arity_description(kind),
                argv.len()
            )));
        }
        if matches!(kind, TaskKind::Chrootuid1 | TaskKind::Chrootuid2) {
            if let Some(path) = argv.first() {
                if !path.starts_with('/') {
                    return Err(Error::validation("chroot path argument must be absolute"));
                }
            }
        }
        self.argv = argv;
        Ok(())
    }

    /// `TASK_ENVIRON`: replace envp unconditionally.
    pub fn set_environ(&mut self, envp: Vec<String>) {
        self.envp = envp;
    }
}

impl Drop for TaskRecord {
    fn drop(&mut self) {
        if let Some(fds) = self.fds.take() {
            for fd in fds {
                let _ = nix::unistd::close(fd);
            }
        }
    }
}

fn arity_description(kind: TaskKind) -> String {
    match kind.required_args() {
        Some(n) => format!("exactly {}", n),
        None => "at least 2".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_mismatch_is_rejected() {
        let mut record = TaskRecord::new();
        record.begin(TaskKind::Mount, 0);
        let err = record.set_arguments(vec!["/mnt".to_string()]).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn chrootuid_requires_absolute_path() {
        let mut record = TaskRecord::new();
        record.begin(TaskKind::Chrootuid1, 0);
        let err = record
            .set_arguments(vec!["relative".to_string(), "/bin/true".to_string()])
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);
    }

    #[test]
    fn matching_arity_is_accepted() {
        let mut record = TaskRecord::new();
        record.begin(TaskKind::Mount, 0);
        record
            .set_arguments(vec!["/mnt/src".to_string(), "/mnt/dst".to_string()])
            .unwrap();
        assert_eq!(record.argv.len(), 2);
    }

    #[test]
    fn second_set_fds_closes_the_first_triple() {
        let mut record = TaskRecord::new();
        let (a0, a1) = nix::unistd::pipe().unwrap();
        let (b0, b1) = nix::unistd::pipe().unwrap();
        let (c0, c1) = nix::unistd::pipe().unwrap();
        record.set_fds([a0, a1, b0]);
        // Second install must not leak the first triple; `is_open` on a
        // raw fd we just closed should fail.
        let first = [a0, a1, b0];
        record.set_fds([b1, c0, c1]);
        for fd in first {
            assert!(nix::fcntl::fcntl(fd, nix::fcntl::FcntlArg::F_GETFD).is_err());
        }
    }
}
