//! The closed set of task kinds a session server can run, and the argument
//! arity the protocol enforces for each before `TASK_RUN` is accepted.

use std::{convert::TryFrom, fmt};

/// A task kind named in `TASK_BEGIN`.
///
/// Grounded on the `taskmap` lookup table: a fixed, closed enumeration
/// rather than an open string, so an unrecognized kind is rejected before
/// any argument is even read off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TaskKind {
    /// No task: the client-side sentinel for session open/close-only
    /// invocations (spec.md's `none` CLI task).
    None = 0,
    GetConf = 1,
    KillUid = 2,
    GetUgid1 = 3,
    Chrootuid1 = 4,
    GetUgid2 = 5,
    Chrootuid2 = 6,
    MakeDev = 7,
    MakeTty = 8,
    MakeConsole = 9,
    Mount = 10,
    Umount = 11,
}

impl TaskKind {
    pub const ALL: [TaskKind; 12] = [
        Self::None,
        Self::GetConf,
        Self::KillUid,
        Self::GetUgid1,
        Self::Chrootuid1,
        Self::GetUgid2,
        Self::Chrootuid2,
        Self::MakeDev,
        Self::MakeTty,
        Self::MakeConsole,
        Self::Mount,
        Self::Umount,
    ];

    /// The name used on the client command line and in log messages.
    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GetConf => "getconf",
            Self::KillUid => "killuid",
            Self::GetUgid1 => "getugid1",
            Self::Chrootuid1 => "chrootuid1",
            Self::GetUgid2 => "getugid2",
            Self::Chrootuid2 => "chrootuid2",
            Self::MakeDev => "makedev",
            Self::MakeTty => "maketty",
            Self::MakeConsole => "makeconsole",
            Self::Mount => "mount",
            Self::Umount => "umount",
        }
    }

    /// The exact argument count required, or `None` when the task takes a
    /// variable, non-empty tail (`chrootuid1`/`chrootuid2`'s program argv).
    pub fn required_args(self) -> Option<usize> {
        match self {
            Self::None | Self::GetConf | Self::KillUid | Self::GetUgid1 | Self::GetUgid2 => Some(0),
            Self::MakeDev | Self::MakeTty | Self::MakeConsole | Self::Umount => Some(1),
            Self::Mount => Some(2),
            Self::Chrootuid1 | Self::Chrootuid2 => None,
        }
    }

    /// Whether an argument count satisfies [`Self::required_args`].
    pub fn accepts_arg_count(self, count: usize) -> bool {
        match self.required_args() {
            Some(required) => count == required,
            None => count >= 2,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|task| task.name() == s)
            .ok_or(crate::Error::Protocol("unknown task name"))
    }
}

impl TryFrom<u32> for TaskKind {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|task| *task as u32 == value)
            .ok_or(crate::Error::UnknownTask(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_round_trips_through_its_name() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.name().parse::<TaskKind>().unwrap(), kind);
        }
    }

    #[test]
    fn every_kind_round_trips_through_its_wire_value() {
        for kind in TaskKind::ALL {
            assert_eq!(TaskKind::try_from(kind as u32).unwrap(), kind);
        }
    }

    #[test]
    fn none_round_trips_by_name_and_wire_value() {
        assert_eq!("none".parse::<TaskKind>().unwrap(), TaskKind::None);
        assert_eq!(TaskKind::None.name(), "none");
        assert_eq!(TaskKind::try_from(0).unwrap(), TaskKind::None);
        assert_eq!(TaskKind::None as u32, 0);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("not-a-task".parse::<TaskKind>().is_err());
    }

    #[test]
    fn chrootuid_requires_at_least_a_home_and_user() {
        assert!(!TaskKind::Chrootuid1.accepts_arg_count(1));
        assert!(TaskKind::Chrootuid1.accepts_arg_count(2));
        assert!(TaskKind::Chrootuid1.accepts_arg_count(5));
    }

    #[test]
    fn fixed_arity_tasks_reject_any_other_count() {
        assert!(TaskKind::Mount.accepts_arg_count(2));
        assert!(!TaskKind::Mount.accepts_arg_count(1));
        assert!(!TaskKind::Mount.accepts_arg_count(3));
    }
}
