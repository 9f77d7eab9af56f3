use crate::error::TraceError;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;

/// A process id as reported by the kernel.
///
/// Always strictly positive: a `0` coming from the tracer (the idle task as parent) is not a
/// pid and has to be handled by the caller before conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pid(NonZeroU32);

impl Pid {
    pub fn new(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Pid)
    }

    pub fn as_u32(self) -> u32 {
        self.0.get()
    }

    /// The pid as a `pid_t`, for syscalls and procfs.
    pub fn as_raw(self) -> libc::pid_t {
        self.0.get() as libc::pid_t
    }

    /// Display ordering used by every pid listing: shorter decimal strings first, then
    /// lexicographic.
    pub fn display_cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.to_string(), other.to_string());
        a.len().cmp(&b.len()).then_with(|| a.cmp(&b))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Pid {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u32>()
            .ok()
            .and_then(Pid::new)
            .ok_or_else(|| TraceError::InvalidPid(s.to_owned()))
    }
}

impl TryFrom<i32> for Pid {
    type Error = TraceError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        u32::try_from(raw)
            .ok()
            .and_then(Pid::new)
            .ok_or_else(|| TraceError::InvalidPid(raw.to_string()))
    }
}

/// Sort pids in display order, see [`Pid::display_cmp`].
pub fn sort_for_display(pids: &mut [Pid]) {
    pids.sort_by(Pid::display_cmp);
}
