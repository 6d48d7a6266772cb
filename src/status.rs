//! Endpoint health as seen by the balancer.

use std::fmt;

/// Availability of a factory or service.
///
/// Ordered from least to most usable: `Closed < Busy < Open`. Wrapping layers combine their own
/// state with their child's using [`Status::worst`]; the balancer aggregates members with
/// [`Status::best`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Status {
    /// Permanently unusable.
    Closed,
    /// Temporarily unable to take new work. Acquisitions may fail fast.
    Busy,
    /// Ready to dispatch.
    Open,
}

impl Status {
    pub fn is_open(self) -> bool {
        self == Status::Open
    }

    pub fn is_busy(self) -> bool {
        self == Status::Busy
    }

    pub fn is_closed(self) -> bool {
        self == Status::Closed
    }

    /// The less usable of two statuses.
    pub fn worst(self, other: Status) -> Status {
        self.min(other)
    }

    /// The more usable of two statuses.
    pub fn best(self, other: Status) -> Status {
        self.max(other)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Open => "open",
            Status::Busy => "busy",
            Status::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Anything that can report a [`Status`] synchronously.
///
/// Implemented by the tower services in the dispatch stack so the requeue layer can consult the
/// balancer below it.
pub trait Availability {
    fn status(&self) -> Status;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_and_best_follow_ordering() {
        assert_eq!(Status::Open.worst(Status::Busy), Status::Busy);
        assert_eq!(Status::Busy.worst(Status::Closed), Status::Closed);
        assert_eq!(Status::Busy.best(Status::Open), Status::Open);
        assert_eq!(Status::Closed.best(Status::Busy), Status::Busy);
        assert_eq!(Status::Open.worst(Status::Open), Status::Open);
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(Status::Busy.to_string(), "busy");
    }
}
