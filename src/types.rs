use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

// 类型定义
pub type GroupId = String;
pub type NodeId = String;
pub type Payload = Vec<u8>;

/// Election role of a node inside its log group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Follower,
    /// Running a non-binding pre-vote round; term is not bumped yet.
    PreCandidate,
    Candidate,
    Leader,
}

impl Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::PreCandidate => write!(f, "PreCandidate"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

/// Outcome of a push, pre-vote or vote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Agree,
    Reject,
}

impl Verdict {
    pub fn from_bool(agree: bool) -> Self {
        if agree { Verdict::Agree } else { Verdict::Reject }
    }

    pub fn is_agree(self) -> bool {
        self == Verdict::Agree
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Agree => write!(f, "AGREE"),
            Verdict::Reject => write!(f, "REJECT"),
        }
    }
}
