use std::fmt;

/// How a transaction's reads relate to concurrent publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Until its first write a transaction reads the current `main`; after
    /// that it reads its own branch.
    #[default]
    ReadCommitted,

    /// Every read sees `main` as of `begin`, plus the transaction's own
    /// writes. Publishing after `main` moved is a serialization failure.
    RepeatableRead,
}

impl IsolationLevel {
    pub fn uses_snapshot(&self) -> bool {
        matches!(self, IsolationLevel::RepeatableRead)
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadCommitted => write!(f, "read-committed"),
            IsolationLevel::RepeatableRead => write!(f, "repeatable-read"),
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace(['_', ' '], "-").as_str() {
            "read-committed" | "readcommitted" => Ok(IsolationLevel::ReadCommitted),
            "repeatable-read" | "repeatableread" | "snapshot" => Ok(IsolationLevel::RepeatableRead),
            _ => Err(format!("unknown isolation level: {}", s)),
        }
    }
}
