use serde::Serialize;
use std::fmt;
use uf_types::EventMask;

/// Kind of a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Modify,
    Delete,
    Access,
    Rename,
    /// The queue was full and at least one event was dropped.
    Overflow,
}

impl EventKind {
    /// Mask bit selecting this kind. `Overflow` is delivered regardless of
    /// the mask.
    #[must_use]
    pub fn mask_bit(self) -> Option<EventMask> {
        match self {
            Self::Create => Some(EventMask::CREATE),
            Self::Modify => Some(EventMask::MODIFY),
            Self::Delete => Some(EventMask::DELETE),
            Self::Access => Some(EventMask::ACCESS),
            Self::Rename => Some(EventMask::RENAME),
            Self::Overflow => None,
        }
    }

    #[must_use]
    pub fn matches(self, mask: EventMask) -> bool {
        self.mask_bit().is_none_or(|bit| mask.contains(bit))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Access => "access",
            Self::Rename => "rename",
            Self::Overflow => "overflow",
        };
        f.write_str(name)
    }
}

/// One delivered event. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Basename for a watch on the file itself, child name for a watch on
    /// its directory. Empty for `Overflow`.
    pub name: String,
    /// Pairs the two halves of a rename. Zero otherwise.
    pub cookie: u32,
    /// Global, monotonically increasing.
    pub seq: u64,
}

impl Event {
    #[must_use]
    pub fn new(kind: EventKind, name: impl Into<String>, cookie: u32, seq: u64) -> Self {
        Self {
            kind,
            name: name.into(),
            cookie,
            seq,
        }
    }

    /// Marker standing in for the events dropped at `seq` and after.
    #[must_use]
    pub fn overflow(seq: u64) -> Self {
        Self::new(EventKind::Overflow, String::new(), 0, seq)
    }

    #[must_use]
    pub fn is_overflow(&self) -> bool {
        self.kind == EventKind::Overflow
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}", self.seq, self.kind)?;
        if !self.name.is_empty() {
            write!(f, " {}", self.name)?;
        }
        if self.cookie != 0 {
            write!(f, " cookie={}", self.cookie)?;
        }
        Ok(())
    }
}
