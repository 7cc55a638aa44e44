//! Read/write concerns and session or transaction options.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Required acknowledgement for a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acknowledgement {
    Nodes(u32),
    Majority,
    Tag(String),
}

/// Write concern sent with commit and abort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteConcern {
    pub w: Option<Acknowledgement>,
    pub w_timeout: Option<Duration>,
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        Self {
            w: Some(Acknowledgement::Majority),
            ..Self::default()
        }
    }

    pub fn unacknowledged() -> Self {
        Self {
            w: Some(Acknowledgement::Nodes(0)),
            ..Self::default()
        }
    }

    /// `w: 0` without journaling is the only unacknowledged form.
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self.w, Some(Acknowledgement::Nodes(0))) || self.journal == Some(true)
    }

    pub fn with_w(mut self, w: Acknowledgement) -> Self {
        self.w = Some(w);
        self
    }

    pub fn with_w_timeout(mut self, w_timeout: Option<Duration>) -> Self {
        self.w_timeout = w_timeout;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConcernLevel {
    Local,
    Majority,
    Snapshot,
    Available,
    Linearizable,
}

/// Read concern. An unset level defers to the server default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    pub level: Option<ReadConcernLevel>,
}

impl ReadConcern {
    pub fn with_level(level: ReadConcernLevel) -> Self {
        Self { level: Some(level) }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadPreference {
    #[default]
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

/// Per-transaction options. Unset fields fall back to the session defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub read_concern: Option<ReadConcern>,
    pub read_preference: Option<ReadPreference>,
    pub write_concern: Option<WriteConcern>,
    pub max_commit_time: Option<Duration>,
}

impl TransactionOptions {
    pub fn with_write_concern(mut self, write_concern: WriteConcern) -> Self {
        self.write_concern = Some(write_concern);
        self
    }

    pub fn with_read_concern(mut self, read_concern: ReadConcern) -> Self {
        self.read_concern = Some(read_concern);
        self
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    pub fn with_max_commit_time(mut self, max_commit_time: Duration) -> Self {
        self.max_commit_time = Some(max_commit_time);
        self
    }

    /// Fill every unset field from `defaults`, then from the built-in
    /// defaults. The result has every field except `max_commit_time` set.
    pub fn effective(requested: Option<&Self>, defaults: Option<&Self>) -> Self {
        Self {
            read_concern: Some(
                requested
                    .and_then(|o| o.read_concern)
                    .or_else(|| defaults.and_then(|o| o.read_concern))
                    .unwrap_or_default(),
            ),
            read_preference: Some(
                requested
                    .and_then(|o| o.read_preference)
                    .or_else(|| defaults.and_then(|o| o.read_preference))
                    .unwrap_or_default(),
            ),
            write_concern: Some(
                requested
                    .and_then(|o| o.write_concern.clone())
                    .or_else(|| defaults.and_then(|o| o.write_concern.clone()))
                    .unwrap_or_default(),
            ),
            max_commit_time: requested
                .and_then(|o| o.max_commit_time)
                .or_else(|| defaults.and_then(|o| o.max_commit_time)),
        }
    }
}

/// Options fixed for the lifetime of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreSessionOptions {
    pub is_causally_consistent: bool,
    pub is_implicit: bool,
    pub is_snapshot: bool,
    pub default_transaction_options: Option<TransactionOptions>,
}

impl CoreSessionOptions {
    pub fn implicit() -> Self {
        Self {
            is_implicit: true,
            ..Self::default()
        }
    }

    pub fn causally_consistent() -> Self {
        Self {
            is_causally_consistent: true,
            ..Self::default()
        }
    }

    pub fn snapshot() -> Self {
        Self {
            is_snapshot: true,
            ..Self::default()
        }
    }

    pub fn with_default_transaction_options(mut self, options: TransactionOptions) -> Self {
        self.default_transaction_options = Some(options);
        self
    }
}

/// Server session pool settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPoolSettings {
    /// Used when the cluster does not advertise a logical session timeout.
    pub logical_session_timeout: Option<Duration>,
}

impl Default for SessionPoolSettings {
    fn default() -> Self {
        Self {
            logical_session_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}
