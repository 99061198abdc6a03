//! Keyspace notification channels.
//!
//! Redis emits two channel families when `notify-keyspace-events` is set:
//! - `__keyspace@<db>__:<key>` with the event name (`set`, `del`, ...) as payload
//! - `__keyevent@<db>__:<event>` with the key name as payload
//!
//! Subscribing to these through the broker turns key changes into events.

use std::fmt;

const KEYSPACE_PREFIX: &str = "__keyspace@";
const KEYEVENT_PREFIX: &str = "__keyevent@";
const DB_SUFFIX: &str = "__:";

/// A parsed keyspace notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyspaceChannel {
    /// `__keyspace@<db>__:<key>`
    Keyspace { db: u32, key: String },
    /// `__keyevent@<db>__:<event>`
    Keyevent { db: u32, event: String },
}

impl KeyspaceChannel {
    /// Parse a concrete channel name. Returns `None` for ordinary channels.
    pub fn parse(channel: &str) -> Option<Self> {
        if let Some(rest) = channel.strip_prefix(KEYSPACE_PREFIX) {
            let (db, key) = split_db(rest)?;
            return Some(Self::Keyspace {
                db,
                key: key.to_string(),
            });
        }
        if let Some(rest) = channel.strip_prefix(KEYEVENT_PREFIX) {
            let (db, event) = split_db(rest)?;
            return Some(Self::Keyevent {
                db,
                event: event.to_string(),
            });
        }
        None
    }

    pub fn db(&self) -> u32 {
        match self {
            Self::Keyspace { db, .. } | Self::Keyevent { db, .. } => *db,
        }
    }
}

impl fmt::Display for KeyspaceChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Keyspace { db, key } => write!(f, "{}{}{}{}", KEYSPACE_PREFIX, db, DB_SUFFIX, key),
            Self::Keyevent { db, event } => {
                write!(f, "{}{}{}{}", KEYEVENT_PREFIX, db, DB_SUFFIX, event)
            }
        }
    }
}

fn split_db(rest: &str) -> Option<(u32, &str)> {
    let (db, tail) = rest.split_once(DB_SUFFIX)?;
    Some((db.parse().ok()?, tail))
}

/// Pattern for keyspace notifications on keys matching `key_glob`.
pub fn keyspace_pattern(db: u32, key_glob: &str) -> String {
    format!("{}{}{}{}", KEYSPACE_PREFIX, db, DB_SUFFIX, key_glob)
}

/// Pattern for keyevent notifications on events matching `event_glob`.
pub fn keyevent_pattern(db: u32, event_glob: &str) -> String {
    format!("{}{}{}{}", KEYEVENT_PREFIX, db, DB_SUFFIX, event_glob)
}
