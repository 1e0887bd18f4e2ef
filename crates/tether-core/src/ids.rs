//! Branded ID newtypes.
//!
//! Channels and threads are both identified by strings on the wire, but
//! mixing them up is always a bug. Each gets its own newtype so the
//! compiler keeps `(ThreadUid, ChannelId)` keys the right way round.
//!
//! Channel ids are minted locally as UUID v7 (time-ordered). Thread uids
//! come from the authenticator and are never generated here.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! branded_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from an existing string value.
            #[must_use]
            pub fn from_string(s: String) -> Self {
                Self(s)
            }

            /// Return the inner string as a slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume self and return the inner `String`.
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

branded_id! {
    /// Identifier of one physical duplex connection.
    ChannelId
}

branded_id! {
    /// Identifier of one logical topic. Stable across reconnects.
    ThreadUid
}

impl ChannelId {
    /// Mint a fresh channel id (UUID v7, time-ordered).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_new_is_uuid_v7() {
        let id = ChannelId::new();
        let parsed = Uuid::parse_str(id.as_str()).expect("should be valid UUID");
        assert_eq!(parsed.get_version(), Some(uuid::Version::SortRand));
    }

    #[test]
    fn channel_ids_are_unique() {
        assert_ne!(ChannelId::new(), ChannelId::default());
    }

    #[test]
    fn thread_uid_keeps_value() {
        let uid = ThreadUid::from("chat.room.42");
        assert_eq!(uid.as_str(), "chat.room.42");
        assert_eq!(format!("{uid}"), "chat.room.42");
        let s: String = uid.into();
        assert_eq!(s, "chat.room.42");
    }

    #[test]
    fn serde_is_transparent() {
        let uid = ThreadUid::from("t-1");
        let json = serde_json::to_string(&uid).unwrap();
        assert_eq!(json, "\"t-1\"");
        let back: ThreadUid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uid);
    }

    #[test]
    fn usable_as_compound_key() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        let _ = set.insert((ThreadUid::from("t"), ChannelId::from("c")));
        let _ = set.insert((ThreadUid::from("t"), ChannelId::from("c")));
        assert_eq!(set.len(), 1);
    }
}
