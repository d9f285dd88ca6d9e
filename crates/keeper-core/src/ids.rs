//! Branded ID newtypes.
//!
//! Conversations, workspaces, messages, and facts each get a distinct ID
//! type so a conversation ID can never be passed where a workspace ID is
//! expected. New IDs are UUID v7 (time-ordered).

use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! define_id {
    ($($(#[$meta:meta])* $name:ident;)+) => {$(
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Fresh time-ordered ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::now_v7().to_string())
            }

            /// Borrow the raw value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Deref for $name {
            type Target = str;

            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_owned())
            }
        }
    )+};
}

define_id! {
    /// A conversation (one transcript).
    ConversationId;
    /// A workspace. Protected canon is scoped per workspace.
    WorkspaceId;
    /// A persisted message.
    MessageId;
    /// A persisted fact.
    FactId;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ids_are_unique() {
        let a = ConversationId::new();
        let b = ConversationId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn v7_ids_sort_by_creation() {
        let first = MessageId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = MessageId::new();
        assert!(first < second);
    }

    #[test]
    fn serde_is_transparent() {
        let id = WorkspaceId::from("ws-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ws-1\"");
        let back: WorkspaceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn deref_and_display() {
        let id = FactId::from("fact-9");
        assert_eq!(&*id, "fact-9");
        assert_eq!(id.to_string(), "fact-9");
        assert_eq!(id.as_str(), "fact-9");
    }
}
