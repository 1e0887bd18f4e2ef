//! Registration admission.

use async_trait::async_trait;
use serde_json::Value;
use tether_channel::RequestInfo;
use tether_core::{RegisterBody, ThreadUid};
use tracing::debug;

/// Result of authenticating a registration.
#[derive(Clone, Debug, PartialEq)]
pub enum AuthOutcome {
    /// Subscribe the channel to `thread`.
    Accepted {
        /// Thread to subscribe.
        thread: ThreadUid,
        /// Opaque metadata stored on the connection record.
        info: Option<Value>,
    },
    /// Refuse the registration.
    Rejected {
        /// Sent back in the reject frame.
        reason: String,
    },
}

impl AuthOutcome {
    /// Accept without metadata.
    pub fn accept(thread: impl Into<ThreadUid>) -> Self {
        Self::Accepted {
            thread: thread.into(),
            info: None,
        }
    }

    /// Refuse with `reason`.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Decides whether a registration is admitted and which thread it maps to.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Authenticate `body`, sent over the socket opened by `request`.
    async fn authenticate(&self, request: &RequestInfo, body: &RegisterBody) -> AuthOutcome;
}

/// Accepts everything. Development only.
///
/// The thread is taken from the body's `thread` field when it is a string,
/// otherwise from its `type`. The upgrade request's origin is kept as info.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAuthenticator;

#[async_trait]
impl Authenticator for OpenAuthenticator {
    async fn authenticate(&self, request: &RequestInfo, body: &RegisterBody) -> AuthOutcome {
        let thread = body
            .field("thread")
            .and_then(Value::as_str)
            .unwrap_or(body.kind.as_str());
        debug!(thread, kind = %body.kind, "open authenticator admitting registration");
        AuthOutcome::Accepted {
            thread: ThreadUid::from(thread),
            info: request
                .origin
                .as_ref()
                .map(|origin| serde_json::json!({ "origin": origin })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn thread_field_wins_over_type() {
        let body = RegisterBody::new("default").with_field("thread", json!("room-7"));
        let outcome = OpenAuthenticator
            .authenticate(&RequestInfo::default(), &body)
            .await;
        assert_eq!(outcome, AuthOutcome::accept("room-7"));
    }

    #[tokio::test]
    async fn falls_back_to_type() {
        let request = RequestInfo {
            origin: Some("https://app.example".into()),
            ..RequestInfo::default()
        };
        let outcome = OpenAuthenticator
            .authenticate(&request, &RegisterBody::new("default"))
            .await;
        assert_eq!(
            outcome,
            AuthOutcome::Accepted {
                thread: ThreadUid::from("default"),
                info: Some(json!({"origin": "https://app.example"})),
            }
        );
    }
}
