// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote store and identity interfaces, plus error classification.
//!
//! The authoritative document store and the authentication layer live
//! outside this crate. The engine only needs:
//! - [`RemoteStore`]: fetch / persist one document by `(user, type, scope)`
//! - [`IdentityProvider`]: who is signed in right now
//!
//! Remote failures carry an optional code and HTTP-ish status. They are
//! mapped to an [`ErrorClass`] that drives circuit breaker accounting and
//! whether a failed write is worth replaying later.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::preference::PreferenceType;

/// Well-known error codes.
pub mod codes {
    pub const DOCUMENT_NOT_FOUND: &str = "document_not_found";
    pub const TIMEOUT: &str = "timeout";
    pub const NETWORK: &str = "network";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const PARSE: &str = "parse";
}

/// Error returned by a remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code={code:?}, status={status:?})")]
pub struct RemoteError {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            status: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn document_not_found() -> Self {
        Self::new("document not found").with_code(codes::DOCUMENT_NOT_FOUND)
    }

    pub fn timeout() -> Self {
        Self::new("request timed out").with_code(codes::TIMEOUT)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::NETWORK)
    }

    pub fn server(status: u16) -> Self {
        Self::new(format!("server error {}", status)).with_status(status)
    }

    pub fn unauthorized() -> Self {
        Self::new("unauthorized").with_status(401)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(message).with_status(400)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(message).with_code(codes::PARSE)
    }

    /// Map this error onto the classes the engine reasons about.
    ///
    /// Codes take precedence over status. An error with neither is assumed
    /// to be a network failure.
    #[must_use]
    pub fn classify(&self) -> ErrorClass {
        match self.code.as_deref() {
            Some(codes::DOCUMENT_NOT_FOUND) => return ErrorClass::DocumentNotFound,
            Some(codes::PARSE) => return ErrorClass::Parse,
            Some(codes::TIMEOUT) => return ErrorClass::Timeout,
            Some(codes::RATE_LIMITED) => return ErrorClass::RateLimited,
            Some(codes::NETWORK) => return ErrorClass::Network,
            _ => {}
        }
        match self.status {
            Some(400) | Some(422) => ErrorClass::BadRequest,
            Some(401) | Some(403) => ErrorClass::Unauthorized,
            Some(408) => ErrorClass::Timeout,
            Some(429) => ErrorClass::RateLimited,
            Some(s) if (400..500).contains(&s) => ErrorClass::ClientOther,
            Some(s) if s >= 500 => ErrorClass::Server,
            _ => ErrorClass::Network,
        }
    }
}

/// Classification of a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No document stored yet; not a failure
    DocumentNotFound,
    BadRequest,
    Unauthorized,
    /// Any other 4xx (conflict, missing route, ...)
    ClientOther,
    Timeout,
    RateLimited,
    Server,
    Network,
    /// Response could not be understood
    Parse,
}

impl ErrorClass {
    /// Whether this outcome counts against the circuit breaker.
    #[must_use]
    pub fn counts_as_failure(self) -> bool {
        !matches!(self, Self::DocumentNotFound)
    }

    /// Client-side errors that will not fix themselves by retrying soon.
    #[must_use]
    pub fn is_permanent(self) -> bool {
        matches!(self, Self::BadRequest | Self::Unauthorized | Self::ClientOther)
    }

    /// Whether a failed write of this class should go to the offline queue.
    #[must_use]
    pub fn is_replayable(self) -> bool {
        !matches!(self, Self::BadRequest | Self::DocumentNotFound)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DocumentNotFound => "not_found",
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::ClientOther => "client",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Server => "server",
            Self::Network => "network",
            Self::Parse => "parse",
        }
    }
}

/// The authoritative document store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// `Ok(None)` when the user has no document of this type/scope yet.
    async fn fetch_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
    ) -> Result<Option<Value>, RemoteError>;

    async fn persist_document(
        &self,
        user_id: &str,
        pref_type: PreferenceType,
        scope: Option<&str>,
        document: &Value,
        version: i64,
    ) -> Result<(), RemoteError>;
}

/// Resolves the currently signed-in user.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Result<Option<String>, RemoteError>;
}

/// Identity provider backed by a settable value.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user: RwLock<Option<String>>,
}

impl StaticIdentity {
    pub fn new(user: Option<&str>) -> Self {
        Self {
            user: RwLock::new(user.map(str::to_string)),
        }
    }

    pub fn set_user(&self, user: Option<&str>) {
        *self.user.write() = user.map(str::to_string);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<Option<String>, RemoteError> {
        Ok(self.user.read().clone())
    }
}
