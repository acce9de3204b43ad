//! Security principal, request descriptor and credential resolution.
//!
//! A physical connection is opened under one [`Credential`], resolved from
//! the borrower's [`Subject`] first, then the [`RequestInfo`], then the
//! resource factory's default. Pooled connections are only ever reused
//! under the same user; they are never re-authenticated.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{TransxError, TransxResult};

/// Authenticated principal a borrow runs on behalf of.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Subject {
    principal: String,
    password: Option<String>,
}

impl Subject {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            password: None,
        }
    }

    pub fn with_password(principal: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            password: Some(password.into()),
        }
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

impl fmt::Debug for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subject")
            .field("principal", &self.principal)
            .finish_non_exhaustive()
    }
}

/// Opaque connection-request descriptor used for matching pooled connections.
///
/// Equality and hashing cover every field; `Debug` leaves the password out.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct RequestInfo {
    user_name: Option<String>,
    password: Option<String>,
    transacted: bool,
    properties: BTreeMap<String, String>,
}

impl RequestInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
            password: Some(password.into()),
            ..Self::default()
        }
    }

    /// Builder method: request a transacted (local transaction) session.
    pub fn transacted(self, transacted: bool) -> Self {
        Self { transacted, ..self }
    }

    /// Builder method: attach a resource-specific property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn is_transacted(&self) -> bool {
        self.transacted
    }

    pub fn get_property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

impl fmt::Debug for RequestInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestInfo")
            .field("user_name", &self.user_name)
            .field("transacted", &self.transacted)
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// User name and password a physical connection is opened with.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Credential {
    user_name: Option<String>,
    password: Option<String>,
}

impl Credential {
    pub fn new(user_name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_name: Some(user_name.into()),
            password: Some(password.into()),
        }
    }

    /// No user: the resource's own default identity.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Resolve the credential for a request.
    ///
    /// The subject wins over the request info, which wins over the
    /// factory default. A subject without a password keeps the user name
    /// and takes the password from the next source that has one.
    pub fn resolve(
        subject: Option<&Subject>,
        request: Option<&RequestInfo>,
        default: Option<&Credential>,
    ) -> Credential {
        if let Some(subject) = subject {
            let password = subject
                .password()
                .or_else(|| request.and_then(RequestInfo::password))
                .or_else(|| default.and_then(Credential::password));
            return Credential {
                user_name: Some(subject.principal().to_string()),
                password: password.map(str::to_string),
            };
        }
        if let Some(user) = request.and_then(RequestInfo::user_name) {
            return Credential {
                user_name: Some(user.to_string()),
                password: request.and_then(RequestInfo::password).map(str::to_string),
            };
        }
        default.cloned().unwrap_or_default()
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Check that a connection opened under `self` may serve `requested`.
    ///
    /// User names must agree exactly; a named user never serves an
    /// anonymous request and vice versa.
    pub fn check_reuse(&self, requested: &Credential) -> TransxResult<()> {
        match (self.user_name(), requested.user_name()) {
            (Some(ours), Some(theirs)) if ours == theirs => Ok(()),
            (None, None) => Ok(()),
            (ours, theirs) => Err(TransxError::SecurityMismatch(format!(
                "connection opened for {} cannot serve {}",
                ours.unwrap_or("<anonymous>"),
                theirs.unwrap_or("<anonymous>")
            ))),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user_name", &self.user_name)
            .finish_non_exhaustive()
    }
}
