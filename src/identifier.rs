//! Client identifiers.
//!
//! A [`ClientId`] names an organisation (member) or one of its subsystems
//! inside a federation instance.  It is the lookup key into the trust
//! configuration and is never mutated once built.
//!
//! # Textual form
//!
//! ```text
//! INSTANCE/CLASS/MEMBER            member
//! INSTANCE/CLASS/MEMBER/SUBSYSTEM  subsystem
//! ```
//!
//! This is the same form the `X-Road-Client` request header carries.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Why a textual client identifier was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientIdError {
    /// Wrong number of `/`-separated parts.
    #[error("expected INSTANCE/CLASS/MEMBER[/SUBSYSTEM], got {0} part(s)")]
    PartCount(usize),

    /// A part is empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A part starts or ends with whitespace.
    #[error("{0} must not start or end with whitespace")]
    Padded(&'static str),

    /// A part contains a forbidden character.
    #[error("{field} contains forbidden character {ch:?}")]
    ForbiddenChar {
        /// Which component.
        field: &'static str,
        /// The offending character.
        ch: char,
    },
}

/// Identifier of a federation member or subsystem.
///
/// Equality and hashing are structural over all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId {
    instance: String,
    member_class: String,
    member_code: String,
    subsystem_code: Option<String>,
}

impl ClientId {
    /// Build a member identifier.
    pub fn member(
        instance: impl Into<String>,
        member_class: impl Into<String>,
        member_code: impl Into<String>,
    ) -> Result<Self, ClientIdError> {
        Self::build(instance.into(), member_class.into(), member_code.into(), None)
    }

    /// Build a subsystem identifier.
    pub fn subsystem(
        instance: impl Into<String>,
        member_class: impl Into<String>,
        member_code: impl Into<String>,
        subsystem_code: impl Into<String>,
    ) -> Result<Self, ClientIdError> {
        Self::build(
            instance.into(),
            member_class.into(),
            member_code.into(),
            Some(subsystem_code.into()),
        )
    }

    fn build(
        instance: String,
        member_class: String,
        member_code: String,
        subsystem_code: Option<String>,
    ) -> Result<Self, ClientIdError> {
        check_part("instance", &instance)?;
        check_part("member class", &member_class)?;
        check_part("member code", &member_code)?;
        if let Some(ref sub) = subsystem_code {
            check_part("subsystem code", sub)?;
        }
        Ok(Self {
            instance,
            member_class,
            member_code,
            subsystem_code,
        })
    }

    /// Federation instance identifier.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Member class (e.g. `GOV`, `COM`).
    pub fn member_class(&self) -> &str {
        &self.member_class
    }

    /// Member code.
    pub fn member_code(&self) -> &str {
        &self.member_code
    }

    /// Subsystem code, if this identifies a subsystem.
    pub fn subsystem_code(&self) -> Option<&str> {
        self.subsystem_code.as_deref()
    }

    /// The owning member of this identifier (itself, for a member).
    #[must_use]
    pub fn member_id(&self) -> Self {
        Self {
            subsystem_code: None,
            ..self.clone()
        }
    }
}

fn check_part(field: &'static str, value: &str) -> Result<(), ClientIdError> {
    if value.trim().is_empty() {
        return Err(ClientIdError::Empty(field));
    }
    if value.trim() != value {
        return Err(ClientIdError::Padded(field));
    }
    if let Some(ch) = value
        .chars()
        .find(|c| matches!(c, '/' | ':' | ';' | '\\') || c.is_control())
    {
        return Err(ClientIdError::ForbiddenChar { field, ch });
    }
    Ok(())
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.instance, self.member_class, self.member_code
        )?;
        if let Some(ref sub) = self.subsystem_code {
            write!(f, "/{sub}")?;
        }
        Ok(())
    }
}

impl FromStr for ClientId {
    type Err = ClientIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('/').collect();
        match parts.as_slice() {
            [instance, class, code] => Self::member(*instance, *class, *code),
            [instance, class, code, sub] => Self::subsystem(*instance, *class, *code, *sub),
            other => Err(ClientIdError::PartCount(other.len())),
        }
    }
}

impl Serialize for ClientId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClientId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
