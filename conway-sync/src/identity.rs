//! Client identity, derived from the WebSocket upgrade request.
//!
//! Clients connect with `ws://host:port/?token=<word characters>`. The
//! token is taken at face value; anything stronger belongs to the transport
//! in front of the server. Identities are not required to be unique, so a
//! client reconnecting with the same token is simply a new session.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

static TOKEN_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|&)token=([^&#]*)").expect("valid token regex"));

static WORD_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\w+").expect("valid word regex"));

/// Who a session belongs to, plus its presentation colour.
///
/// Serialized as the `user` object of the `INITIALIZE` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub token: String,
    /// `#rrggbb`, display only
    pub color: String,
}

impl Identity {
    /// Build an identity with a fresh random colour.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            color: random_color(),
        }
    }
}

/// Extract the identity from a request target such as `/?token=alice`.
///
/// The leading run of word characters of the `token` value is used; a value
/// that does not start with one is rejected.
pub fn extract_identity(request_target: &str) -> Result<Identity, IdentityError> {
    let query = request_target
        .split_once('?')
        .map(|(_, query)| query)
        .ok_or(IdentityError::MissingToken)?;

    let value = TOKEN_PARAM
        .captures(query)
        .and_then(|caps| caps.get(1))
        .ok_or(IdentityError::MissingToken)?
        .as_str();

    let token = WORD_RUN
        .find(value)
        .ok_or_else(|| IdentityError::MalformedToken(request_target.to_string()))?;

    Ok(Identity::new(token.as_str()))
}

/// Uniformly random 24-bit colour as `#rrggbb`.
pub fn random_color() -> String {
    let bits = rand::random::<u32>() & 0x00FF_FFFF;
    format!("#{bits:06x}")
}
