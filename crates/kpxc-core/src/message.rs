//! Wire message exchanged with the daemon.
//!
//! Every message is a single JSON object. Binary fields (nonce, client id,
//! public key, ciphertext) travel as standard base64. A few legacy scalars are
//! string-typed on the wire: `success`, `errorCode`, `triggerUnlock` and an
//! entry's `expired` flag are sent as `"true"` / `"15"` rather than native
//! JSON booleans and numbers. Decoding accepts either form.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Daemon-reported failure embedded in an otherwise well-formed reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("keepassxc: {text} ({code})")]
pub struct ErrorResponse {
    pub text: String,
    pub code: i64,
}

impl ErrorResponse {
    pub fn is_no_logins_found(&self) -> bool {
        self.code == crate::error::error_code::NO_LOGINS_FOUND
    }

    pub fn is_database_not_opened(&self) -> bool {
        self.code == crate::error::error_code::DATABASE_NOT_OPENED
    }
}

/// Error fields carried by envelopes and decrypted payloads alike.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFields {
    /// Sometimes omitted by the daemon.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_string_bool"
    )]
    pub success: Option<bool>,

    #[serde(rename = "error", default, skip_serializing_if = "String::is_empty")]
    pub text: String,

    #[serde(
        rename = "errorCode",
        default,
        skip_serializing_if = "is_zero",
        with = "string_int"
    )]
    pub code: i64,
}

impl ErrorFields {
    /// Failure is an explicit `success: false`, or no `success` with a
    /// non-zero code. Anything else, including no fields at all, is success.
    pub fn as_error(&self) -> Option<ErrorResponse> {
        match self.success {
            Some(true) => None,
            None if self.code == 0 => None,
            _ => Some(ErrorResponse {
                text: self.text.clone(),
                code: self.code,
            }),
        }
    }
}

/// Outer envelope of every request, reply and signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Message {
    #[serde(flatten)]
    pub error: ErrorFields,

    /// Message type, e.g. `change-public-keys` or `associate`. Empty on some
    /// solicited replies.
    pub action: String,

    /// Sealed payload.
    #[serde(skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub message: Vec<u8>,

    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,

    /// Lets a daemon serving several clients tell them apart.
    #[serde(rename = "clientID", with = "base64_bytes")]
    pub client_id: Vec<u8>,

    /// Daemon version.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// Only used by the handshake.
    #[serde(
        rename = "publicKey",
        skip_serializing_if = "Vec::is_empty",
        with = "base64_bytes"
    )]
    pub public_key: Vec<u8>,

    #[serde(
        rename = "triggerUnlock",
        skip_serializing_if = "is_false",
        with = "string_bool"
    )]
    pub trigger_unlock: bool,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Scalar as it may appear on the wire: native or string-typed.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl Scalar {
    fn into_bool(self) -> Result<bool, String> {
        match self {
            Scalar::Bool(b) => Ok(b),
            Scalar::Int(n) => Ok(n != 0),
            Scalar::Text(t) => match t.trim() {
                "true" => Ok(true),
                "false" | "" => Ok(false),
                other => Err(format!("invalid boolean {other:?}")),
            },
        }
    }

    fn into_int(self) -> Result<i64, String> {
        match self {
            Scalar::Int(n) => Ok(n),
            Scalar::Bool(b) => Ok(i64::from(b)),
            Scalar::Text(t) if t.trim().is_empty() => Ok(0),
            Scalar::Text(t) => t
                .trim()
                .parse()
                .map_err(|_| format!("invalid number {t:?}")),
        }
    }
}

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&general_purpose::STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(d)? {
            None => Ok(Vec::new()),
            Some(s) => general_purpose::STANDARD
                .decode(s.as_bytes())
                .map_err(|e| D::Error::custom(format!("base64: {e}"))),
        }
    }
}

pub(crate) mod string_bool {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(if *value { "true" } else { "false" })
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        match Option::<super::Scalar>::deserialize(d)? {
            None => Ok(false),
            Some(v) => v.into_bool().map_err(D::Error::custom),
        }
    }
}

mod opt_string_bool {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<bool>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(v) => super::string_bool::serialize(v, s),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
        Option::<super::Scalar>::deserialize(d)?
            .map(|v| v.into_bool().map_err(D::Error::custom))
            .transpose()
    }
}

mod string_int {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &i64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Option::<super::Scalar>::deserialize(d)? {
            None => Ok(0),
            Some(v) => v.into_int().map_err(D::Error::custom),
        }
    }
}
