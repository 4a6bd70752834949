//! Declarative payload validation.
//!
//! Control payloads are checked against an ordered list of
//! (JSON pointer, predicate) entries before the broker or client acts on
//! them. A check passes only if the pointer resolves and the predicate holds
//! at that position; the empty pointer addresses the document root.

use serde_json::Value;

use crate::MINIMUM_COMPATIBLE_VERSION;

/// A test applied at one position inside a payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Predicate {
    /// The pointer must resolve; any value is acceptable.
    Exists,
    /// A non-empty string.
    NotEmpty,
    IsBool,
    IsNumber,
    /// An unsigned integer drawn from the given set.
    OneOf(&'static [u64]),
    /// A number no smaller than the given bound.
    AtLeast(i64),
}

impl Predicate {
    fn holds(&self, value: &Value) -> bool {
        match self {
            Predicate::Exists => true,
            Predicate::NotEmpty => value.as_str().is_some_and(|s| !s.is_empty()),
            Predicate::IsBool => value.is_boolean(),
            Predicate::IsNumber => value.is_number(),
            Predicate::OneOf(set) => value.as_u64().is_some_and(|v| set.contains(&v)),
            Predicate::AtLeast(min) => value.as_i64().is_some_and(|v| v >= *min),
        }
    }
}

/// An ordered validation battery.
pub type Checks = [(&'static str, Predicate)];

/// True iff every pointer resolves and every predicate holds.
pub fn validate(value: &Value, checks: &Checks) -> bool {
    checks.iter().all(|(path, predicate)| {
        value
            .pointer(path)
            .is_some_and(|found| predicate.holds(found))
    })
}

/// What the broker requires of a peer's `$$handshake` payload.
pub const HANDSHAKE_SERVERSIDE: &Checks = &[
    ("/teamname", Predicate::NotEmpty),
    ("/format", Predicate::OneOf(&[0, 1])),
    ("/max-message-length", Predicate::IsNumber),
    (
        "/version",
        Predicate::AtLeast(MINIMUM_COMPATIBLE_VERSION as i64),
    ),
];

/// What a peer requires of the broker's `$$handshake` payload.
pub const HANDSHAKE_CLIENTSIDE: &Checks = &[(
    "/version",
    Predicate::AtLeast(MINIMUM_COMPATIBLE_VERSION as i64),
)];

/// Shape of an `$$available` payload.
pub const AVAILABLE: &Checks = &[
    ("/type", Predicate::NotEmpty),
    ("/available", Predicate::IsBool),
];

/// Broker-originated `$$error` payloads carry a bare string.
pub const SERVER_MESSAGE: &Checks = &[("", Predicate::NotEmpty)];

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn accepts_well_formed_handshake() {
        let content = json!({
            "teamname": "navigation",
            "format": 1,
            "version": 0,
            "max-message-length": 32768,
        });
        assert!(validate(&content, HANDSHAKE_SERVERSIDE));
    }

    #[test]
    fn rejects_handshake_with_missing_or_bad_fields() {
        let missing_team = json!({ "format": 0, "version": 0, "max-message-length": 1024 });
        assert!(!validate(&missing_team, HANDSHAKE_SERVERSIDE));

        let empty_team = json!({
            "teamname": "",
            "format": 0,
            "version": 0,
            "max-message-length": 1024,
        });
        assert!(!validate(&empty_team, HANDSHAKE_SERVERSIDE));

        let bad_format = json!({
            "teamname": "t",
            "format": 5,
            "version": 0,
            "max-message-length": 1024,
        });
        assert!(!validate(&bad_format, HANDSHAKE_SERVERSIDE));

        let old_version = json!({
            "teamname": "t",
            "format": 0,
            "version": -1,
            "max-message-length": 1024,
        });
        assert!(!validate(&old_version, HANDSHAKE_SERVERSIDE));
    }

    #[test]
    fn availability_payload_shape() {
        assert!(validate(
            &json!({ "type": "job", "available": false }),
            AVAILABLE
        ));
        assert!(!validate(
            &json!({ "type": "", "available": false }),
            AVAILABLE
        ));
        assert!(!validate(&json!({ "type": "job" }), AVAILABLE));
        assert!(!validate(
            &json!({ "type": "job", "available": "no" }),
            AVAILABLE
        ));
    }

    #[test]
    fn empty_pointer_addresses_the_root() {
        assert!(validate(&json!("something went wrong"), SERVER_MESSAGE));
        assert!(!validate(&json!(""), SERVER_MESSAGE));
        assert!(!validate(&json!({ "text": "hi" }), SERVER_MESSAGE));
    }

    #[test]
    fn every_entry_must_pass() {
        let content = json!({ "a": 1, "b": true });
        let checks: &Checks = &[("/a", Predicate::IsNumber), ("/b", Predicate::IsNumber)];
        assert!(!validate(&content, checks));
        let checks: &Checks = &[("/a", Predicate::Exists), ("/b", Predicate::IsBool)];
        assert!(validate(&content, checks));
    }
}
