//! Trust origins.
//!
//! An origin is the `scheme://host:port` identity a message is restricted
//! to. Contexts without a trust grant report the opaque origin `"null"`.

use url::Url;

/// Origin reported by contexts that were denied same-origin trust.
pub const OPAQUE_ORIGIN: &str = "null";

/// Target origin that matches any receiver.
pub const ANY_ORIGIN: &str = "*";

/// Origin attached to messages that never leave the host process.
pub const LOCAL_ORIGIN: &str = "local";

/// Serialized origin of `url`, `"null"` for opaque URLs.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// Check a declared origin against an optional expectation.
///
/// Matching is exact; there is no wildcard on the receiving side.
pub fn origin_matches(expected: Option<&str>, declared: &str) -> bool {
    match expected {
        Some(expected) => expected == declared,
        None => true,
    }
}
