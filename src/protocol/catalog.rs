//! Message catalog: type-code <-> message-name mapping.
//!
//! The protocol identifies each payload schema by a one-byte type code.
//! The catalog is a fixed, sparse, bijective table; an unknown code or
//! name is a protocol violation, never silently ignored.

use crate::error::{Error, Result};

/// Type code of the server error response.
pub const ERROR_RESP_CODE: u8 = 0;

/// Wire name of the server error response.
pub const ERROR_RESP: &str = "RpbErrorResp";

/// The full catalog, sorted by code.
const CATALOG: &[(u8, &str)] = &[
    (0, "RpbErrorResp"),
    (1, "RpbPingReq"),
    (2, "RpbPingResp"),
    (3, "RpbGetClientIdReq"),
    (4, "RpbGetClientIdResp"),
    (5, "RpbSetClientIdReq"),
    (6, "RpbSetClientIdResp"),
    (7, "RpbGetServerInfoReq"),
    (8, "RpbGetServerInfoResp"),
    (9, "RpbGetReq"),
    (10, "RpbGetResp"),
    (11, "RpbPutReq"),
    (12, "RpbPutResp"),
    (13, "RpbDelReq"),
    (14, "RpbDelResp"),
    (15, "RpbListBucketsReq"),
    (16, "RpbListBucketsResp"),
    (17, "RpbListKeysReq"),
    (18, "RpbListKeysResp"),
    (19, "RpbGetBucketReq"),
    (20, "RpbGetBucketResp"),
    (21, "RpbSetBucketReq"),
    (22, "RpbSetBucketResp"),
    (23, "RpbMapRedReq"),
    (24, "RpbMapRedResp"),
    (25, "RpbIndexReq"),
    (26, "RpbIndexResp"),
    (27, "RpbSearchQueryReq"),
    (28, "RpbSearchQueryResp"),
    (29, "RpbResetBucketReq"),
    (30, "RpbResetBucketResp"),
    (40, "RpbCSBucketReq"),
    (41, "RpbCSBucketResp"),
    (50, "RpbCounterUpdateReq"),
    (51, "RpbCounterUpdateResp"),
    (52, "RpbCounterGetReq"),
    (53, "RpbCounterGetResp"),
];

/// Look up the canonical message name for a type code.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for codes outside the catalog.
pub fn name_of(code: u8) -> Result<&'static str> {
    CATALOG
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
        .ok_or_else(|| Error::Protocol(format!("Unknown message code: {}", code)))
}

/// Look up the type code for a canonical message name.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for names outside the catalog.
pub fn code_of(name: &str) -> Result<u8> {
    CATALOG
        .iter()
        .find(|(_, n)| *n == name)
        .map(|(c, _)| *c)
        .ok_or_else(|| Error::Protocol(format!("Unknown message name: {}", name)))
}
