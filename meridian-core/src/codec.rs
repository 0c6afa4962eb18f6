//! Leader record encoding.
//!
//! The value stored under the leader key is the binary encoding of the
//! leader's [`Member`] identity. Encoding uses fixed-width integers, a size
//! limit and rejects trailing bytes, so a truncated or padded value is
//! reported as invalid instead of silently decoding to a wrong identity.

use crate::{Member, MetaError, MetaResult};
use bincode::Options;

/// Upper bound for an encoded identity.
const MAX_RECORD_SIZE: u64 = 64 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_RECORD_SIZE)
        .reject_trailing_bytes()
}

/// Encodes a member identity into the leader record value.
pub fn encode_member(member: &Member) -> MetaResult<Vec<u8>> {
    options()
        .serialize(member)
        .map_err(|e| MetaError::MarshalMemberFailed {
            reason: e.to_string(),
        })
}

/// Decodes a leader record value back into a member identity.
pub fn decode_member(bytes: &[u8]) -> MetaResult<Member> {
    options()
        .deserialize(bytes)
        .map_err(|e| MetaError::InvalidLeaderValue {
            reason: e.to_string(),
        })
}
