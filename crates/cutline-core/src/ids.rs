// crates/cutline-core/src/ids.rs
//
// Entity identifiers. Application-assigned, unique within their kind
// (clip id, track id, overlap id) — the engine never generates them.

/// 64-bit signed identifier for clips, tracks and overlaps.
pub type Id = i64;

/// Reserved id meaning "not attached to anything".
///
/// A clip whose `track_id` is `NIL_ID` has been removed from its track but
/// may still be alive through an external handle.
pub const NIL_ID: Id = -1;
