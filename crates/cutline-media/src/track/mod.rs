// crates/cutline-media/src/track/mod.rs
//
// Tracks: one timeline row of clips plus the overlaps derived from them.
//
// The structural rules both track kinds share live here as pure functions
// over `(id, range)` tuples, so the three invariants are testable without
// opening a single media file:
//
//   A. no-clip-crosses-overlap — a clip never enters an overlap region it
//      is not part of (at most two clips deep anywhere on a track).
//   B. overlap coherence — exactly one overlap per intersecting clip pair;
//      an overlap whose clips stop intersecting is destroyed.
//   C. duration — a track ends where its last clip ends.

pub mod audio;
pub mod video;

pub use audio::AudioTrack;
pub use video::VideoTrack;

use cutline_core::Id;

use crate::overlap::has_overlap;

/// Invariant A check for an insertion or move: `candidate` may not
/// intersect any overlap region it is not itself part of. The caller
/// filters out overlaps involving the candidate before calling.
pub(crate) fn crosses_foreign_overlap(
    candidate: (i64, i64),
    foreign_overlap_ranges: impl IntoIterator<Item = (i64, i64)>,
) -> bool {
    foreign_overlap_ranges
        .into_iter()
        .any(|r| has_overlap(candidate, r))
}

/// The overlap-list maintenance both track kinds run after a clip is
/// added, moved, re-trimmed or removed (invariant B).
pub(crate) struct OverlapPlan {
    /// Overlap ids to destroy.
    pub drop: Vec<Id>,
    /// Clip-id pairs that intersect but have no overlap yet.
    pub create: Vec<(Id, Id)>,
}

/// Compute the plan for `target` against the current clip and overlap
/// lists. `clips` holds `(id, (start, end))`; `overlaps` holds
/// `(overlap_id, front_id, rear_id)`.
pub(crate) fn plan_overlap_update(
    clips: &[(Id, (i64, i64))],
    overlaps: &[(Id, Id, Id)],
    target: Id,
    remove: bool,
) -> OverlapPlan {
    let range_of = |id: Id| clips.iter().find(|(c, _)| *c == id).map(|(_, r)| *r);

    let mut drop = Vec::new();
    for &(oid, front, rear) in overlaps {
        let (Some(fr), Some(rr)) = (range_of(front), range_of(rear)) else {
            drop.push(oid); // an endpoint left the track
            continue;
        };
        if (front == target || rear == target) && !has_overlap(fr, rr) {
            drop.push(oid); // moved/trimmed apart
        }
    }

    let mut create = Vec::new();
    if !remove {
        if let Some(tr) = range_of(target) {
            for &(cid, cr) in clips {
                if cid == target || !has_overlap(tr, cr) {
                    continue;
                }
                let exists = overlaps.iter().any(|&(oid, f, r)| {
                    !drop.contains(&oid)
                        && ((f == target && r == cid) || (f == cid && r == target))
                });
                if !exists {
                    create.push((target, cid));
                }
            }
        }
    }

    OverlapPlan { drop, create }
}

/// Disjoint mutable borrows of two list entries (front/rear clips of an
/// overlap read).
pub(crate) fn two_mut<T>(v: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    debug_assert_ne!(i, j);
    if i < j {
        let (a, b) = v.split_at_mut(j);
        (&mut a[i], &mut b[0])
    } else {
        let (a, b) = v.split_at_mut(i);
        (&mut b[0], &mut a[j])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_overlap_blocks_intersecting_candidate() {
        // Overlap region [3000, 5000): a third clip may not enter it.
        assert!(crosses_foreign_overlap((3500, 4000), [(3000, 5000)]));
        assert!(crosses_foreign_overlap((2000, 3500), [(3000, 5000)]));
        assert!(!crosses_foreign_overlap((5000, 6000), [(3000, 5000)]));
        assert!(!crosses_foreign_overlap((0, 3000), [(3000, 5000)]));
    }

    #[test]
    fn plan_creates_overlap_for_new_intersection() {
        crate::init_test_logging();
        let clips = [(1, (0, 5000)), (2, (3000, 8000))];
        let plan = plan_overlap_update(&clips, &[], 2, false);
        assert!(plan.drop.is_empty());
        assert_eq!(plan.create, vec![(2, 1)]);
    }

    #[test]
    fn plan_is_idempotent_once_overlap_exists() {
        let clips = [(1, (0, 5000)), (2, (3000, 8000))];
        let overlaps = [(100, 1, 2)];
        let plan = plan_overlap_update(&clips, &overlaps, 2, false);
        assert!(plan.drop.is_empty());
        assert!(plan.create.is_empty());
    }

    #[test]
    fn plan_drops_overlap_when_clips_separate() {
        let clips = [(1, (0, 2000)), (2, (3000, 8000))];
        let overlaps = [(100, 1, 2)];
        let plan = plan_overlap_update(&clips, &overlaps, 1, false);
        assert_eq!(plan.drop, vec![100]);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn plan_drops_overlap_when_endpoint_removed() {
        // Clip 2 already gone from the list.
        let clips = [(1, (0, 5000))];
        let overlaps = [(100, 1, 2)];
        let plan = plan_overlap_update(&clips, &overlaps, 2, true);
        assert_eq!(plan.drop, vec![100]);
        assert!(plan.create.is_empty());
    }

    #[test]
    fn plan_creates_two_overlaps_for_bridging_clip() {
        // Clip 3 spans the gap between 1 and 2 without entering any
        // existing overlap.
        let clips = [(1, (0, 1000)), (2, (2000, 3000)), (3, (500, 2500))];
        let plan = plan_overlap_update(&clips, &[], 3, false);
        let mut pairs = plan.create.clone();
        pairs.sort();
        assert_eq!(pairs, vec![(3, 1), (3, 2)]);
    }

    #[test]
    fn two_mut_returns_disjoint_refs() {
        let mut v = vec![10, 20, 30];
        let (a, b) = two_mut(&mut v, 2, 0);
        assert_eq!((*a, *b), (30, 10));
        *a += 1;
        *b += 1;
        assert_eq!(v, vec![11, 20, 31]);
    }
}
