// crates/cutline-core/src/curves.rs
//
// Key-point curves: named parameter automation sampled at arbitrary
// timeline positions. The transform filter reads a bundle each frame and
// maps curve names to parameter setters; unknown names are logged once and
// ignored so adding curves stays backward-compatible.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// One key point on a curve: a value pinned at a timeline position.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyPoint {
    pub pos_ms: i64,
    pub value: f32,
}

/// A single named curve. Points are kept sorted by position.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Curve {
    points: Vec<KeyPoint>,
}

impl Curve {
    pub fn new(mut points: Vec<KeyPoint>) -> Self {
        points.sort_by_key(|p| p.pos_ms);
        Self { points }
    }

    pub fn push(&mut self, pos_ms: i64, value: f32) {
        self.points.push(KeyPoint { pos_ms, value });
        self.points.sort_by_key(|p| p.pos_ms);
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Sample at `pos_ms`: linear interpolation between surrounding key
    /// points, held flat before the first and after the last.
    pub fn sample(&self, pos_ms: i64) -> Option<f32> {
        let pts = &self.points;
        if pts.is_empty() {
            return None;
        }
        if pos_ms <= pts[0].pos_ms {
            return Some(pts[0].value);
        }
        if pos_ms >= pts[pts.len() - 1].pos_ms {
            return Some(pts[pts.len() - 1].value);
        }
        // Partition point: first key strictly after pos_ms.
        let hi = pts.partition_point(|p| p.pos_ms <= pos_ms);
        let a = pts[hi - 1];
        let b = pts[hi];
        let span = (b.pos_ms - a.pos_ms) as f32;
        let t = (pos_ms - a.pos_ms) as f32 / span;
        Some(a.value + (b.value - a.value) * t)
    }
}

/// A bundle of named curves attached to a filter.
#[derive(Debug, Default)]
pub struct CurveBundle {
    curves: HashMap<String, Curve>,
    // Names we've already warned about, so a typo logs once per bundle
    // rather than once per frame.
    warned: Mutex<HashSet<String>>,
}

impl CurveBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, curve: Curve) {
        self.curves.insert(name.into(), curve);
    }

    pub fn is_empty(&self) -> bool {
        self.curves.is_empty()
    }

    /// Names of all curves in the bundle, for setter mapping.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.curves.keys().map(|s| s.as_str())
    }

    /// Sample curve `name` at `pos_ms`. Unknown names return `None` and log
    /// a warning the first time they are asked for.
    pub fn sample(&self, name: &str, pos_ms: i64) -> Option<f32> {
        match self.curves.get(name) {
            Some(c) => c.sample(pos_ms),
            None => {
                let mut warned = self.warned.lock().unwrap();
                if warned.insert(name.to_string()) {
                    log::warn!("[curves] unknown curve '{name}' — ignored");
                }
                None
            }
        }
    }
}

impl Clone for CurveBundle {
    fn clone(&self) -> Self {
        Self {
            curves: self.curves.clone(),
            warned: Mutex::new(HashSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_interpolates_linearly() {
        let c = Curve::new(vec![
            KeyPoint { pos_ms: 0, value: 0.0 },
            KeyPoint { pos_ms: 1000, value: 10.0 },
        ]);
        assert_eq!(c.sample(0), Some(0.0));
        assert_eq!(c.sample(500), Some(5.0));
        assert_eq!(c.sample(1000), Some(10.0));
    }

    #[test]
    fn sample_holds_at_ends() {
        let c = Curve::new(vec![
            KeyPoint { pos_ms: 100, value: 3.0 },
            KeyPoint { pos_ms: 200, value: 7.0 },
        ]);
        assert_eq!(c.sample(-50), Some(3.0));
        assert_eq!(c.sample(900), Some(7.0));
    }

    #[test]
    fn unsorted_points_are_sorted_on_build() {
        let c = Curve::new(vec![
            KeyPoint { pos_ms: 1000, value: 1.0 },
            KeyPoint { pos_ms: 0, value: 0.0 },
        ]);
        assert_eq!(c.sample(500), Some(0.5));
    }

    #[test]
    fn empty_curve_returns_none() {
        assert_eq!(Curve::default().sample(0), None);
    }

    #[test]
    fn bundle_unknown_name_is_none() {
        let mut b = CurveBundle::new();
        b.insert("rotate", Curve::new(vec![KeyPoint { pos_ms: 0, value: 90.0 }]));
        assert_eq!(b.sample("rotate", 10), Some(90.0));
        assert_eq!(b.sample("no_such", 10), None);
        // Second lookup exercises the warned-once path.
        assert_eq!(b.sample("no_such", 20), None);
    }
}
