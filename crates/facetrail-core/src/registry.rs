//! Track registry. Reconciles periodic detections with per-face visual trackers.
//!
//! The registry owns every live [`Track`] and its tracker. Each frame the
//! frame loop calls, in order:
//!
//! 1. [`TrackRegistry::on_detections`] on detector frames only. Associates
//!    detections with live tracks by box overlap, creating tracks for the
//!    unmatched ones;
//! 2. [`TrackRegistry::advance_all`] steps every tracker exactly once;
//! 3. [`TrackRegistry::evict_stale`] drops tracks that are absent from the
//!    frame and have not been refreshed within the staleness threshold.
//!
//! Matching compares detections against each track's last-known box. Trackers
//! are never advanced during matching, so a tracker moves one step per frame
//! no matter how many detections a frame carries.

use crate::capability::{TrackerFactory, VisualTracker};
use crate::frame::Frame;
use crate::types::BoundingBox;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

/// A track not refreshed for longer than this is evicted once it is also absent from the frame.
pub const STALENESS_THRESHOLD: Duration = Duration::from_secs(1);

/// Per-frame map from track to its box in that frame.
pub type CurrentFaces = BTreeMap<TrackId, BoundingBox>;

/// Track identifier. Assigned from a monotonic counter starting at 1; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a detection picks among several overlapping tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssociationPolicy {
    /// First overlapping track in ascending ID order.
    #[default]
    FirstOverlap,
    /// Track with the largest overlap area; lowest ID on ties.
    MaxOverlap,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown association policy {0:?} (expected \"first\" or \"max\")")]
pub struct ParsePolicyError(String);

impl FromStr for AssociationPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first" | "first-overlap" => Ok(Self::FirstOverlap),
            "max" | "max-overlap" => Ok(Self::MaxOverlap),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// A face followed across frames by its own visual tracker.
pub struct Track<T> {
    id: TrackId,
    bbox: BoundingBox,
    created_at: Instant,
    last_seen: Instant,
    tracker: T,
}

impl<T> Track<T> {
    pub fn id(&self) -> TrackId {
        self.id
    }

    /// Last-known box: the latest matched detection or successful tracker update.
    pub fn bbox(&self) -> &BoundingBox {
        &self.bbox
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Time since the track was created.
    pub fn dwell(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    fn is_stale(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > threshold
    }
}

/// Owns every live track and the counter that names new ones.
pub struct TrackRegistry<F: TrackerFactory> {
    tracks: BTreeMap<TrackId, Track<F::Tracker>>,
    next_id: u64,
    factory: F,
    policy: AssociationPolicy,
}

impl<F: TrackerFactory> TrackRegistry<F> {
    pub fn new(factory: F) -> Self {
        Self {
            tracks: BTreeMap::new(),
            next_id: 1,
            factory,
            policy: AssociationPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: AssociationPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> AssociationPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: TrackId) -> Option<&Track<F::Tracker>> {
        self.tracks.get(&id)
    }

    /// Live tracks in ascending ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Track<F::Tracker>> {
        self.tracks.values()
    }

    /// Time since `id` was created, if it is still live.
    pub fn dwell(&self, id: TrackId, now: Instant) -> Option<Duration> {
        self.tracks.get(&id).map(|t| t.dwell(now))
    }

    /// Associate this frame's detections with live tracks, creating tracks for the rest.
    ///
    /// A matched detection records its own box (not the track's) in `current`,
    /// becomes the track's last-known box and refreshes its last-seen instant.
    /// Returns the IDs created.
    pub fn on_detections(
        &mut self,
        frame: &Frame,
        detections: &[BoundingBox],
        now: Instant,
        current: &mut CurrentFaces,
    ) -> Vec<TrackId> {
        let mut created = Vec::new();

        for det in detections {
            if let Some(id) = self.associate(det) {
                if let Some(track) = self.tracks.get_mut(&id) {
                    track.bbox = det.clone();
                    track.last_seen = now;
                }
                current.insert(id, det.clone());
                continue;
            }

            let id = TrackId(self.next_id);
            self.next_id += 1;

            let mut tracker = self.factory.create();
            tracker.init(frame, det);
            self.tracks.insert(
                id,
                Track {
                    id,
                    bbox: det.clone(),
                    created_at: now,
                    last_seen: now,
                    tracker,
                },
            );
            current.insert(id, det.clone());
            created.push(id);

            tracing::debug!(
                track = %id,
                x = det.x,
                y = det.y,
                width = det.width,
                height = det.height,
                "track created"
            );
        }

        created
    }

    /// Pick the live track `det` belongs to under the configured policy.
    fn associate(&self, det: &BoundingBox) -> Option<TrackId> {
        match self.policy {
            AssociationPolicy::FirstOverlap => self
                .tracks
                .values()
                .find(|t| det.overlap_area(&t.bbox) > 0.0)
                .map(|t| t.id),
            AssociationPolicy::MaxOverlap => {
                let mut best: Option<(TrackId, f32)> = None;
                for track in self.tracks.values() {
                    let overlap = det.overlap_area(&track.bbox);
                    if overlap > 0.0 && best.map_or(true, |(_, b)| overlap > b) {
                        best = Some((track.id, overlap));
                    }
                }
                best.map(|(id, _)| id)
            }
        }
    }

    /// Step every tracker once against `frame`.
    ///
    /// A successful update overwrites the track's entry in `current`, becomes its
    /// last-known box and refreshes last-seen. A failed update writes nothing.
    pub fn advance_all(&mut self, frame: &Frame, now: Instant, current: &mut CurrentFaces) {
        for track in self.tracks.values_mut() {
            match track.tracker.update(frame) {
                Some(bbox) => {
                    track.bbox = bbox.clone();
                    track.last_seen = now;
                    current.insert(track.id, bbox);
                }
                None => {
                    tracing::trace!(track = %track.id, "tracker lost target");
                }
            }
        }
    }

    /// Drop tracks absent from `current` whose last refresh is older than the staleness threshold.
    ///
    /// Returns the evicted IDs in ascending order.
    pub fn evict_stale(&mut self, current: &CurrentFaces, now: Instant) -> Vec<TrackId> {
        let evicted: Vec<TrackId> = self
            .tracks
            .values()
            .filter(|t| !current.contains_key(&t.id) && t.is_stale(now, STALENESS_THRESHOLD))
            .map(|t| t.id)
            .collect();

        for id in &evicted {
            self.tracks.remove(id);
            tracing::debug!(track = %id, "track evicted");
        }

        evicted
    }
}
