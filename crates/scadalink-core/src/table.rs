//! Point table.
//!
//! The table keeps the bookkeeping for poll-mode points: how many client
//! subscriptions currently need the point polled, and the last value that
//! was emitted for it. Push-mode points never appear here; the fast store's
//! own notifications already cover them.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::point::{DeliveryMode, PointId, PointValue};

/// Bookkeeping for one poll-mode point.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointEntry {
    /// Number of live client subscriptions that need this point polled.
    pub poll_ref_count: u32,
    /// Last value emitted to subscribers; `None` until the first poll.
    pub last_value: Option<PointValue>,
    /// When `last_value` was stored.
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl PointEntry {
    /// Whether the scheduler should poll this point.
    pub fn is_active(&self) -> bool {
        self.poll_ref_count > 0
    }
}

/// Outcome of releasing one poll reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// The count was decremented; carries the remaining count.
    Decremented(u32),
    /// The count was already zero. Nothing changed.
    AlreadyZero,
    /// The point has no poll entry.
    Untracked,
}

/// Reference-counted table of poll-mode points.
#[derive(Debug, Clone, Default)]
pub struct PointTable {
    entries: HashMap<PointId, PointEntry>,
}

impl PointTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded delivery mode of a point, if it is currently held in poll mode.
    pub fn mode_of(&self, id: &PointId) -> Option<DeliveryMode> {
        self.entries
            .get(id)
            .filter(|e| e.is_active())
            .map(|_| DeliveryMode::Poll)
    }

    /// True when the point is tracked with a positive reference count.
    pub fn is_active_poll(&self, id: &PointId) -> bool {
        self.entries.get(id).is_some_and(PointEntry::is_active)
    }

    /// Add one poll reference, creating the entry if needed.
    ///
    /// Returns the new reference count.
    pub fn acquire_poll(&mut self, id: &PointId) -> u32 {
        let entry = self.entries.entry(id.clone()).or_default();
        entry.poll_ref_count += 1;
        entry.poll_ref_count
    }

    /// Drop one poll reference. The count never goes below zero.
    ///
    /// When the count reaches zero the entry is reset to unknown so a later
    /// subscriber starts from a clean slate and receives the first poll.
    pub fn release_poll(&mut self, id: &PointId) -> Release {
        let Some(entry) = self.entries.get_mut(id) else {
            return Release::Untracked;
        };
        if entry.poll_ref_count == 0 {
            return Release::AlreadyZero;
        }
        entry.poll_ref_count -= 1;
        if entry.poll_ref_count == 0 {
            entry.last_value = None;
            entry.last_updated_at = None;
        }
        Release::Decremented(entry.poll_ref_count)
    }

    /// Points the scheduler has to poll this tick.
    pub fn active_poll_points(&self) -> Vec<PointId> {
        let mut points: Vec<PointId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_active())
            .map(|(id, _)| id.clone())
            .collect();
        points.sort();
        points
    }

    /// Store a freshly polled value.
    ///
    /// Returns true only when the point is still actively polled and the
    /// value differs from the last one emitted; the caller emits exactly
    /// when this returns true.
    pub fn record_value(&mut self, id: &PointId, value: PointValue, at: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if !entry.is_active() || entry.last_value.as_ref() == Some(&value) {
            return false;
        }
        entry.last_value = Some(value);
        entry.last_updated_at = Some(at);
        true
    }

    /// Look up the entry for a point.
    pub fn get(&self, id: &PointId) -> Option<&PointEntry> {
        self.entries.get(id)
    }

    /// Iterate over every tracked point.
    pub fn iter(&self) -> impl Iterator<Item = (&PointId, &PointEntry)> {
        self.entries.iter()
    }

    /// Number of tracked points, active or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
