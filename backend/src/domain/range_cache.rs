//! Range-keyed lesson cache.
//!
//! Lessons are cached per normalized UTC date range. Loads issued for the
//! current view are fenced with a monotonically increasing request id so an
//! out-of-order response can never clobber a newer one (last request wins;
//! the in-flight fetch itself is not cancelled). Every lesson mutation is
//! propagated into every cached window that could contain it, not just the
//! visible one.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use log::{info, warn};

use shared::{Lesson, LessonStatus};

use crate::domain::clock;
use crate::storage::traits::LessonStorage;

/// A normalized date range: civil dates plus their day-boundary UTC
/// instants in the teacher's zone.
#[derive(Debug, Clone, PartialEq)]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Start-of-day instant of `start_date`
    pub start: DateTime<Utc>,
    /// End-of-day instant (23:59:59.999) of `end_date`
    pub end: DateTime<Utc>,
}

impl DateRange {
    /// Cache key: the ISO date pair.
    pub fn key(&self) -> String {
        format!("{}..{}", self.start_date, self.end_date)
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant <= self.end
    }
}

/// Result of a fenced load.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Lessons now visible for the range (from cache or a fresh fetch)
    Loaded(Vec<Lesson>),
    /// The response arrived after a newer request was issued and was
    /// discarded without touching visible state
    Stale,
}

/// Criteria for removing lessons from every cached window.
#[derive(Debug, Clone, Default)]
pub struct RemoveFilter {
    /// Remove these exact lessons everywhere
    pub ids: Vec<String>,
    /// Remove occurrences of this series...
    pub series_id: Option<String>,
    /// ...starting at or after this instant. Only SCHEDULED occurrences are
    /// removed; completed or canceled ones are history and stay.
    pub start_from: Option<DateTime<Utc>>,
}

struct RangeEntry {
    range: DateRange,
    lessons: Vec<Lesson>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, RangeEntry>,
    active_key: Option<String>,
    /// Id of the most recent load issued for the current view
    latest_request: u64,
}

/// Cache of lesson lists keyed by UTC date ranges, single-writer per
/// teacher session.
#[derive(Clone)]
pub struct RangeCache {
    lessons: Arc<dyn LessonStorage>,
    teacher_id: String,
    zone: Tz,
    state: Arc<Mutex<CacheState>>,
    request_counter: Arc<AtomicU64>,
}

impl RangeCache {
    pub fn new(lessons: Arc<dyn LessonStorage>, teacher_id: &str, zone: Tz) -> Self {
        Self {
            lessons,
            teacher_id: teacher_id.to_string(),
            zone,
            state: Arc::new(Mutex::new(CacheState::default())),
            request_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Normalize a civil date pair to day-boundary UTC instants.
    pub fn build_range(&self, start_date: NaiveDate, end_date: NaiveDate) -> Result<DateRange> {
        if end_date < start_date {
            return Err(anyhow!(
                "Range end {} is before range start {}",
                end_date,
                start_date
            ));
        }
        let (start, _) = clock::day_bounds(start_date, self.zone)?;
        let (_, end) = clock::day_bounds(end_date, self.zone)?;
        Ok(DateRange {
            start_date,
            end_date,
            start,
            end,
        })
    }

    /// Load the lessons for a range. An exact-key cache hit returns
    /// synchronously; otherwise the lesson store is queried and the
    /// response applied only if no newer load has been issued since.
    /// A failed fetch leaves any previously cached entry untouched.
    pub async fn load(&self, range: &DateRange) -> Result<LoadOutcome> {
        let key = range.key();
        {
            let mut state = self.state.lock().unwrap();
            if let Some(entry) = state.entries.get(&key) {
                let lessons = entry.lessons.clone();
                state.active_key = Some(key);
                return Ok(LoadOutcome::Loaded(lessons));
            }
        }

        let request_id = self.begin_load();
        info!("Loading lessons for range {} (request {})", key, request_id);

        let lessons = self
            .lessons
            .list_lessons_in_range(&self.teacher_id, range.start, range.end)
            .await?;

        Ok(self.complete_load(range, request_id, lessons))
    }

    /// Tag a new load with the next request id and mark it latest.
    fn begin_load(&self) -> u64 {
        let request_id = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.lock().unwrap().latest_request = request_id;
        request_id
    }

    /// Apply a load response if it is still the latest; discard it
    /// otherwise.
    fn complete_load(
        &self,
        range: &DateRange,
        request_id: u64,
        mut lessons: Vec<Lesson>,
    ) -> LoadOutcome {
        let mut state = self.state.lock().unwrap();
        if state.latest_request != request_id {
            warn!(
                "Discarding stale range response for {} (request {}, latest {})",
                range.key(),
                request_id,
                state.latest_request
            );
            return LoadOutcome::Stale;
        }

        lessons.sort_by(|a, b| a.start_at.cmp(&b.start_at));
        let key = range.key();
        state.entries.insert(
            key.clone(),
            RangeEntry {
                range: range.clone(),
                lessons: lessons.clone(),
            },
        );
        state.active_key = Some(key);
        LoadOutcome::Loaded(lessons)
    }

    /// Replace the entry for a range and mark it the active view. Any load
    /// still in flight becomes stale.
    pub fn apply_for_range(&self, range: &DateRange, mut lessons: Vec<Lesson>) {
        lessons.sort_by(|a, b| a.start_at.cmp(&b.start_at));
        let request_id = self.request_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut state = self.state.lock().unwrap();
        state.latest_request = request_id;
        let key = range.key();
        state.entries.insert(
            key.clone(),
            RangeEntry {
                range: range.clone(),
                lessons,
            },
        );
        state.active_key = Some(key);
    }

    /// Reconcile mutated lessons into every cached window: each window
    /// drops its old copy and re-inserts the lessons that fall inside its
    /// bounds, re-sorted by start.
    pub fn sync_across_ranges(&self, lessons: &[Lesson]) {
        if lessons.is_empty() {
            return;
        }
        let ids: HashSet<&str> = lessons.iter().map(|l| l.id.as_str()).collect();
        let mut state = self.state.lock().unwrap();
        for entry in state.entries.values_mut() {
            entry.lessons.retain(|l| !ids.contains(l.id.as_str()));
            for lesson in lessons {
                if entry.range.contains(lesson.start_at) {
                    entry.lessons.push(lesson.clone());
                }
            }
            entry.lessons.sort_by(|a, b| a.start_at.cmp(&b.start_at));
        }
    }

    /// Remove lessons from every cached window.
    pub fn remove_across_ranges(&self, filter: &RemoveFilter) {
        let ids: HashSet<&str> = filter.ids.iter().map(String::as_str).collect();
        let mut state = self.state.lock().unwrap();
        for entry in state.entries.values_mut() {
            entry.lessons.retain(|lesson| {
                if ids.contains(lesson.id.as_str()) {
                    return false;
                }
                if let Some(series_id) = &filter.series_id {
                    if lesson.series_id.as_deref() == Some(series_id.as_str())
                        && lesson.status == LessonStatus::Scheduled
                        && filter
                            .start_from
                            .map(|cutoff| lesson.start_at >= cutoff)
                            .unwrap_or(true)
                    {
                        return false;
                    }
                }
                true
            });
        }
    }

    /// Lessons currently cached for a range, if any.
    pub fn snapshot(&self, range: &DateRange) -> Option<Vec<Lesson>> {
        let state = self.state.lock().unwrap();
        state.entries.get(&range.key()).map(|e| e.lessons.clone())
    }

    /// Lessons of the active view, if one has been loaded.
    pub fn active_lessons(&self) -> Option<Vec<Lesson>> {
        let state = self.state.lock().unwrap();
        let key = state.active_key.as_ref()?;
        state.entries.get(key).map(|e| e.lessons.clone())
    }
}
