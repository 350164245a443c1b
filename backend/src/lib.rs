//! # TutorBook Backend
//!
//! Core library for managing a tutor's recurring lessons, per-student
//! lesson-credit balances, and deduplicated reminder delivery.
//!
//! The backend follows a layered architecture:
//! ```text
//! Host (request handlers, periodic trigger)
//!     ↓
//! Domain Layer (scheduling, ledger, notification services)
//!     ↓
//! Storage Layer (sqlite, repositories)
//! ```
//!
//! There is no transport layer here; an external host invokes the services
//! directly and owns timeouts on everything that leaves the process.

pub mod domain;
pub mod gateway;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use chrono_tz::Tz;

use crate::domain::ledger_service::LedgerService;
use crate::domain::notification_service::NotificationService;
use crate::domain::range_cache::RangeCache;
use crate::domain::recurrence_service::RecurrenceService;
use crate::gateway::MessagingGateway;
use crate::storage::sqlite::db::DbConnection;
use crate::storage::sqlite::repositories::identity_repository::IdentityRepository;
use crate::storage::sqlite::repositories::ledger_repository::LedgerRepository;
use crate::storage::sqlite::repositories::lesson_repository::LessonRepository;
use crate::storage::sqlite::repositories::notification_repository::NotificationRepository;
use crate::storage::sqlite::repositories::teacher_repository::TeacherRepository;

/// All services for one teacher session, wired over a shared connection.
#[derive(Clone)]
pub struct AppState {
    pub range_cache: RangeCache,
    pub recurrence_service: RecurrenceService,
    pub ledger_service: LedgerService,
    pub notification_service: NotificationService,
}

impl AppState {
    pub fn new(
        db: DbConnection,
        gateway: Arc<dyn MessagingGateway>,
        teacher_id: &str,
        zone: Tz,
    ) -> Result<Self> {
        let lessons = Arc::new(LessonRepository::new(db.clone()));
        let ledger = Arc::new(LedgerRepository::new(db.clone()));
        let notifications = Arc::new(NotificationRepository::new(db.clone()));
        let identities = Arc::new(IdentityRepository::new(db.clone()));
        let teachers = Arc::new(TeacherRepository::new(db));

        let range_cache = RangeCache::new(lessons.clone(), teacher_id, zone);
        let recurrence_service =
            RecurrenceService::new(lessons.clone(), range_cache.clone(), zone);
        let ledger_service =
            LedgerService::new(lessons.clone(), ledger.clone(), teachers.clone());
        let notification_service = NotificationService::new(
            ledger_service.clone(),
            lessons,
            notifications,
            identities,
            teachers,
            gateway,
        );

        Ok(Self {
            range_cache,
            recurrence_service,
            ledger_service,
            notification_service,
        })
    }
}
