pub mod audit;
pub mod clock;
pub mod error;
pub mod memory_store;
pub mod notify;
pub mod pg_store;
pub mod service;
pub mod store;

pub use audit::{AuditLogService, PgAuditLog};
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{QueueError, StoreError};
pub use memory_store::MemoryAppointmentStore;
pub use notify::{LogNotifier, NotificationService, WebhookNotifier};
pub use pg_store::PgAppointmentStore;
pub use service::{AppointmentChanges, BookingRequest, QueueService, QueueSettings};
pub use store::{AppointmentStore, StoreTx};
