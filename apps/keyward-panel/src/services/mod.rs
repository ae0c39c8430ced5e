pub mod admin_service;
pub mod export_service;
pub mod key_service;
pub mod license_service;
pub mod logging_service;
pub mod rate_limit_service;
pub mod verification_service;

pub use admin_service::LifecycleAdmin;
pub use key_service::{KeyFormat, KeyGenerator};
pub use license_service::VerificationOutcome;
pub use logging_service::{AuditSink, CallerInfo, LoggingService};
pub use rate_limit_service::{RateLimiter, RouteClass};
pub use verification_service::VerificationService;
