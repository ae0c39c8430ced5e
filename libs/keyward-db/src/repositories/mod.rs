pub mod license_repo;
pub mod log_repo;

pub use license_repo::{LicenseRepository, LicenseStore};
pub use log_repo::LogRepository;

/// `%term%` with LIKE wildcards in `term` escaped; pair with `ESCAPE '\\'`.
pub(crate) fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}
