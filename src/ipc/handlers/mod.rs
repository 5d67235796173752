pub mod backup;
pub mod core;
pub mod courses;
pub mod exports;
pub mod metrics;
pub mod org;
pub mod registrations;
pub mod reports;
pub mod results;
pub mod sessions;
pub mod students;
