pub mod backup_exchange;
pub mod classes;
pub mod core;
pub mod evaluations;
pub mod grades;
pub mod reports;
pub mod setup;
