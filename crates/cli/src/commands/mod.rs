pub mod registry;
pub mod report;
pub mod setup;
pub mod status;
pub mod sweep;
