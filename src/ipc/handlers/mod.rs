pub mod core;
pub mod documents;
pub mod imports;
pub mod performance;
pub mod results;
pub mod setup;
pub mod students;
