pub mod memory;
pub mod profile;
pub mod sqlite;
