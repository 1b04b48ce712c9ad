pub mod analysis;
pub mod context;
pub mod feedback;
pub mod metrics;
pub mod profile;
pub mod risk;
