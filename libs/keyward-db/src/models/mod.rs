pub mod audit;
pub mod license;
