pub mod models;
pub mod db;
pub mod error;
pub mod repositories;

pub use sqlx;
pub use db::{connect, connect_in_memory};
pub use error::{StoreError, StoreResult};
