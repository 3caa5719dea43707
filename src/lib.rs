pub mod backup;
pub mod db;
pub mod directory;
mod error;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod remote;
pub mod schedule;
pub mod schema;
pub mod settings;
pub mod state;
pub mod sync;
pub mod time;
pub mod vault;

pub use error::{AppError, AppResult};
