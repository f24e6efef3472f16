pub mod auth;
pub mod connection;
pub mod datacube;
pub mod discovery;
mod error;
pub mod job;
pub mod results;
pub mod selection;
pub mod workflow;

pub use connection::Connection;
pub use datacube::{BoundingBox, DataCube, TemporalExtent};
pub use error::{Error, Result};
