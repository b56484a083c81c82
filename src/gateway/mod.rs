//! Gateway assembly

mod builder;
mod data;

pub use builder::{Mimir, MimirBuilder};
pub use data::DataGateway;
