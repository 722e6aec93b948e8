pub mod config;
pub mod domain;
pub mod error;
pub mod openalex;
pub mod output;
pub mod refresh;
pub mod schema;
pub mod store;
pub mod summary;
pub mod transform;
