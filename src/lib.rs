//! vinery - application catalog and installer engine for Wine prefixes
//!
//! Keeps a catalog of installable applications synchronized from one or more
//! repositories and runs their installer scripts against isolated virtual
//! drives, one writer per drive at a time.

pub mod app;
pub mod drives;
pub mod events;
pub mod logging;
pub mod pool;
pub mod repository;
pub mod script;
pub mod services;
pub mod settings;

pub use app::Vinery;
