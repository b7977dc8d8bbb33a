//! Data-access objects.
//!
//! This module provides:
//! - The type-erased [`Dao`] trait the registry caches
//! - [`BaseDao`], the default implementation for any [`Entity`](crate::models::Entity)
//! - [`DaoDescriptor`], the constructor shapes a DAO implementation accepts
//! - [`DaoRegistry`], the process-wide cache of constructed DAOs

pub mod base;
pub mod descriptor;
pub mod registry;

pub use base::{AsAnyArc, BaseDao, Dao};
pub use descriptor::{DaoConstructor, DaoDescriptor};
pub use registry::DaoRegistry;
