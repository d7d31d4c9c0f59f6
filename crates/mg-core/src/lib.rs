//! Core types for meshgate
//!
//! This crate provides the fundamental types used throughout the meshgate
//! gateway: the `Ieee` device address, typed attribute values with the
//! coercion/comparison kernel, the attribute-change feed event, and the
//! per-device attribute/command catalogs.

mod catalog;
mod event;
mod ieee;
mod value;

pub use catalog::{AttributeDescriptor, CommandDescriptor};
pub use event::AttributeChanged;
pub use ieee::{Ieee, IeeeError};
pub use value::{applicable_operators, compare, AttrType, AttrValue, CompareError, CompareOp};
