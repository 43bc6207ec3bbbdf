//! Data structures for rule-set configuration.
//!
//! Pure data types loaded from RON: unit types and the registry that
//! indexes them. No IO beyond reading the given file.

mod registry;
mod unit_data;

pub use registry::UnitTypeRegistry;
pub use unit_data::{AaProfile, Domain, UnitTrait, UnitType};
