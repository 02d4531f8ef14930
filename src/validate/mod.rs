//! Validation collaborator.
//!
//! Rules live on the user's types through the `validator` crate's
//! `#[derive(Validate)]`; the router only calls a [`Validator`] and surfaces
//! its error unchanged.

use validator::{Validate, ValidationErrors};

/// Validates a bound value before a handler acts on it.
///
/// Install a custom implementation with
/// [`Router::set_validator`](crate::Router::set_validator).
pub trait Validator: Send + Sync {
    fn validate(&self, target: &dyn Validate) -> Result<(), ValidationErrors>;
}

/// Runs the value's own derived rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

impl Validator for DefaultValidator {
    fn validate(&self, target: &dyn Validate) -> Result<(), ValidationErrors> {
        target.validate()
    }
}
