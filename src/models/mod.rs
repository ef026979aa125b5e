mod auth;
mod catalog;
mod customer;
mod message;
mod task;
mod tenant;

pub use auth::*;
pub use catalog::*;
pub use customer::*;
pub use message::*;
pub use task::*;
pub use tenant::*;

/// A stored or submitted value that is not one of an enum's variants
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
