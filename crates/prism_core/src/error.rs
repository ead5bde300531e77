//! Error types for prism_core

use thiserror::Error;

/// Errors that can occur when configuring state
#[derive(Error, Debug)]
pub enum StateError {
    /// Computed name is empty or contains a path separator
    #[error("invalid computed property name: {0:?}")]
    InvalidName(String),

    /// A computed property with this name already exists
    #[error("computed property already defined: {0}")]
    DuplicateComputed(String),

    /// The getter reads its own property
    #[error("computed property {0:?} depends on itself")]
    SelfDependency(String),

    /// The state handle has been destroyed
    #[error("state has been destroyed")]
    Destroyed,
}

/// Result type for prism_core operations
pub type Result<T> = std::result::Result<T, StateError>;
