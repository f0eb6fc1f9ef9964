//! Core trait abstractions for the batch extraction library.
//!
//! These traits define the interfaces that applications implement
//! to provide extraction, validation, and storage capabilities.

pub mod extractor;
pub mod store;
pub mod validator;
