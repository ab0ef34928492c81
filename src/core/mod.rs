//! Foundations shared by every stage: the error taxonomy and the
//! request-scoped types carried through the pipeline.

pub mod error;
pub mod types;
