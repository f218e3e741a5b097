//! Build-time validation errors.
//!
//! Only graph construction returns hard errors. Everything that goes wrong
//! while a run is in flight is absorbed into per-field fail reasons and never
//! unwinds the run.

use thiserror::Error;

/// Errors raised while validating node specs or assembling the graph.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("graph config must have an id")]
    MissingGraphId,
    #[error("graph must have a root node")]
    MissingRoot,
    #[error("field must have a code")]
    MissingFieldCode,
    #[error("field [{0}] must have a source key")]
    MissingSourceKey(String),
    #[error("duplicate field code [{0}] on one node")]
    DuplicateFieldCode(String),
    #[error("duplicate variable param [{0}] on one node")]
    DuplicateParam(String),
    #[error("param name can not be empty")]
    MissingParamName,
    #[error("param [{0}] must reference a field")]
    MissingParamField(String),
    #[error("no node produces field [{0}]")]
    FieldNotFound(String),
}
