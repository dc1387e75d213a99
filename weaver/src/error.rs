//! Client-surfaced errors.

use failure::Fail;

/// A user-visible failure: the request was understood but cannot be
/// honored. These abort the enclosing transaction or node program and are
/// relayed to the client; they are never retried internally.
#[derive(Clone, Debug, Eq, Fail, PartialEq, Serialize, Deserialize)]
pub enum UserError {
    #[fail(display = "node not found")]
    NodeNotFound,
    #[fail(display = "edge not found")]
    EdgeNotFound,
    #[fail(display = "element already exists")]
    AlreadyExists,
    #[fail(display = "bad parameters: {}", reason)]
    BadParams { reason: String },
}

impl UserError {
    pub fn bad_params<S: Into<String>>(reason: S) -> UserError {
        UserError::BadParams {
            reason: reason.into(),
        }
    }
}
