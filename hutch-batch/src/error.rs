use thiserror::Error;

/// Conditions caused by what the user asked for rather than by a fault in the tools or in AWS.
///
/// The binaries report these as a plain message with exit code 1, everything else is logged with its full cause chain.
#[derive(Debug, Error)]
pub enum UserError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    NotFound(String),
}

impl UserError {
    /// Returns the user facing error in the chain of `err`, if there is one.
    pub fn find(err: &anyhow::Error) -> Option<&(dyn std::error::Error + 'static)> {
        err.chain().find(|cause| {
            cause.is::<UserError>() || cause.is::<crate::batch::template::TemplateError>()
        })
    }
}
