//! Error conditions callers need to tell apart from generic I/O or HTTP failures.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A line in the etag cache did not hold exactly one key and one value.
    #[error("etag cache {} is corrupt at line {line}: expected `<id> <etag>`", path.display())]
    CorruptEtagCache { path: PathBuf, line: usize },

    /// The CardDAV server did not return a vCard for a requested contact.
    #[error("vCard could not be downloaded for contact '{name}'")]
    VcardNotDownloaded { name: String },

    #[error("authenticated user ({actual}) was different than the user specified ({expected})")]
    UserMismatch { expected: String, actual: String },

    #[error(
        "no web browser detected. Google's OAuth2 authorization cannot proceed in headless mode. \
         Please run this operation on a machine with a web browser."
    )]
    HeadlessAuthorization,
}
