pub mod archive;
pub mod creds;
pub mod crypto;
pub mod file;
pub mod layout;
pub mod manifest;
pub mod options;
pub mod store;
pub mod wildcard;

pub use creds::{CredentialRefresher, CredsError};
pub use crypto::CryptoError;
pub use file::{FileError, FileRecord};
pub use layout::{MANIFEST_NAME, TRIGGER_NAME};
pub use manifest::{Manifest, ManifestError};
pub use options::{Options, OptionsError};
pub use store::{GcsStore, ObjectStore, S3Store, StoreError};
pub use wildcard::wildcard_to_regex;
