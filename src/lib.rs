//! Policy-gated streaming encryption.
//!
//! A publisher encrypts a live stream under one collection key derived
//! against a KAS public key; subscribers obtain that key through a rewrap
//! that the KAS only grants after its policy and session checks pass.

pub mod header;
pub mod modules;
pub mod session_manager;

pub use header::{BinaryParser, Header, ParsingError, Policy, ResourceLocator};
pub use modules::collection::{Collection, CollectionBuilder, CollectionDecryptor, CollectionItem};
pub use modules::crypto::{CollectionKey, EcdhAesGcmBackend, KeyWrapBackend};
pub use session_manager::{SessionManager, SessionManagerConfig, SessionState};
