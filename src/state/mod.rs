//! Component state: snapshot layout, checkpoint, persistence and secret
//! encryption.

pub mod checkpoint;
pub mod encryptor;
pub mod snapshot;
pub mod store;

pub use checkpoint::StateCheckpoint;
pub use encryptor::{encrypt_secrets, EncryptionScope, HttpEncryptor, SecretEncryptor};
pub use snapshot::{InputState, StateSnapshot, COMPONENT_NAMESPACE, STORAGE_NAMESPACE};
pub use store::{HttpStateStore, InMemoryStateStore, StateStore, StateTarget};
