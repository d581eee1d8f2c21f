//! Encryption overlay
//!
//! encfs presents a plaintext view of an encrypted directory. The volume's
//! parameters live in a marker file next to the ciphertext; see
//! [`cipher`].

pub mod cipher;
pub mod manager;

pub use cipher::{CipherAlgorithm, CipherConfig, NameEncoding, MARKER_FILE};
pub use manager::{OverlayHandle, OverlayManager};
