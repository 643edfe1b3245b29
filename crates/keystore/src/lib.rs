//! ShareCraft Keystore
//!
//! Signing key management and path utilities shared by the CLI and the
//! pipeline.
//!
//! ## Features
//!
//! - ed25519 signing key loading/generation
//! - Keys stored as Stellar secret seeds (`S...`); raw hex is also accepted
//! - Path expansion (`~`, environment variables)

mod keypair;
mod paths;

pub use keypair::{
    decode_secret, default_key_path, encode_secret, load_or_generate_signing_key, load_signing_key,
    save_signing_key, KeystoreError,
};
pub use paths::{default_config_dir, default_data_dir, expand_path};

pub type Result<T> = std::result::Result<T, KeystoreError>;
