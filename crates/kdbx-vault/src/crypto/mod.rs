//! Cryptographic building blocks: key derivation, the outer data cipher,
//! block integrity streams and the inner protected-field keystream.

pub mod block_stream;
pub mod cipher;
pub mod inner_stream;
pub mod kdf;
