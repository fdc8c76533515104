mod checksum;

pub use checksum::{hash_file_hex, verify_patch, VerifyFailure};
