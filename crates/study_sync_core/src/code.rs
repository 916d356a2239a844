//! crates/study_sync_core/src/code.rs
//!
//! Human-shareable group join codes.

use rand::Rng;

/// 32 symbols; `I`, `O`, `0` and `1` are left out because they are easy to misread.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_LENGTH: usize = 6;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("Please enter a {CODE_LENGTH}-character code")]
    WrongLength,
    #[error("'{0}' never appears in a group code")]
    InvalidCharacter(char),
}

pub fn generate_group_code() -> String {
    generate_group_code_with(&mut rand::thread_rng())
}

pub fn generate_group_code_with<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Trims and upper-cases user input, then checks it could be a real code.
pub fn normalize_join_code(input: &str) -> Result<String, CodeError> {
    let code = input.trim().to_uppercase();
    if code.chars().count() != CODE_LENGTH {
        return Err(CodeError::WrongLength);
    }
    if let Some(bad) = code.chars().find(|c| !c.is_ascii() || !CODE_ALPHABET.contains(&(*c as u8))) {
        return Err(CodeError::InvalidCharacter(bad));
    }
    Ok(code)
}
