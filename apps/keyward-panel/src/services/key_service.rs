use rand::{Rng, SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::warn;

/// Tail length used when a format leaves no room after the prefix.
pub const MIN_RANDOM_TAIL: usize = 10;

pub const MAX_KEY_LENGTH: usize = 128;
pub const MAX_PREFIX_LENGTH: usize = 32;
pub const MAX_CHARSET_LENGTH: usize = 256;

pub const DEFAULT_PREFIX: &str = "zz";
pub const DEFAULT_LENGTH: usize = 18;
pub const DEFAULT_CHARSET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyFormatError {
    #[error("invalid key format: {0}")]
    InvalidConfig(String),
}

/// Shape of generated license keys: `prefix` followed by random characters
/// from `charset`, `length` characters in total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyFormat {
    pub prefix: String,
    pub length: usize,
    pub charset: String,
}

impl Default for KeyFormat {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            length: DEFAULT_LENGTH,
            charset: DEFAULT_CHARSET.to_string(),
        }
    }
}

impl KeyFormat {
    pub fn validate(&self) -> Result<(), KeyFormatError> {
        if self.charset.is_empty() {
            return Err(KeyFormatError::InvalidConfig(
                "charset must not be empty".to_string(),
            ));
        }
        if self.charset.chars().count() > MAX_CHARSET_LENGTH {
            return Err(KeyFormatError::InvalidConfig(format!(
                "charset exceeds {} characters",
                MAX_CHARSET_LENGTH
            )));
        }
        let prefix_len = self.prefix.chars().count();
        if prefix_len > MAX_PREFIX_LENGTH {
            return Err(KeyFormatError::InvalidConfig(format!(
                "prefix exceeds {} characters",
                MAX_PREFIX_LENGTH
            )));
        }
        if self.length > MAX_KEY_LENGTH {
            return Err(KeyFormatError::InvalidConfig(format!(
                "length {} exceeds {}",
                self.length, MAX_KEY_LENGTH
            )));
        }
        if self.length <= prefix_len {
            return Err(KeyFormatError::InvalidConfig(format!(
                "length {} leaves no room after prefix '{}'",
                self.length, self.prefix
            )));
        }
        Ok(())
    }

    pub fn tail_len(&self) -> usize {
        let prefix_len = self.prefix.chars().count();
        if self.length > prefix_len {
            self.length - prefix_len
        } else {
            MIN_RANDOM_TAIL
        }
    }

    pub fn total_len(&self) -> usize {
        self.prefix.chars().count() + self.tail_len()
    }
}

/// Produces license keys from a cryptographically secure generator.
pub struct KeyGenerator {
    rng: Mutex<StdRng>,
}

impl KeyGenerator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    pub fn generate(&self, format: &KeyFormat) -> Result<String, KeyFormatError> {
        let alphabet: Vec<char> = format.charset.chars().collect();
        if alphabet.is_empty() {
            return Err(KeyFormatError::InvalidConfig(
                "charset must not be empty".to_string(),
            ));
        }

        if format.length > MAX_KEY_LENGTH {
            return Err(KeyFormatError::InvalidConfig(format!(
                "length {} exceeds {}",
                format.length, MAX_KEY_LENGTH
            )));
        }

        if format.length <= format.prefix.chars().count() {
            warn!(
                "Key length {} does not exceed prefix '{}', using a {}-character tail",
                format.length, format.prefix, MIN_RANDOM_TAIL
            );
        }

        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let tail: String = (0..format.tail_len())
            .map(|_| alphabet[rng.random_range(0..alphabet.len())])
            .collect();

        Ok(format!("{}{}", format.prefix, tail))
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Structural check for imported or hand-typed keys. Verification itself
/// matches keys exactly and never calls this.
pub fn validate_format(key: &str, format: &KeyFormat) -> bool {
    if key.chars().count() != format.total_len() {
        return false;
    }
    match key.strip_prefix(format.prefix.as_str()) {
        Some(tail) => tail.chars().all(|c| format.charset.contains(c)),
        None => false,
    }
}
