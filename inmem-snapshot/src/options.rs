use anyhow::{bail, Result};

/// Entry lengths are limited to what a `u16` length prefix can describe.
const MAX_ENTRY_LEN: usize = u16::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Longest key accepted by the write path.
    pub max_key_len: usize,
    /// Longest value accepted by the write path.
    pub max_value_len: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_key_len: MAX_ENTRY_LEN,
            max_value_len: MAX_ENTRY_LEN,
        }
    }
}

impl StoreOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_key_len == 0 {
            bail!("max_key_len must be positive");
        }
        if self.max_value_len == 0 {
            bail!("max_value_len must be positive");
        }
        Ok(())
    }

    /// Check a key, and the value when one is being written.
    pub(crate) fn check_entry(&self, key: &[u8], value: Option<&[u8]>) -> Result<()> {
        // The empty key is where `seek_to_first` starts.
        if key.is_empty() {
            bail!("key cannot be empty");
        }
        if key.len() > self.max_key_len {
            bail!(
                "key of {} bytes exceeds the limit of {} bytes",
                key.len(),
                self.max_key_len
            );
        }
        if let Some(value) = value {
            if value.len() > self.max_value_len {
                bail!(
                    "value of {} bytes exceeds the limit of {} bytes",
                    value.len(),
                    self.max_value_len
                );
            }
        }
        Ok(())
    }
}
