use sha2::{Digest, Sha256};

use crate::chain::{Filter, FilterOutput};
use crate::error::FilterResult;

/// Pass-through stage that counts bytes.
pub struct SizeFilter {
    name: String,
    size: u64,
}

impl SizeFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), size: 0 }
    }
}

impl Filter for SizeFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        self.size += input.len() as u64;
        output.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _output: &mut Vec<u8>) -> FilterResult<()> {
        Ok(())
    }

    fn result(&self) -> Option<FilterOutput> {
        Some(FilterOutput::Size(self.size))
    }
}

/// Pass-through stage that accumulates a SHA-256 digest.
pub struct HashFilter {
    name: String,
    hasher: Sha256,
    digest: Option<String>,
}

impl HashFilter {
    pub fn sha256(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hasher: Sha256::new(),
            digest: None,
        }
    }
}

impl Filter for HashFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()> {
        self.hasher.update(input);
        output.extend_from_slice(input);
        Ok(())
    }

    fn finish(&mut self, _output: &mut Vec<u8>) -> FilterResult<()> {
        let hasher = std::mem::take(&mut self.hasher);
        self.digest = Some(hex::encode(hasher.finalize()));
        Ok(())
    }

    fn result(&self) -> Option<FilterOutput> {
        self.digest.clone().map(FilterOutput::Hash)
    }
}
