use std::collections::BTreeMap;
use std::fmt;

use tracing::trace;

use crate::error::{FilterError, FilterResult};

/// Value accumulated by a stage over the whole stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FilterOutput {
    Size(u64),
    Hash(String),
}

/// Accumulated results of every stage that reports one, keyed by stage name.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterResults(BTreeMap<String, FilterOutput>);

impl FilterResults {
    pub fn get(&self, name: &str) -> Option<&FilterOutput> {
        self.0.get(name)
    }

    pub fn size(&self, name: &str) -> Option<u64> {
        match self.0.get(name) {
            Some(FilterOutput::Size(size)) => Some(*size),
            _ => None,
        }
    }

    pub fn hash(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(FilterOutput::Hash(hash)) => Some(hash),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FilterOutput)> {
        self.0.iter()
    }
}

/// One stateful transform in a [`FilterChain`].
///
/// A stage may buffer: `process` can emit fewer (or more) bytes than it was
/// given. `finish` flushes whatever is buffered and is called exactly once.
pub trait Filter: Send {
    /// Stage name, also the key of its entry in [`FilterResults`].
    fn name(&self) -> &str;

    fn process(&mut self, input: &[u8], output: &mut Vec<u8>) -> FilterResult<()>;

    fn finish(&mut self, output: &mut Vec<u8>) -> FilterResult<()>;

    fn result(&self) -> Option<FilterOutput> {
        None
    }
}

/// Ordered sequence of filter stages; bytes flow from the first stage to the last.
#[derive(Default)]
pub struct FilterChain {
    stages: Vec<Box<dyn Filter>>,
    finished: bool,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: impl Filter + 'static) -> &mut Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn with(mut self, stage: impl Filter + 'static) -> Self {
        self.push(stage);
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Stage names in flow order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run one input chunk through every stage.
    ///
    /// The returned buffer may be empty when a stage is still buffering.
    pub fn process(&mut self, input: &[u8]) -> FilterResult<Vec<u8>> {
        if self.finished {
            return Err(FilterError::Finished);
        }
        let mut stages = self.stages.iter_mut();
        let Some(first) = stages.next() else {
            return Ok(input.to_vec());
        };
        let mut carry = Vec::with_capacity(input.len());
        first.process(input, &mut carry)?;
        for stage in stages {
            if carry.is_empty() {
                break;
            }
            let mut next = Vec::with_capacity(carry.len());
            stage.process(&carry, &mut next)?;
            carry = next;
        }
        Ok(carry)
    }

    /// Flush every stage in order, feeding each stage's tail to the stages after it.
    pub fn finish(&mut self) -> FilterResult<Vec<u8>> {
        if self.finished {
            return Err(FilterError::Finished);
        }
        self.finished = true;
        let mut carry = Vec::new();
        for stage in &mut self.stages {
            let mut next = Vec::new();
            if !carry.is_empty() {
                stage.process(&carry, &mut next)?;
            }
            stage.finish(&mut next)?;
            carry = next;
        }
        trace!(target: "ferry::filter", stages = ?self.names(), tail = carry.len(), "chain finished");
        Ok(carry)
    }

    pub fn results(&self) -> FilterResults {
        FilterResults(
            self.stages
                .iter()
                .filter_map(|s| s.result().map(|r| (s.name().to_string(), r)))
                .collect(),
        )
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("stages", &self.names())
            .field("finished", &self.finished)
            .finish()
    }
}
