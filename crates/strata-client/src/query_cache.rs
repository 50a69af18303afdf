use lru::LruCache;
use std::num::NonZeroUsize;
use strata_codec::{CodecRef, CodecRegistry};
use strata_core::TypeId;
use strata_protocol::messages::{Capabilities, Cardinality, OutputFormat};

/// Everything needed to execute a command without parsing it again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedCommand {
    pub text: String,
    pub output_format: OutputFormat,
    pub expected_cardinality: Cardinality,
    pub input_type: TypeId,
    pub input_codec: CodecRef,
    pub output_type: TypeId,
    pub output_codec: CodecRef,
    pub capabilities: Capabilities,
    pub result_cardinality: Cardinality,
}

impl PreparedCommand {
    /// Both codecs still belong to the registry's current generation.
    pub fn is_current(&self, registry: &CodecRegistry) -> bool {
        registry.is_current(self.input_codec) && registry.is_current(self.output_codec)
    }
}

type CacheKey = (String, OutputFormat, Cardinality);

/// LRU of prepared commands, keyed by what the server compiled.
#[derive(Debug)]
pub struct QueryCache {
    entries: LruCache<CacheKey, PreparedCommand>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(
        &mut self,
        text: &str,
        output_format: OutputFormat,
        expected_cardinality: Cardinality,
    ) -> Option<&PreparedCommand> {
        self.entries
            .get(&(text.to_string(), output_format, expected_cardinality))
    }

    pub fn insert(&mut self, command: PreparedCommand) {
        let key = (
            command.text.clone(),
            command.output_format,
            command.expected_cardinality,
        );
        self.entries.put(key, command);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
