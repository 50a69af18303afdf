use bytes::Bytes;
use std::collections::HashMap;

pub const SUGGESTED_POOL_CONCURRENCY: &str = "suggested_pool_concurrency";

/// Values announced by the server through ParameterStatus and ServerKeyData.
#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
    params: HashMap<String, Bytes>,
    key_data: Option<[u8; 32]>,
}

impl ServerSettings {
    pub fn set(&mut self, name: &[u8], value: Bytes) {
        self.params
            .insert(String::from_utf8_lossy(name).into_owned(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.params.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Hint for how many connections an external pool should open.
    pub fn suggested_pool_concurrency(&self) -> Option<usize> {
        self.get_str(SUGGESTED_POOL_CONCURRENCY)
            .and_then(|v| v.trim().parse().ok())
    }

    pub fn key_data(&self) -> Option<&[u8; 32]> {
        self.key_data.as_ref()
    }

    pub(crate) fn set_key_data(&mut self, data: [u8; 32]) {
        self.key_data = Some(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_concurrency_is_parsed_leniently() {
        let mut settings = ServerSettings::default();
        assert_eq!(settings.suggested_pool_concurrency(), None);
        settings.set(b"suggested_pool_concurrency", Bytes::from_static(b" 12 "));
        assert_eq!(settings.suggested_pool_concurrency(), Some(12));
        settings.set(b"suggested_pool_concurrency", Bytes::from_static(b"many"));
        assert_eq!(settings.suggested_pool_concurrency(), None);
        assert_eq!(settings.len(), 1);
    }
}
