// src/headers.rs

/// Request-header names the server retains while parsing.
///
/// Headers the host has not opted into are parsed and discarded, which
/// bounds per-request memory.
#[derive(Debug, Default)]
pub(crate) struct ListenHeaderSet {
    names: Vec<String>,
}

impl ListenHeaderSet {
    pub fn new() -> Self {
        Self { names: Vec::new() }
    }

    /// Idempotent.
    pub fn listen(&mut self, name: &str) {
        if !self.names.iter().any(|known| known == name) {
            self.names.push(name.to_owned());
        }
    }

    /// Case-sensitive byte compare; returns the stored name on a hit.
    pub fn find(&self, raw: &[u8]) -> Option<&str> {
        self.names
            .iter()
            .map(String::as_str)
            .find(|known| known.as_bytes() == raw)
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_is_idempotent() {
        let mut set = ListenHeaderSet::new();
        set.listen("Content-Length");
        set.listen("Content-Length");
        set.listen("Host");
        assert_eq!(set.names.len(), 2);
    }

    #[test]
    fn find_is_case_sensitive() {
        let mut set = ListenHeaderSet::new();
        set.listen("Host");
        assert_eq!(set.find(b"Host"), Some("Host"));
        assert_eq!(set.find(b"host"), None);
        assert_eq!(set.find(b"Hos"), None);
    }
}
