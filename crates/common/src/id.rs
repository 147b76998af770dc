//! ID generation utilities.

use uuid::Uuid;

/// Generator for client-side correlation identifiers.
#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    _private: (),
}

impl IdGenerator {
    /// Create a new ID generator.
    #[must_use]
    pub const fn new() -> Self {
        Self { _private: () }
    }

    /// Generate a request ID for the `X-Request-Id` header.
    ///
    /// UUID v7 is time-ordered, so server logs sort by issue time.
    #[must_use]
    pub fn request_id(&self) -> String {
        Uuid::now_v7().to_string()
    }

    /// Generate an opaque session tag for a push connection.
    #[must_use]
    pub fn connection_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.request_id();
        let id2 = id_gen.request_id();

        assert_eq!(id1.len(), 36);
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_connection_id() {
        let id_gen = IdGenerator::new();
        assert_eq!(id_gen.connection_id().len(), 32);
    }
}
