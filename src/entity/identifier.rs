use uuid::Uuid;

/// Source of entity identifiers.
pub trait IdentifierFactory: Send + Sync {
    fn create(&self) -> String;

    /// True when `id` is something this factory could have produced.
    fn is_valid(&self, id: &str) -> bool;
}

/// Random 128-bit identifiers rendered as canonical hyphenated GUIDs.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuidIdentifierFactory;

impl IdentifierFactory for GuidIdentifierFactory {
    fn create(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn is_valid(&self, id: &str) -> bool {
        // Canonical form only: must survive a parse/format round trip unchanged.
        match Uuid::parse_str(id) {
            Ok(parsed) => parsed.to_string() == id,
            Err(_) => false,
        }
    }
}
