//! Known content types.

use std::collections::BTreeMap;

use crate::model::ids::ContentType;
use crate::storage::InvalidNameError;

/// Maps content type tags to human-readable labels.
///
/// An empty registry is open and accepts every well-formed tag. Registering
/// the first type closes it: from then on only registered tags are accepted.
#[derive(Debug, Clone, Default)]
pub struct ContentTypeRegistry {
    types: BTreeMap<ContentType, String>,
}

impl ContentTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content_type(mut self, tag: &str, label: &str) -> Result<Self, InvalidNameError> {
        self.register(ContentType::new(tag)?, label);
        Ok(self)
    }

    pub fn register(&mut self, content_type: ContentType, label: impl Into<String>) {
        self.types.insert(content_type, label.into());
    }

    pub fn is_open(&self) -> bool {
        self.types.is_empty()
    }

    pub fn accepts(&self, content_type: &ContentType) -> bool {
        self.is_open() || self.types.contains_key(content_type)
    }

    /// label for display, falling back to the tag itself
    pub fn label<'a>(&'a self, content_type: &'a ContentType) -> &'a str {
        self.types
            .get(content_type)
            .map(String::as_str)
            .unwrap_or_else(|| content_type.as_str())
    }

    pub fn types(&self) -> impl Iterator<Item = &ContentType> {
        self.types.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_registry_accepts_everything() {
        let registry = ContentTypeRegistry::new();
        assert!(registry.is_open());
        assert!(registry.accepts(&ContentType::new("rpm.package").unwrap()));
    }

    #[test]
    fn test_closed_registry() {
        let registry = ContentTypeRegistry::new()
            .with_content_type("file.file", "File")
            .unwrap();

        let file = ContentType::new("file.file").unwrap();
        let rpm = ContentType::new("rpm.package").unwrap();
        assert!(registry.accepts(&file));
        assert!(!registry.accepts(&rpm));
        assert_eq!(registry.label(&file), "File");
        assert_eq!(registry.label(&rpm), "rpm.package");
    }

    #[test]
    fn test_rejects_malformed_tag() {
        assert!(ContentTypeRegistry::new().with_content_type("File", "File").is_err());
    }
}
