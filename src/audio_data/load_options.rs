use crate::properties::{Properties, PropertyValue};

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Decode everything up front and keep the PCM in memory
    pub predecode: bool,
    /// Read file-backed content from disk per track instead of copying the
    /// encoded bytes into memory at load time
    pub ondemand: bool,
    /// Only try the decoder with this name (e.g. `"SYMPHONIA"`)
    pub decoder: Option<String>,
    /// Skip ID3/APE tag scanning
    pub skip_tags: bool,
    /// Extra properties handed to decoders while probing
    pub properties: Properties,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn predecode(mut self, predecode: bool) -> Self {
        self.predecode = predecode;
        self
    }

    pub fn ondemand(mut self, ondemand: bool) -> Self {
        self.ondemand = ondemand;
        self
    }

    pub fn decoder(mut self, name: impl Into<String>) -> Self {
        self.decoder = Some(name.into());
        self
    }

    pub fn skip_tags(mut self, skip: bool) -> Self {
        self.skip_tags = skip;
        self
    }

    pub fn properties(mut self, properties: Properties) -> Self {
        self.properties.extend(properties);
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: PropertyValue) -> Self {
        self.properties.set(key, value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let options = LoadOptions::new()
            .predecode(true)
            .decoder("RAW")
            .property("raw.channels", PropertyValue::Number(2));
        assert!(options.predecode);
        assert!(!options.ondemand);
        assert_eq!(options.decoder.as_deref(), Some("RAW"));
        assert_eq!(options.properties.number("raw.channels"), Some(2));
    }
}
