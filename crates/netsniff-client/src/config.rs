//! Sniffer configuration

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use crate::classify::{ContentClassifier, DEFAULT_CUSTOM_MEDIA_TYPES};
use crate::error::SnifferError;
use crate::observe::DEFAULT_MAX_CAPTURE_BYTES;
use crate::scope::SnifferScope;

/// Type information handed to the custom formatter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeHint {
    pub type_name: &'static str,
}

/// A typed value sent or received in the custom (schema-based binary) format.
///
/// Implemented for every `Debug + Send + Sync + 'static` type.
pub trait CustomPayload: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    fn type_hint(&self) -> TypeHint;
}

impl<T: Any + Debug + Send + Sync> CustomPayload for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_hint(&self) -> TypeHint {
        TypeHint {
            type_name: std::any::type_name::<T>(),
        }
    }
}

/// Renders a custom-format payload as text for the log
pub type CustomFormatter = Arc<dyn Fn(TypeHint, &dyn CustomPayload) -> String + Send + Sync>;

/// Pretty `Debug` output of the payload
pub fn debug_formatter() -> CustomFormatter {
    Arc::new(|_, payload| format!("{:#?}", payload))
}

/// Configuration of a [`Sniffer`](crate::Sniffer)
#[derive(Clone)]
pub struct SnifferConfig {
    pub(crate) custom_capture: bool,
    pub(crate) formatter: CustomFormatter,
    pub(crate) classifier: ContentClassifier,
    pub(crate) max_capture_bytes: usize,
    pub(crate) scope: SnifferScope,
}

impl SnifferConfig {
    pub fn builder() -> SnifferConfigBuilder {
        SnifferConfigBuilder::default()
    }

    pub fn custom_capture(&self) -> bool {
        self.custom_capture
    }

    pub fn classifier(&self) -> &ContentClassifier {
        &self.classifier
    }

    pub fn max_capture_bytes(&self) -> usize {
        self.max_capture_bytes
    }

    pub fn scope(&self) -> &SnifferScope {
        &self.scope
    }
}

impl Debug for SnifferConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnifferConfig")
            .field("custom_capture", &self.custom_capture)
            .field("classifier", &self.classifier)
            .field("max_capture_bytes", &self.max_capture_bytes)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct SnifferConfigBuilder {
    custom_capture: Option<bool>,
    formatter: Option<CustomFormatter>,
    custom_media_types: Option<Vec<String>>,
    max_capture_bytes: Option<usize>,
    scope: Option<SnifferScope>,
}

impl SnifferConfigBuilder {
    /// Capture custom-format bodies (enabled by default)
    pub fn custom_capture(mut self, enabled: bool) -> Self {
        self.custom_capture = Some(enabled);
        self
    }

    pub fn custom_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(TypeHint, &dyn CustomPayload) -> String + Send + Sync + 'static,
    {
        self.formatter = Some(Arc::new(formatter));
        self
    }

    /// Treat only `media_type` as the custom format
    pub fn custom_media_type(mut self, media_type: impl Into<String>) -> Self {
        self.custom_media_types = Some(vec![media_type.into()]);
        self
    }

    pub fn custom_media_types<I, S>(mut self, media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.custom_media_types = Some(media_types.into_iter().map(Into::into).collect());
        self
    }

    /// Largest text body kept in a log
    pub fn max_capture_bytes(mut self, limit: usize) -> Self {
        self.max_capture_bytes = Some(limit);
        self
    }

    /// Scope logging tasks run on (defaults to the current runtime)
    pub fn scope(mut self, scope: SnifferScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn build(self) -> Result<SnifferConfig, SnifferError> {
        let custom_media_types = self.custom_media_types.unwrap_or_else(|| {
            DEFAULT_CUSTOM_MEDIA_TYPES
                .iter()
                .map(|t| t.to_string())
                .collect()
        });

        if let Some(invalid) = custom_media_types
            .iter()
            .find(|t| t.split_once('/').map_or(true, |(ty, sub)| ty.is_empty() || sub.is_empty()))
        {
            return Err(SnifferError::Config(format!(
                "Invalid custom media type: {:?}",
                invalid
            )));
        }

        let max_capture_bytes = self.max_capture_bytes.unwrap_or(DEFAULT_MAX_CAPTURE_BYTES);
        if max_capture_bytes == 0 {
            return Err(SnifferError::Config(
                "max_capture_bytes must be greater than zero".to_string(),
            ));
        }

        let scope = match self.scope {
            Some(scope) => scope,
            None => SnifferScope::current()?,
        };

        Ok(SnifferConfig {
            custom_capture: self.custom_capture.unwrap_or(true),
            formatter: self.formatter.unwrap_or_else(debug_formatter),
            classifier: ContentClassifier::new(custom_media_types),
            max_capture_bytes,
            scope,
        })
    }
}
