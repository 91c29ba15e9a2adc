//! Content-type based capture policy

/// Media types treated as the custom (schema-based binary) format by default
pub const DEFAULT_CUSTOM_MEDIA_TYPES: &[&str] = &["application/protobuf", "application/x-protobuf"];

/// How a body with a given content type is captured
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    /// Decode the bytes as text
    Text,
    /// Format the typed payload with the configured custom formatter
    Custom,
    /// Do not capture (binary, media, multipart or unknown length)
    Skip,
}

/// Decides how bodies are captured from their declared content type
#[derive(Debug, Clone)]
pub struct ContentClassifier {
    custom_media_types: Vec<String>,
}

impl ContentClassifier {
    pub fn new<I, S>(custom_media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            custom_media_types: custom_media_types
                .into_iter()
                .map(|t| Into::<String>::into(t).to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn custom_media_types(&self) -> &[String] {
        &self.custom_media_types
    }

    /// Classify a declared content type.
    ///
    /// Rules in priority order: missing type skips; JSON, XML, form data and
    /// `text/*` are text; the custom media types are custom; multipart, media,
    /// octet-stream and PDF skip; anything else is optimistically text.
    pub fn classify(&self, content_type: Option<&str>) -> ContentClass {
        let Some(content_type) = content_type else {
            return ContentClass::Skip;
        };
        let essence = media_type(content_type);

        if is_text(&essence) {
            ContentClass::Text
        } else if self.custom_media_types.iter().any(|t| *t == essence) {
            ContentClass::Custom
        } else if is_binary(&essence) {
            ContentClass::Skip
        } else {
            ContentClass::Text
        }
    }
}

impl Default for ContentClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_CUSTOM_MEDIA_TYPES.iter().copied())
    }
}

/// `type/subtype` of a content type, lowercased and without parameters
pub fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// `charset` parameter of a content type, if declared
pub fn charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}

fn is_text(essence: &str) -> bool {
    essence.starts_with("text/")
        || essence == "application/json"
        || essence.ends_with("+json")
        || essence == "application/xml"
        || essence.ends_with("+xml")
        || essence == "application/x-www-form-urlencoded"
}

fn is_binary(essence: &str) -> bool {
    essence.starts_with("multipart/")
        || essence.starts_with("image/")
        || essence.starts_with("audio/")
        || essence.starts_with("video/")
        || essence == "application/octet-stream"
        || essence == "application/pdf"
}
