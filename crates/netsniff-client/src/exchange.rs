//! Per-exchange capture context

use std::sync::Arc;

use crate::assembler::LogAssembler;
use crate::model::RequestEntry;

/// State shared by every hook of one request/response exchange.
///
/// Created by the pre-send hook and threaded explicitly through the later
/// hooks. Cloning is cheap; all clones refer to the same exchange.
#[derive(Clone)]
pub struct Exchange {
    id: Arc<str>,
    assembler: Arc<LogAssembler>,
    request: Arc<RequestEntry>,
}

impl Exchange {
    pub(crate) fn new(id: String, request: RequestEntry, assembler: LogAssembler) -> Self {
        Self {
            id: id.into(),
            assembler: Arc::new(assembler),
            request: Arc::new(request),
        }
    }

    /// Log id of this exchange
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn assembler(&self) -> &LogAssembler {
        &self.assembler
    }

    /// The request as known before body capture (no body)
    pub fn request(&self) -> &RequestEntry {
        &self.request
    }

    /// Request content type, if one was declared
    pub(crate) fn request_content_type(&self) -> Option<&str> {
        Some(self.request.body_type.as_str()).filter(|t| !t.is_empty())
    }

    /// Request entry carrying `body`
    pub(crate) fn request_with_body(&self, body: Option<String>) -> RequestEntry {
        RequestEntry {
            body,
            ..(*self.request).clone()
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("phase", &self.assembler.phase())
            .finish()
    }
}
