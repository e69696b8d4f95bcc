//! Per-invocation telemetry context.
//!
//! Carries the identifying fields of one invocation and the `tracing` span
//! they are recorded on. Passed explicitly to every component that logs.

use tracing::field;

#[derive(Debug, Clone)]
pub struct InvocationContext {
    request_id: String,
    registry: Option<String>,
    repository: Option<String>,
    image_digest: Option<String>,
    index_digest: Option<String>,
    span: tracing::Span,
}

impl InvocationContext {
    /// Create a context with a freshly generated request id.
    pub fn new() -> Self {
        Self::with_request_id(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        let span = tracing::info_span!(
            "invocation",
            request_id = %request_id,
            registry = field::Empty,
            repository = field::Empty,
            digest = field::Empty,
            index_digest = field::Empty,
        );
        Self {
            request_id,
            registry: None,
            repository: None,
            image_digest: None,
            index_digest: None,
            span,
        }
    }

    /// Record the parsed image reference.
    pub fn set_image(&mut self, registry: &str, repository: &str, digest: &str) {
        self.span.record("registry", registry);
        self.span.record("repository", repository);
        self.span.record("digest", digest);
        self.registry = Some(registry.to_string());
        self.repository = Some(repository.to_string());
        self.image_digest = Some(digest.to_string());
    }

    /// Record the digest of the built index.
    pub fn set_index_digest(&mut self, digest: &str) {
        self.span.record("index_digest", digest);
        self.index_digest = Some(digest.to_string());
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn registry(&self) -> Option<&str> {
        self.registry.as_deref()
    }

    pub fn repository(&self) -> Option<&str> {
        self.repository.as_deref()
    }

    pub fn image_digest(&self) -> Option<&str> {
        self.image_digest.as_deref()
    }

    pub fn index_digest(&self) -> Option<&str> {
        self.index_digest.as_deref()
    }

    /// Span every event of this invocation is recorded under.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_request_ids_are_unique() {
        let a = InvocationContext::new();
        let b = InvocationContext::new();
        assert_ne!(a.request_id(), b.request_id());
        assert_eq!(a.request_id().len(), 32);
    }

    #[test]
    fn test_fields_are_recorded() {
        let mut ctx = InvocationContext::with_request_id("req-1");
        assert_eq!(ctx.request_id(), "req-1");
        assert!(ctx.registry().is_none());

        ctx.set_image("registry.example.com", "team/app", "sha256:abc");
        ctx.set_index_digest("sha256:def");

        assert_eq!(ctx.registry(), Some("registry.example.com"));
        assert_eq!(ctx.repository(), Some("team/app"));
        assert_eq!(ctx.image_digest(), Some("sha256:abc"));
        assert_eq!(ctx.index_digest(), Some("sha256:def"));
    }
}
