use tracing::{info_span, Span};

/// Scoped logging handle passed explicitly to every pipeline stage.
#[derive(Debug, Clone)]
pub struct StageContext {
    span: Span,
}

impl StageContext {
    pub fn session(prefix: &str) -> Self {
        Self {
            span: info_span!("session", prefix = %prefix),
        }
    }

    /// Child context for one series inside this session.
    pub fn series(&self, source: &str) -> Self {
        let span = self
            .span
            .in_scope(|| info_span!("series", source = %source));
        Self { span }
    }

    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        self.span.in_scope(f)
    }

    pub fn info(&self, message: &str) {
        self.in_scope(|| tracing::info!("{}", message));
    }

    pub fn warn(&self, message: &str) {
        self.in_scope(|| tracing::warn!("{}", message));
    }

    pub fn debug(&self, message: &str) {
        self.in_scope(|| tracing::debug!("{}", message));
    }
}

impl Default for StageContext {
    fn default() -> Self {
        Self {
            span: Span::none(),
        }
    }
}
