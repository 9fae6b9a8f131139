use crate::error::TemplateError;
use crate::template::{CompiledTemplate, TemplateEngine, TemplateProvider};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Provider that counts compiles and can be slowed down to widen races.
pub(crate) struct CountingProvider {
    engine: TemplateEngine,
    compiles: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            engine: TemplateEngine::default(),
            compiles: AtomicUsize::new(0),
            delay: None,
        })
    }

    pub(crate) fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            engine: TemplateEngine::default(),
            compiles: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    pub(crate) fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl TemplateProvider for CountingProvider {
    fn compile(&self, source: &str) -> Result<CompiledTemplate, TemplateError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.engine.compile(source)
    }
}
