//! The boundary with the translation cache of the execution engine.

use std::sync::Mutex;

pub trait TranslationCache: Send + Sync {
    /// Throws away any translations made from code in `[start, start + len)`.
    /// `who` names the caller, for debug output.
    fn discard_translations(&self, start: usize, len: usize, who: &str);
}

/// Remembers which ranges were invalidated. With no execution engine
/// attached there is nothing to discard.
#[derive(Debug, Default)]
pub struct DiscardLog {
    ranges: Mutex<Vec<(usize, usize)>>,
}

impl DiscardLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> Vec<(usize, usize)> {
        self.ranges.lock().unwrap().clone()
    }
}

impl TranslationCache for DiscardLog {
    fn discard_translations(&self, start: usize, len: usize, who: &str) {
        log::debug!("discard_translations({start:#x}, {len:#x}) for {who}");
        self.ranges.lock().unwrap().push((start, len));
    }
}
