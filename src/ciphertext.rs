use std::fmt;

use crate::backend::HeBackend;
use crate::codec::SlotLayout;
use crate::crypto::CkksBackend;

/// A backend ciphertext plus what the engine knows about its contents.
///
/// `layout` says where each logical element sits; `level` is the depth
/// consumed so far.
pub struct Ciphertext<B: HeBackend = CkksBackend> {
    inner: B::Ciphertext,
    layout: SlotLayout,
    level: usize,
}

impl<B: HeBackend> Ciphertext<B> {
    pub fn new(backend: &B, inner: B::Ciphertext, layout: SlotLayout) -> Self {
        let level = backend.level_of(&inner);
        Self {
            inner,
            layout,
            level,
        }
    }

    pub fn inner(&self) -> &B::Ciphertext {
        &self.inner
    }

    pub fn into_inner(self) -> B::Ciphertext {
        self.inner
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    /// Number of logical elements.
    pub fn slot_count(&self) -> usize {
        self.layout.len()
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Remaining multiplicative budget under `depth`.
    pub fn remaining_depth(&self, depth: usize) -> usize {
        depth.saturating_sub(self.level)
    }
}

impl<B: HeBackend> Clone for Ciphertext<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            layout: self.layout,
            level: self.level,
        }
    }
}

impl<B: HeBackend> fmt::Debug for Ciphertext<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ciphertext")
            .field("layout", &self.layout)
            .field("level", &self.level)
            .field("inner", &self.inner)
            .finish()
    }
}
