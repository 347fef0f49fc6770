use std::{ops::Deref, rc::Rc};

/// A guest page frame mapped into the introspector's address space.
///
/// The frame owns its host mapping; dropping the last handle is the paired
/// release of the backend resource (a foreign-memory unmap, or simply
/// freeing a copied buffer on backends without true mappings).
#[derive(Clone)]
pub struct MappedFrame(Rc<dyn Deref<Target = [u8]>>);

impl MappedFrame {
    /// Wraps a host-visible view of one guest page.
    pub fn new<T>(inner: T) -> Self
    where
        T: Deref<Target = [u8]> + 'static,
    {
        Self(Rc::new(inner))
    }
}

impl Deref for MappedFrame {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<[u8]> for MappedFrame {
    fn as_ref(&self) -> &[u8] {
        self.deref()
    }
}
