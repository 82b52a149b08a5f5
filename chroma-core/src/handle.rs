use std::sync::Arc;

use tracing::{debug, info};

/// A lazily loaded, releasable reference to one of the pipeline's sub-models.
///
/// The handle only ever drops *its own* reference: anything that cloned the `Arc` (a running
/// latent sequence, say) keeps the model alive until it is done with it. Releasing is purely a
/// hint that backing memory may be reclaimed, so calling it twice, or never, is fine.
pub struct ModelHandle<M> {
    name: &'static str,
    model: Option<Arc<M>>,
    released: bool,
}

impl<M> ModelHandle<M> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            model: None,
            released: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Return the model, running `load` first if it is not resident.
    pub fn get_or_load<E>(&mut self, load: impl FnOnce() -> Result<M, E>) -> Result<Arc<M>, E> {
        if let Some(model) = &self.model {
            return Ok(model.clone());
        }
        if self.released {
            info!("Reloading {} after it was released", self.name);
        } else {
            info!("Loading {}", self.name);
        }
        let model = Arc::new(load()?);
        self.model = Some(model.clone());
        self.released = false;
        Ok(model)
    }

    /// Drop the retained reference.
    pub fn release(&mut self) {
        if self.model.take().is_some() {
            debug!("Released {}", self.name);
            self.released = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_once() {
        let mut handle = ModelHandle::<u32>::new("counter");
        let mut loads = 0;
        for _ in 0..3 {
            let model = handle
                .get_or_load(|| {
                    loads += 1;
                    Ok::<_, ()>(7)
                })
                .unwrap();
            assert_eq!(*model, 7);
        }
        assert_eq!(loads, 1);
        assert!(handle.is_loaded());
    }

    #[test]
    fn release_is_idempotent_and_keeps_outside_clones() {
        let mut handle = ModelHandle::<String>::new("text");
        let held = handle
            .get_or_load(|| Ok::<_, ()>("weights".to_string()))
            .unwrap();
        handle.release();
        handle.release();
        assert!(!handle.is_loaded());
        assert_eq!(held.as_str(), "weights");
        assert_eq!(Arc::strong_count(&held), 1);
    }

    #[test]
    fn reloads_after_release() {
        let mut handle = ModelHandle::<u8>::new("flow");
        handle.get_or_load(|| Ok::<_, ()>(1)).unwrap();
        handle.release();
        let model = handle.get_or_load(|| Ok::<_, ()>(2)).unwrap();
        assert_eq!(*model, 2);
    }

    #[test]
    fn load_errors_leave_handle_empty() {
        let mut handle = ModelHandle::<u8>::new("vae");
        assert_eq!(handle.get_or_load(|| Err("missing file")), Err("missing file"));
        assert!(!handle.is_loaded());
    }
}
