use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::settings::DetectionKind;

use super::backend::DetectorBackend;

/// Thread-safe registry holding one detector backend per detection kind.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: BTreeMap<DetectionKind, Arc<Mutex<dyn DetectorBackend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: BTreeMap::new(),
        }
    }

    /// Register a backend for its kind, replacing any previous one.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let kind = backend.kind();
        if let Some(previous) = self.backends.insert(kind, Arc::new(Mutex::new(backend))) {
            if let Ok(previous) = previous.lock() {
                log::debug!("replaced {} backend '{}'", kind, previous.name());
            }
        }
    }

    /// Register an already boxed backend.
    pub fn register_boxed(&mut self, backend: Box<dyn DetectorBackend>) {
        let kind = backend.kind();
        let backend: Arc<Mutex<dyn DetectorBackend>> = Arc::new(Mutex::new(BoxedBackend(backend)));
        self.backends.insert(kind, backend);
    }

    pub fn get(&self, kind: DetectionKind) -> Option<Arc<Mutex<dyn DetectorBackend>>> {
        self.backends.get(&kind).cloned()
    }

    pub fn contains(&self, kind: DetectionKind) -> bool {
        self.backends.contains_key(&kind)
    }

    /// Registered `(kind, backend name)` pairs.
    pub fn list(&self) -> Result<Vec<(DetectionKind, &'static str)>> {
        self.backends
            .iter()
            .map(|(kind, backend)| {
                let guard = backend
                    .lock()
                    .map_err(|_| anyhow!("{} backend lock poisoned", kind))?;
                Ok((*kind, guard.name()))
            })
            .collect()
    }

    /// Run the backend registered for `kind`.
    pub fn detect(&self, kind: DetectionKind, frame: &Frame) -> Result<Vec<Detection>> {
        let backend = self
            .get(kind)
            .ok_or_else(|| anyhow!("no backend registered for {}", kind))?;
        let mut guard = backend
            .lock()
            .map_err(|_| anyhow!("{} backend lock poisoned", kind))?;
        guard.detect(frame)
    }

    /// Warm up every registered backend.
    pub fn warm_up(&self) -> Result<()> {
        for (kind, backend) in &self.backends {
            let mut guard = backend
                .lock()
                .map_err(|_| anyhow!("{} backend lock poisoned", kind))?;
            guard.warm_up()?;
        }
        Ok(())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct BoxedBackend(Box<dyn DetectorBackend>);

impl DetectorBackend for BoxedBackend {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn kind(&self) -> DetectionKind {
        self.0.kind()
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        self.0.detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.0.warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::FixedRegionPlateBackend;
    use crate::region::Region;

    struct CountingBackend {
        calls: usize,
    }

    impl DetectorBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn kind(&self) -> DetectionKind {
            DetectionKind::StreetSigns
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Vec<Detection>> {
            self.calls += 1;
            Ok(vec![Detection::new(
                DetectionKind::StreetSigns,
                Region::from_xywh(0, 0, 1, 1),
                self.calls as f32,
            )])
        }
    }

    #[test]
    fn registry_dispatches_by_kind() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(CountingBackend { calls: 0 });
        registry.register(FixedRegionPlateBackend::new());

        let frame = Frame::new(image::RgbImage::new(640, 480), 1);
        let first = registry.detect(DetectionKind::StreetSigns, &frame)?;
        let second = registry.detect(DetectionKind::StreetSigns, &frame)?;
        assert_eq!(first[0].confidence, 1.0);
        assert_eq!(second[0].confidence, 2.0);

        assert!(registry.detect(DetectionKind::BlockNumbers, &frame).is_err());

        let names = registry.list()?;
        assert!(names.contains(&(DetectionKind::LicensePlates, "plate-fallback")));
        assert!(names.contains(&(DetectionKind::StreetSigns, "counting")));
        Ok(())
    }
}
