use crate::error::EngineError;
use crate::model::Classifier;

/// Stable handle to a registered model. Generation-checked so a handle to an
/// unregistered model keeps failing even if its slot index is later reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}

pub(crate) struct RegisteredModel {
    pub classifier: Box<dyn Classifier>,
    pub sensitivity: f32,
    pub active: bool,
}

struct Slot {
    generation: u32,
    entry: Option<RegisteredModel>,
}

/// The set of loaded detection models.
///
/// Slot indices freed by `unregister` are parked and only become reusable
/// after an explicit `compact()`, never implicitly.
#[derive(Default)]
pub struct ModelRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    parked: Vec<u32>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, classifier: Box<dyn Classifier>, sensitivity: f32) -> ModelId {
        let entry = RegisteredModel {
            classifier,
            sensitivity,
            active: true,
        };
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = Some(entry);
            ModelId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                entry: Some(entry),
            });
            ModelId {
                index,
                generation: 0,
            }
        }
    }

    pub fn unregister(&mut self, id: ModelId) -> Result<(), EngineError> {
        let slot = self.slot_mut(id)?;
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.parked.push(id.index);
        Ok(())
    }

    /// Makes indices freed by earlier `unregister` calls available for reuse.
    pub fn compact(&mut self) {
        self.free.append(&mut self.parked);
    }

    pub fn set_sensitivity(&mut self, id: ModelId, sensitivity: f32) -> Result<(), EngineError> {
        self.entry_mut(id)?.sensitivity = sensitivity;
        Ok(())
    }

    pub fn set_active(&mut self, id: ModelId, active: bool) -> Result<(), EngineError> {
        self.entry_mut(id)?.active = active;
        Ok(())
    }

    pub fn is_active(&self, id: ModelId) -> Result<bool, EngineError> {
        Ok(self.entry(id)?.active)
    }

    pub fn sensitivity(&self, id: ModelId) -> Result<f32, EngineError> {
        Ok(self.entry(id)?.sensitivity)
    }

    /// Number of live models.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn entry(&self, id: ModelId) -> Result<&RegisteredModel, EngineError> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(EngineError::UnknownModel(id))
    }

    pub(crate) fn entry_mut(&mut self, id: ModelId) -> Result<&mut RegisteredModel, EngineError> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(EngineError::UnknownModel(id))
    }

    fn slot_mut(&mut self, id: ModelId) -> Result<&mut Slot, EngineError> {
        match self.slots.get_mut(id.index as usize) {
            Some(slot) if slot.generation == id.generation && slot.entry.is_some() => Ok(slot),
            _ => Err(EngineError::UnknownModel(id)),
        }
    }

    /// Live models in slot order, active or not.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (ModelId, &mut RegisteredModel)> {
        self.slots.iter_mut().enumerate().filter_map(|(index, slot)| {
            let generation = slot.generation;
            slot.entry.as_mut().map(move |entry| {
                (
                    ModelId {
                        index: index as u32,
                        generation,
                    },
                    entry,
                )
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::MelFeatureBlock;
    use crate::model::RawPrediction;

    struct StubClassifier;

    impl Classifier for StubClassifier {
        fn input_frames(&self) -> usize {
            1
        }

        fn infer(&mut self, _block: &MelFeatureBlock) -> Result<RawPrediction, EngineError> {
            Ok(RawPrediction {
                confidence: 0.0,
                class: 0,
            })
        }
    }

    fn registry_with(n: usize) -> (ModelRegistry, Vec<ModelId>) {
        let mut registry = ModelRegistry::new();
        let ids = (0..n)
            .map(|_| registry.register(Box::new(StubClassifier), 0.5))
            .collect();
        (registry, ids)
    }

    #[test]
    fn register_assigns_unique_ids() {
        let (registry, ids) = registry_with(3);
        assert_eq!(registry.len(), 3);
        assert_ne!(ids[0], ids[1]);
        assert_ne!(ids[1], ids[2]);
    }

    #[test]
    fn unregister_unknown_id_fails() {
        let (mut registry, ids) = registry_with(1);
        registry.unregister(ids[0]).unwrap();
        assert_eq!(registry.len(), 0);
        assert!(matches!(
            registry.unregister(ids[0]),
            Err(EngineError::UnknownModel(_))
        ));
    }

    #[test]
    fn freed_index_not_reused_without_compact() {
        let (mut registry, ids) = registry_with(2);
        registry.unregister(ids[0]).unwrap();
        let fresh = registry.register(Box::new(StubClassifier), 0.5);
        // without compaction the new model gets a brand new slot
        assert_ne!(fresh, ids[0]);
        assert_eq!(registry.len(), 2);
        assert!(registry.sensitivity(ids[0]).is_err());
    }

    #[test]
    fn stale_id_fails_after_compact_and_reuse() {
        let (mut registry, ids) = registry_with(1);
        registry.unregister(ids[0]).unwrap();
        registry.compact();
        let reused = registry.register(Box::new(StubClassifier), 0.7);
        // same slot, new generation
        assert_ne!(reused, ids[0]);
        assert!(matches!(
            registry.set_active(ids[0], false),
            Err(EngineError::UnknownModel(_))
        ));
        assert_eq!(registry.sensitivity(reused).unwrap(), 0.7);
    }

    #[test]
    fn set_active_does_not_touch_other_entries() {
        let (mut registry, ids) = registry_with(2);
        registry.set_sensitivity(ids[1], 0.9).unwrap();
        registry.set_active(ids[0], false).unwrap();
        assert!(!registry.is_active(ids[0]).unwrap());
        assert!(registry.is_active(ids[1]).unwrap());
        assert_eq!(registry.sensitivity(ids[1]).unwrap(), 0.9);
    }

    #[test]
    fn set_sensitivity_on_unknown_id_fails() {
        let (mut registry, ids) = registry_with(1);
        registry.unregister(ids[0]).unwrap();
        assert!(registry.set_sensitivity(ids[0], 0.2).is_err());
    }
}
