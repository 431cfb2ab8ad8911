//! Track groups: buckets of tracks sharing one postmix callback.

use crate::config::AudioSpec;
use crate::error::{PetalMixError, Result};
use crate::mixer::{Mixer, MixerShared};
use crate::track::{Track, TrackShared};
use std::sync::{Arc, Weak};

/// Slot index plus generation, so a stale handle never reaches a group
/// that reused its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId {
    index: u32,
    generation: u32,
}

impl GroupId {
    pub const DEFAULT: Self = Self {
        index: 0,
        generation: 0,
    };

    pub fn is_default(&self) -> bool {
        *self == Self::DEFAULT
    }
}

/// Hook run on a group's mix buffer before it is summed into the output.
pub type GroupCallback = Arc<dyn Fn(&Group, &mut [f32], AudioSpec) + Send + Sync>;

#[derive(Default)]
pub(crate) struct GroupEntry {
    pub members: Vec<Arc<TrackShared>>,
    pub postmix: Option<GroupCallback>,
}

struct GroupSlot {
    generation: u32,
    entry: Option<GroupEntry>,
}

/// Group storage owned by a mixer. Slot 0 is the default group.
pub(crate) struct GroupArena {
    slots: Vec<GroupSlot>,
    free: Vec<u32>,
}

impl GroupArena {
    pub fn new() -> Self {
        Self {
            slots: vec![GroupSlot {
                generation: 0,
                entry: Some(GroupEntry::default()),
            }],
            free: Vec::new(),
        }
    }

    pub fn insert(&mut self) -> GroupId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.entry = Some(GroupEntry::default());
            return GroupId {
                index,
                generation: slot.generation,
            };
        }
        self.slots.push(GroupSlot {
            generation: 0,
            entry: Some(GroupEntry::default()),
        });
        GroupId {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    pub fn remove(&mut self, id: GroupId) -> Option<GroupEntry> {
        if id.is_default() {
            return None;
        }
        let entry = self.slot_mut(id)?.entry.take()?;
        self.free.push(id.index);
        Some(entry)
    }

    fn slot_mut(&mut self, id: GroupId) -> Option<&mut GroupSlot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
    }

    pub fn get(&self, id: GroupId) -> Option<&GroupEntry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_mut(&mut self, id: GroupId) -> Option<&mut GroupEntry> {
        self.slot_mut(id).and_then(|slot| slot.entry.as_mut())
    }

    pub fn default_group(&mut self) -> &mut GroupEntry {
        // Slot 0 is never removed
        self.slots[0].entry.get_or_insert_with(GroupEntry::default)
    }

    /// Live groups in mix order, the default group first.
    pub fn iter(&self) -> impl Iterator<Item = (GroupId, &GroupEntry)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.entry.as_ref().map(|entry| {
                (
                    GroupId {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    entry,
                )
            })
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.entry.is_some()).count()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.entry = None;
        }
        self.free.clear();
    }
}

/// Handle to a group of tracks within one mixer.
#[derive(Clone)]
pub struct Group {
    mixer: Weak<MixerShared>,
    id: GroupId,
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group").field("id", &self.id).finish()
    }
}

impl PartialEq for Group {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.mixer, &other.mixer)
    }
}

impl Group {
    pub(crate) fn new(mixer: &Mixer, id: GroupId) -> Self {
        Self {
            mixer: mixer.downgrade(),
            id,
        }
    }

    pub(crate) fn from_weak(mixer: Weak<MixerShared>, id: GroupId) -> Self {
        Self { mixer, id }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn is_default(&self) -> bool {
        self.id.is_default()
    }

    pub fn mixer(&self) -> Result<Mixer> {
        self.mixer
            .upgrade()
            .map(Mixer::from_shared)
            .ok_or(PetalMixError::Destroyed("Mixer"))
    }

    pub(crate) fn belongs_to(&self, mixer: &Arc<MixerShared>) -> bool {
        std::ptr::eq(self.mixer.as_ptr(), Arc::as_ptr(mixer))
    }

    /// Sets the callback that sees this group's mixed audio, always the full
    /// requested window.
    pub fn set_postmix_callback<F>(&self, callback: Option<F>) -> Result<()>
    where
        F: Fn(&Group, &mut [f32], AudioSpec) + Send + Sync + 'static,
    {
        let callback = callback.map(|f| Arc::new(f) as GroupCallback);
        self.mixer()?.with_group(self.id, |entry| entry.postmix = callback)
    }

    pub fn tracks(&self) -> Result<Vec<Track>> {
        self.mixer()?.with_group(self.id, |entry| {
            entry
                .members
                .iter()
                .cloned()
                .map(Track::from_shared)
                .collect()
        })
    }

    /// Destroys the group; its tracks move to the default group. The
    /// default group can't be destroyed.
    pub fn destroy(&self) -> Result<()> {
        if self.is_default() {
            return Err(PetalMixError::misuse("Can't destroy the default group"));
        }
        self.mixer()?.destroy_group(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_reuses_slots_with_new_generation() {
        let mut arena = GroupArena::new();
        let a = arena.insert();
        assert_eq!(arena.len(), 2);
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());

        let b = arena.insert();
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn test_default_group_is_permanent() {
        let mut arena = GroupArena::new();
        assert!(arena.remove(GroupId::DEFAULT).is_none());
        let ids: Vec<_> = arena.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![GroupId::DEFAULT]);
    }
}
