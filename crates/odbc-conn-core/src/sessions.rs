//! Arena of bound sessions addressed by generation-tagged handles

use parking_lot::Mutex;

use crate::Result;
use crate::binding::SessionHandle;
use crate::error::Error;

struct Slot<T> {
   generation: u32,
   value: Option<T>,
}

struct Arena<T> {
   slots: Vec<Slot<T>>,
   free: Vec<u32>,
}

/// Session table shared by all outer connections of a factory.
///
/// Every bind inserts a fresh entry and every unbind removes it, bumping the
/// slot's generation. A handle from an earlier binding therefore never
/// resolves to a later occupant of the same slot.
pub struct SessionTable<T> {
   arena: Mutex<Arena<T>>,
}

impl<T: Clone> SessionTable<T> {
   pub fn new() -> Self {
      Self {
         arena: Mutex::new(Arena {
            slots: Vec::new(),
            free: Vec::new(),
         }),
      }
   }

   /// Store `value` under a fresh handle.
   ///
   /// # Errors
   ///
   /// Returns `Error::ConnectionCreation` if every index is in use.
   pub fn insert(&self, value: T) -> Result<SessionHandle> {
      let mut arena = self.arena.lock();

      if let Some(index) = arena.free.pop() {
         let slot = &mut arena.slots[index as usize];
         slot.value = Some(value);
         return Ok(SessionHandle {
            index,
            generation: slot.generation,
         });
      }

      // Index u32::MAX stays free for the transient binding encodings
      let index = match u32::try_from(arena.slots.len()) {
         Ok(index) if index < u32::MAX => index,
         _ => return Err(Error::creation("session table is full")),
      };
      arena.slots.push(Slot {
         generation: 1,
         value: Some(value),
      });
      Ok(SessionHandle {
         index,
         generation: 1,
      })
   }

   pub fn get(&self, handle: SessionHandle) -> Option<T> {
      let arena = self.arena.lock();
      arena
         .slots
         .get(handle.index as usize)
         .filter(|slot| slot.generation == handle.generation)
         .and_then(|slot| slot.value.clone())
   }

   /// Remove the entry for `handle`, invalidating the handle.
   ///
   /// Returns `None` if the handle is stale.
   pub fn remove(&self, handle: SessionHandle) -> Option<T> {
      let mut arena = self.arena.lock();
      let slot = arena.slots.get_mut(handle.index as usize)?;
      if slot.generation != handle.generation {
         return None;
      }

      let value = slot.value.take()?;
      // Generation 0 is reserved for the unbound encoding
      slot.generation = slot.generation.checked_add(1).unwrap_or(1);
      arena.free.push(handle.index);
      Some(value)
   }

   /// Number of live entries
   pub fn len(&self) -> usize {
      let arena = self.arena.lock();
      arena.slots.len() - arena.free.len()
   }

   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

impl<T: Clone> Default for SessionTable<T> {
   fn default() -> Self {
      Self::new()
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_stale_handle_does_not_resolve_after_reuse() {
      let table = SessionTable::new();

      let first = table.insert("a").unwrap();
      assert_eq!(table.remove(first), Some("a"));

      let second = table.insert("b").unwrap();
      assert_eq!(second.index(), first.index());
      assert_ne!(second.generation(), first.generation());

      assert_eq!(table.get(first), None);
      assert_eq!(table.remove(first), None);
      assert_eq!(table.get(second), Some("b"));
   }

   #[test]
   fn test_len_tracks_live_entries() {
      let table = SessionTable::new();
      let a = table.insert(1).unwrap();
      let _b = table.insert(2).unwrap();
      assert_eq!(table.len(), 2);

      table.remove(a);
      assert_eq!(table.len(), 1);
      assert!(!table.is_empty());
   }
}
