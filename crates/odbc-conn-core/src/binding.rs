//! The outer connection's binding word.
//!
//! An outer connection refers to its inner connection through a
//! generation-tagged [`SessionHandle`] into the factory's session table. The
//! whole binding (unbound, binding, bound to a handle, unbinding) is packed
//! into one `AtomicU64`, so every transition is a single compare-and-set and
//! a stale handle can never resolve to a session bound after it.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Notify;

/// Index/generation pair naming one binding episode in the session table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
   pub(crate) index: u32,
   pub(crate) generation: u32,
}

impl SessionHandle {
   pub fn index(&self) -> u32 {
      self.index
   }

   pub fn generation(&self) -> u32 {
      self.generation
   }
}

/// Where an outer connection is in the bind/unbind protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
   Unbound,
   /// An Open has claimed the connection and is obtaining an inner connection
   Binding,
   Bound(SessionHandle),
   /// A Close has claimed the connection and is returning its inner connection
   Unbinding,
}

// Generations start at 1, so no real handle encodes to 0. Index u32::MAX is
// never allocated, so the two top values are free for the transient states.
const UNBOUND: u64 = 0;
const BINDING: u64 = u64::MAX;
const UNBINDING: u64 = u64::MAX - 1;

impl Binding {
   fn encode(self) -> u64 {
      match self {
         Binding::Unbound => UNBOUND,
         Binding::Binding => BINDING,
         Binding::Unbinding => UNBINDING,
         Binding::Bound(handle) => (u64::from(handle.index) << 32) | u64::from(handle.generation),
      }
   }

   fn decode(word: u64) -> Self {
      match word {
         UNBOUND => Binding::Unbound,
         BINDING => Binding::Binding,
         UNBINDING => Binding::Unbinding,
         word => Binding::Bound(SessionHandle {
            index: (word >> 32) as u32,
            generation: word as u32,
         }),
      }
   }

   pub fn handle(&self) -> Option<SessionHandle> {
      match self {
         Binding::Bound(handle) => Some(*handle),
         _ => None,
      }
   }
}

/// Atomic slot holding an outer connection's current [`Binding`]
#[derive(Debug, Default)]
pub struct BindingSlot {
   word: AtomicU64,
   unbound: Notify,
}

impl BindingSlot {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn load(&self) -> Binding {
      Binding::decode(self.word.load(Ordering::Acquire))
   }

   /// Replace `from` with `to` only if the slot still holds `from`.
   ///
   /// Returns false and leaves the slot untouched otherwise.
   pub fn compare_and_set(&self, from: Binding, to: Binding) -> bool {
      let swapped = self
         .word
         .compare_exchange(from.encode(), to.encode(), Ordering::AcqRel, Ordering::Acquire)
         .is_ok();

      if swapped && from == Binding::Unbinding {
         self.unbound.notify_waiters();
      }
      swapped
   }

   /// Wait for an in-flight unbind to finish. Returns at once if none is running.
   pub async fn unbinding_finished(&self) {
      loop {
         let notified = self.unbound.notified();
         let mut notified = std::pin::pin!(notified);
         notified.as_mut().enable();

         if self.load() != Binding::Unbinding {
            return;
         }
         notified.await;
      }
   }
}
