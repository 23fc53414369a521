//! qet garbage collector.
//!
//! A concurrent tri-color mark-sweep collector for the qet runtime. One
//! dedicated collector thread coordinates with any number of mutator
//! threads through per-mutator handshake channels; the world is never
//! stopped.
//!
//! # Architecture
//!
//! Each cycle alternates four phases:
//!
//! - **Transition**: the collector flips the allocation color to black and
//!   handshakes every mutator, taking ownership of their infant lists.
//! - **Mark**: the collector repeatedly partitions its object list by
//!   color, scanning gray objects, until no mutator reports having shaded
//!   anything since the last handshake.
//! - **Sweep**: remaining white objects are reclaimed. Weak leaves
//!   (interned strings) race white-to-red instead and are unlinked from
//!   the intern set; their memory is reclaimed one cycle later.
//! - **Flip**: the meaning of the color bit is exchanged (black becomes
//!   white) and the new epoch is published to every channel.
//!
//! # Colors
//!
//! Every managed object carries one atomic color byte:
//!
//! - `WHITE`: not yet reached, candidate for reclamation
//! - `BLACK`: reached; children scanned or scheduled
//! - `GRAY`: reached, children not yet scanned
//! - `RED`: weak-reachable only, scheduled for deletion
//!
//! White and black exchange meaning each epoch (`BLACK == WHITE ^ 1`);
//! gray and red are fixed sentinels.
//!
//! # Usage
//!
//! ```ignore
//! use qet_gc as gc;
//!
//! gc::collector::spawn();           // dedicated collector thread
//! gc::enter();                      // this thread becomes a mutator
//! let s = gc::intern(b"hello");     // canonical interned string
//! gc::handshake();                  // periodic safepoint
//! gc::leave();
//! ```
//!
//! # Safety
//!
//! The collector requires that:
//! - all allocation happens between `enter()` and `leave()`,
//! - mutators call `handshake()` often enough for phases to complete,
//! - every pointer store into a managed object goes through the barrier
//!   types ([`StrongRef`], [`ValueCell`]) or is followed by a `shade`.

pub mod channel;
pub mod collector;
pub mod config;
pub mod deque;
pub mod intern;
pub mod mutator;
pub mod object;
pub mod ptr;
pub mod queue;
pub mod stack;
pub mod stats;

pub use channel::{add_global_root, stats};
pub use collector::Collector;
pub use config::{config, configure, GcConfig};
pub use deque::Deque;
pub use intern::{intern, Ctrie, SNode};
pub use mutator::{
    alloc, enter, handshake, leave, pop_root, push_root, roots_len, shade, shade_value,
    truncate_roots,
};
pub use object::{Gc, ObjRef, ScanContext, Trace};
pub use ptr::{StrongRef, ValueCell};
pub use queue::MsQueue;
pub use stack::TreiberStack;
pub use stats::GcStats;

/// A tri-color (plus red) mark state.
///
/// White and black are epoch-relative: bit 0 names one of the two, and
/// the assignment swaps once per collection cycle. Gray and red are
/// absolute. Because black is always `white ^ 1`, an epoch flip recolors
/// every surviving object without touching it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Color(pub(crate) u8);

impl Color {
    /// Reached but children not yet scanned.
    pub const GRAY: Color = Color(2);
    /// Weak-reachable only; scheduled for deletion.
    pub const RED: Color = Color(3);
    /// The white of the first epoch.
    pub(crate) const EPOCH0: Color = Color(0);

    /// The opposite epoch color: black for this white, white for this
    /// black. Meaningless for gray and red.
    #[inline]
    pub fn flip(self) -> Color {
        Color(self.0 ^ 1)
    }

    /// Human-readable name relative to the given epoch white.
    pub fn describe(self, white: Color) -> &'static str {
        if self == white {
            "WHITE"
        } else if self == white.flip() {
            "BLACK"
        } else if self == Color::GRAY {
            "GRAY"
        } else {
            "RED"
        }
    }
}

/// Tag value identifying interned strings in client dispatch.
///
/// Tags 16 and up are free for the embedding runtime.
pub const TAG_STRING: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_flip() {
        assert_eq!(Color(0).flip(), Color(1));
        assert_eq!(Color(1).flip(), Color(0));
        assert_eq!(Color(0).flip().flip(), Color(0));
    }

    #[test]
    fn test_color_describe() {
        let white = Color(0);
        assert_eq!(white.describe(white), "WHITE");
        assert_eq!(white.flip().describe(white), "BLACK");
        assert_eq!(Color::GRAY.describe(white), "GRAY");
        assert_eq!(Color::RED.describe(white), "RED");
    }
}
