//! The collector loop.
//!
//! One collector instance runs on a dedicated thread and never stops the
//! world. Each cycle:
//!
//! 1. **Transition** — flip the allocation color to black, publish it,
//!    and handshake every mutator, taking ownership of their infant
//!    lists. Afterward every object the collector does not own was
//!    allocated black.
//! 2. **Mark** — repeatedly partition the owned object list by color
//!    (gray objects are scanned and blackened), interleaved with
//!    handshakes that absorb each mutator's dirty flag, until a full
//!    round leaves everything clean. All remaining white objects are
//!    strong-unreachable.
//! 3. **Sweep** — reclaim white objects. Weak leaves race white-to-red
//!    instead; winners are unlinked from their weak container and parked
//!    on the red list.
//! 4. **Flip** — reinterpret black as white by flipping the epoch bit,
//!    publish the new epoch over every channel, then reclaim the red
//!    list: the eviction happened a full handshake ago, so no mutator
//!    can still observe those objects.
//!
//! The collector participates in its own protocol: it enters the domain
//! as a mutator (its sweep-time intern-set edits allocate trie nodes,
//! which ride its own infant list) and handshakes itself at every round.

use crate::channel::{global, Channel};
use crate::config::config;
use crate::deque::Deque;
use crate::mutator;
use crate::object::{ObjRef, ScanContext};
use crate::Color;
use std::sync::{Arc, OnceLock};

/// The singleton collector. Construct with [`Collector::new`] on the
/// collector thread (after [`crate::enter`]), then either call
/// [`Collector::cycle`] in a loop or hand control to
/// [`Collector::run`]. Most embeddings just call [`spawn`].
pub struct Collector {
    /// Objects owned by the collector this cycle: the candidate set.
    objects: Deque<ObjRef>,
    /// Objects observed black (or blackened) this cycle.
    blacklist: Deque<ObjRef>,
    /// White candidates accumulated during a mark pass.
    whitelist: Deque<ObjRef>,
    /// Condemned weak leaves awaiting next-cycle reclamation.
    redlist: Deque<ObjRef>,
    /// Channels of admitted mutators.
    mutators: Vec<Arc<Channel>>,
    /// Gray worklist and epoch context for scanning.
    working: ScanContext,
}

impl Collector {
    /// Create the collector. The calling thread must already have
    /// entered the domain.
    pub fn new() -> Collector {
        Collector {
            objects: Deque::new(),
            blacklist: Deque::new(),
            whitelist: Deque::new(),
            redlist: Deque::new(),
            mutators: Vec::new(),
            working: ScanContext::new(mutator::local_white()),
        }
    }

    /// Drain the global entrants list into the working set of channels.
    fn accept_entrants(&mut self) {
        let mut gs = global().state.lock();
        self.mutators.append(&mut gs.entrants);
    }

    /// Run one full collection cycle.
    pub fn cycle(&mut self) {
        let white = mutator::local_white();
        let black = white.flip();
        tracing::debug!(epoch = white.0, "cycle: transition to allocating black");

        // --- Transition to allocating black -----------------------------
        mutator::set_local_alloc(black);
        self.working.set_white(white);
        {
            let mut gs = global().state.lock();
            gs.white = white;
            gs.alloc = black;
        }

        self.accept_entrants();

        // Request a handshake and infant handover from every mutator.
        let mut acked: Vec<Arc<Channel>> = Vec::with_capacity(self.mutators.len());
        while let Some(channel) = self.mutators.pop() {
            let mut abandoned = false;
            {
                let mut st = channel.state.lock();
                debug_assert!(!st.pending, "handshake fumbled");
                if !st.abandoned {
                    st.pending = true;
                    st.request_infants = true;
                } else {
                    abandoned = true;
                    if st.dirty {
                        mutator::set_local_dirty(true);
                        st.dirty = false;
                    }
                    self.objects.append(&mut st.infants);
                }
                st.alloc = black;
            }
            if !abandoned {
                acked.push(channel);
            }
        }

        // Shade the global roots.
        {
            let gs = global().state.lock();
            for &root in gs.roots.iter() {
                mutator::shade(root);
            }
            tracing::trace!(count = gs.roots.len(), "shaded global roots");
        }

        // Handshake ourselves: adopt the new allocation color and hand
        // our own infants over to ourselves.
        mutator::handshake();

        // Receive acknowledgements and recent allocations.
        while let Some(channel) = acked.pop() {
            let mut abandoned = false;
            {
                let mut st = channel.state.lock();
                while !st.abandoned && st.pending {
                    channel.condvar.wait(&mut st);
                }
                if st.abandoned {
                    abandoned = true;
                }
                // Anything shaded before this point concerned the prior
                // epoch's population, which is fully in our hands now.
                st.dirty = false;
                self.objects.append(&mut st.infants);
            }
            if !abandoned {
                self.mutators.push(channel);
            }
        }

        // Every mutator now allocates black; the pre-existing population
        // is entirely in `objects`.

        // --- Marking fixed point ----------------------------------------
        debug_assert!(self.blacklist.is_empty());
        debug_assert!(self.whitelist.is_empty());

        loop {
            // Scan passes until the collector itself stops finding work.
            loop {
                mutator::set_local_dirty(false);
                let mut blacks = 0usize;
                let mut grays = 0usize;
                let mut whites = 0usize;
                while let Some(obj) = self.objects.pop_front() {
                    let header = obj.header();
                    match header.transition(Color::GRAY, black) {
                        Ok(()) => {
                            grays += 1;
                            unsafe { (header.vtable().trace)(obj, &mut self.working) };
                            self.working.process();
                            self.blacklist.push_back(obj);
                        }
                        Err(seen) if seen == black => {
                            blacks += 1;
                            self.blacklist.push_back(obj);
                        }
                        Err(seen) if seen == white => {
                            whites += 1;
                            self.whitelist.push_back(obj);
                        }
                        Err(seen) => {
                            unreachable!(
                                "mark: object {:?} has impossible color {:?}",
                                obj, seen
                            )
                        }
                    }
                }
                tracing::trace!(blacks, grays, whites, "mark pass");
                std::mem::swap(&mut self.objects, &mut self.whitelist);
                if !mutator::local_dirty() {
                    break;
                }
            }

            // The collector has traced everything it knows about. Ask the
            // mutators whether their root shading created fresh gray work.
            self.accept_entrants();
            let mut acked: Vec<Arc<Channel>> = Vec::with_capacity(self.mutators.len());
            while let Some(channel) = self.mutators.pop() {
                let mut abandoned = false;
                {
                    let mut st = channel.state.lock();
                    debug_assert!(!st.pending, "handshake fumbled");
                    if !st.abandoned {
                        st.pending = true;
                    } else {
                        abandoned = true;
                        if st.dirty {
                            mutator::set_local_dirty(true);
                            st.dirty = false;
                        }
                        // Orphaned infants were allocated after the
                        // transition, hence black.
                        self.objects.append(&mut st.infants);
                    }
                }
                if !abandoned {
                    acked.push(channel);
                }
            }
            mutator::handshake();
            while let Some(channel) = acked.pop() {
                let mut abandoned = false;
                {
                    let mut st = channel.state.lock();
                    while !st.abandoned && st.pending {
                        channel.condvar.wait(&mut st);
                    }
                    if st.abandoned {
                        abandoned = true;
                        self.objects.append(&mut st.infants);
                    }
                    if st.dirty {
                        mutator::set_local_dirty(true);
                        st.dirty = false;
                    }
                }
                if !abandoned {
                    self.mutators.push(channel);
                }
            }

            if !mutator::local_dirty() {
                break;
            }
            mutator::set_local_dirty(false);
        }

        // Nothing was shaded gray since the last round: all remaining
        // white objects are strong-unreachable.

        // --- Sweep ------------------------------------------------------
        let mut freed = 0usize;
        let mut kept = 0usize;
        let mut condemned = 0usize;
        while let Some(obj) = self.objects.pop_front() {
            let after = sweep(obj, white);
            if after == white {
                freed += 1;
            } else if after == black {
                kept += 1;
                self.blacklist.push_back(obj);
            } else if after == Color::RED {
                condemned += 1;
                self.redlist.push_back(obj);
            } else {
                unreachable!("sweep: object {:?} returned color {:?}", obj, after);
            }
        }
        tracing::debug!(freed, kept, condemned, "sweep complete");

        // Only black and red objects exist; mutators allocate black and
        // the write barrier meets no white objects.

        // --- Epoch flip -------------------------------------------------
        let new_white = black;
        mutator::set_local_white(new_white);
        self.working.set_white(new_white);
        {
            let mut gs = global().state.lock();
            gs.white = new_white;
        }

        self.accept_entrants();
        let mut acked: Vec<Arc<Channel>> = Vec::with_capacity(self.mutators.len());
        while let Some(channel) = self.mutators.pop() {
            let mut abandoned = false;
            {
                let mut st = channel.state.lock();
                debug_assert!(!st.pending, "handshake fumbled");
                if !st.abandoned {
                    st.pending = true;
                    debug_assert!(st.infants.is_empty());
                } else {
                    abandoned = true;
                    if st.dirty {
                        mutator::set_local_dirty(true);
                        st.dirty = false;
                    }
                    // These orphans carry the one color value that just
                    // changed meaning from black to white; the write
                    // barrier may already have re-shaded some of them.
                    self.objects.append(&mut st.infants);
                }
                st.white = new_white;
                // The allocation color keeps the bit black had; under the
                // new epoch that same bit reads as white.
                st.alloc = new_white;
            }
            if !abandoned {
                acked.push(channel);
            }
        }
        mutator::handshake();
        while let Some(channel) = acked.pop() {
            let mut abandoned = false;
            {
                let mut st = channel.state.lock();
                while !st.abandoned && st.pending {
                    channel.condvar.wait(&mut st);
                }
                if st.abandoned {
                    abandoned = true;
                    self.objects.append(&mut st.infants);
                }
                if st.dirty {
                    mutator::set_local_dirty(true);
                    st.dirty = false;
                }
            }
            if !abandoned {
                self.mutators.push(channel);
            }
        }

        // Claim the red objects: their eviction happened before the
        // handshake that just completed, so no mutator still holds one.
        let mut red_freed = 0usize;
        while let Some(obj) = self.redlist.pop_front() {
            free(obj);
            red_freed += 1;
        }
        if red_freed > 0 {
            tracing::debug!(red_freed, "reclaimed red list");
        }

        // The survivors — formerly black, now white — seed the next
        // cycle's candidate set.
        self.objects.append(&mut self.blacklist);

        global().stats.record_cycle();
    }

    /// Run cycles forever, resting briefly after cycles that reclaim
    /// nothing.
    pub fn run(&mut self) -> ! {
        loop {
            let before = global().stats.objects_freed.load(std::sync::atomic::Ordering::Relaxed);
            self.cycle();
            let after = global().stats.objects_freed.load(std::sync::atomic::Ordering::Relaxed);
            if after == before {
                std::thread::sleep(config().idle_pause);
            }
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Collector::new()
    }
}

/// Sweep one object, returning its post-sweep color.
///
/// Ordinary objects: white means unreachable, reclaim now. Weak leaves:
/// race white-to-red (first encounter, evict from the weak container) or
/// observe red (second encounter, reclaim now); a mutator that won the
/// upgrade race leaves the leaf black.
fn sweep(obj: ObjRef, white: Color) -> Color {
    let header = obj.header();
    let vtable = header.vtable();
    if vtable.weak {
        match header.transition(white, Color::RED) {
            Ok(()) => {
                unsafe { (vtable.evict)(obj) };
                Color::RED
            }
            Err(seen) if seen == Color::RED => {
                free(obj);
                white
            }
            Err(seen) => {
                debug_assert_eq!(seen, white.flip());
                seen
            }
        }
    } else {
        let color = header.color();
        if color == white {
            free(obj);
        }
        color
    }
}

/// Reclaim one object.
fn free(obj: ObjRef) {
    let vtable = obj.header().vtable();
    let bytes = unsafe { (vtable.size_of)(obj) };
    unsafe { (vtable.drop)(obj) };
    global().stats.record_free(bytes);
}

static STARTED: OnceLock<()> = OnceLock::new();

/// Spawn the dedicated collector thread. Idempotent: later calls are
/// no-ops, matching the one-collector model.
pub fn spawn() {
    STARTED.get_or_init(|| {
        std::thread::Builder::new()
            .name("qet-gc".into())
            .spawn(|| {
                mutator::enter();
                let mut collector = Collector::new();
                collector.run();
            })
            .expect("failed to spawn the collector thread");
    });
}
