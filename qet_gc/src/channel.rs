//! Handshake channels and the global collector record.
//!
//! One channel exists per live mutator. All of a channel's fields live
//! under its mutex; the condition variable signals both directions
//! (collector waits for `pending` to clear, mutators are only ever
//! notified implicitly by running their own handshakes).
//!
//! The global record owns the published epoch colors, the list of
//! channels awaiting admission by the collector, and the global roots.

use crate::deque::Deque;
use crate::object::ObjRef;
use crate::stats::GcStats;
use crate::Color;
use parking_lot::{Condvar, Mutex};
use std::sync::{Arc, OnceLock};

/// Per-mutator channel state, all under the channel mutex.
pub(crate) struct ChannelState {
    /// Collector requests acknowledgement; mutator clears.
    pub pending: bool,
    /// Collector wants the mutator's infants handed over.
    pub request_infants: bool,
    /// Mutator shaded something white-to-gray since its last handshake.
    pub dirty: bool,
    /// Mutator has left; collector must drain and dispose.
    pub abandoned: bool,
    /// Published epoch white.
    pub white: Color,
    /// Published allocation color.
    pub alloc: Color,
    /// Handover list of freshly allocated objects.
    pub infants: Deque<ObjRef>,
}

/// A bidirectional handshake channel between one mutator and the
/// collector.
pub(crate) struct Channel {
    pub state: Mutex<ChannelState>,
    pub condvar: Condvar,
}

impl Channel {
    pub(crate) fn new(white: Color, alloc: Color) -> Arc<Channel> {
        Arc::new(Channel {
            state: Mutex::new(ChannelState {
                pending: false,
                request_infants: false,
                dirty: false,
                abandoned: false,
                white,
                alloc,
                infants: Deque::new(),
            }),
            condvar: Condvar::new(),
        })
    }
}

/// State shared by all mutators and the collector, under one mutex.
pub(crate) struct GlobalState {
    /// Current epoch white.
    pub white: Color,
    /// Current allocation color.
    pub alloc: Color,
    /// Channels published by entering mutators, awaiting admission.
    pub entrants: Vec<Arc<Channel>>,
    /// Objects that are always live from the collector's point of view.
    pub roots: Vec<ObjRef>,
    /// The intern set, once created (also present in `roots`).
    pub strings: Option<ObjRef>,
}

/// The collector's global record: a lazily-initialized singleton.
pub(crate) struct Global {
    pub state: Mutex<GlobalState>,
    pub condvar: Condvar,
    pub stats: GcStats,
}

static GLOBAL: OnceLock<Global> = OnceLock::new();

pub(crate) fn global() -> &'static Global {
    GLOBAL.get_or_init(|| Global {
        state: Mutex::new(GlobalState {
            white: Color::EPOCH0,
            alloc: Color::EPOCH0,
            entrants: Vec::new(),
            roots: Vec::new(),
            strings: None,
        }),
        condvar: Condvar::new(),
        stats: GcStats::new(),
    })
}

/// Collector-wide statistics.
pub fn stats() -> &'static GcStats {
    &global().stats
}

/// Register an object as permanently live.
///
/// Global roots are shaded at the start of every cycle and never
/// reclaimed. Must be called from an entered mutator.
pub fn add_global_root(obj: ObjRef) {
    crate::mutator::shade(obj);
    global().state.lock().roots.push(obj);
}
