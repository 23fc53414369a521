//! Weak interning of byte-strings over a concurrent hash-array-mapped
//! trie.
//!
//! The intern set maps a `(hash, bytes)` query to a unique [`SNode`];
//! equivalent strings are pointer-equal. It is a Prokopec-style Ctrie
//! (Prokopec, Bronson, Bagwell, Odersky, *Concurrent Tries with
//! Efficient Non-Blocking Snapshots*, 2012): every structural mutation
//! is a CAS on some INode's main pointer, consuming 6 hash bits per
//! level.
//!
//! Weak semantics are realized jointly with the collector: an `SNode` is
//! a weak leaf, so trie membership alone does not keep it alive. During
//! sweep the collector races mutators for each unreached string —
//! mutators upgrade white to black through [`Ctrie::emplace`], the
//! collector condemns white to red. A red node is removed from the trie
//! by [`SNode::evict`] and reclaimed one epoch later; lookups treat red
//! nodes as absent and install a fresh replacement beside them. No one
//! upgrades red back to black.

use crate::channel::global;
use crate::mutator::{alloc, local_white, shade, shade_weak};
use crate::object::{Gc, GcBox, ObjRef, ScanContext, Trace};
use crate::{Color, TAG_STRING};
use rustc_hash::FxHasher;
use std::hash::Hasher;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A byte-string lookup key: the bytes and their 64-bit hash.
pub struct Query<'a> {
    bytes: &'a [u8],
    hash: u64,
}

impl<'a> Query<'a> {
    /// Build a query, hashing the bytes.
    pub fn new(bytes: &'a [u8]) -> Query<'a> {
        let mut hasher = FxHasher::default();
        hasher.write(bytes);
        Query {
            bytes,
            hash: hasher.finish(),
        }
    }
}

// =============================================================================
// SNode — interned string leaf
// =============================================================================

/// An interned, immutable byte-string: the canonical representative of
/// its contents. The sole weak leaf in the system.
pub struct SNode {
    hash: u64,
    bytes: Box<[u8]>,
}

impl SNode {
    fn from_query(q: &Query) -> SNode {
        SNode {
            hash: q.hash,
            bytes: q.bytes.into(),
        }
    }

    /// The string's 64-bit content hash.
    #[inline]
    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// The string contents.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

unsafe impl Trace for SNode {
    fn trace(&self, _cx: &mut ScanContext) {}

    fn size_of(&self) -> usize {
        std::mem::size_of::<GcBox<SNode>>() + self.bytes.len()
    }

    fn evict(this: Gc<SNode>) {
        // The sweep race condemned this string; unlink it so no future
        // lookup returns it. Reclamation happens next epoch.
        strings().remove(this);
        global()
            .stats
            .strings_evicted
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    const LEAF: bool = true;
    const WEAK: bool = true;
    const TAG: u8 = TAG_STRING;
}

impl std::fmt::Display for SNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

impl std::fmt::Debug for SNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SNode({:x}, {:?})", self.hash, String::from_utf8_lossy(&self.bytes))
    }
}

fn new_snode(q: &Query) -> Gc<SNode> {
    global()
        .stats
        .strings_interned
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    alloc(SNode::from_query(q))
}

// =============================================================================
// Trie nodes
// =============================================================================

/// Indirection node: the only mutable cell in the trie.
pub struct INode {
    main: AtomicMain,
}

impl INode {
    fn new(main: Main) -> INode {
        INode {
            main: AtomicMain::new(main),
        }
    }
}

unsafe impl Trace for INode {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.main.load().erased());
    }
}

/// Bitmap-indexed branch array. Immutable once installed.
pub struct CNode {
    bmp: u64,
    branches: Box<[Branch]>,
}

unsafe impl Trace for CNode {
    fn trace(&self, cx: &mut ScanContext) {
        // Branches are scanned weakly: string leaves owe their liveness
        // to strong references elsewhere, never to the intern set.
        for &b in self.branches.iter() {
            cx.push_weak(b.erased());
        }
    }

    fn size_of(&self) -> usize {
        std::mem::size_of::<GcBox<CNode>>()
            + self.branches.len() * std::mem::size_of::<Branch>()
    }
}

/// Tomb node: wraps the lone survivor of a contracted CNode until the
/// next operation splices it into the parent.
pub struct TNode {
    sn: Gc<SNode>,
}

unsafe impl Trace for TNode {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.sn.erase());
    }
}

/// Collision-list node for strings sharing a full 64-bit hash.
pub struct LNode {
    sn: Gc<SNode>,
    next: Option<Gc<LNode>>,
}

unsafe impl Trace for LNode {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.sn.erase());
        if let Some(next) = self.next {
            cx.push(next.erase());
        }
    }
}

/// A CNode slot: either a sub-trie or a single string.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Branch {
    I(Gc<INode>),
    S(Gc<SNode>),
}

impl Branch {
    #[inline]
    fn erased(self) -> ObjRef {
        match self {
            Branch::I(n) => n.erase(),
            Branch::S(n) => n.erase(),
        }
    }
}

/// An INode's main pointer target.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Main {
    C(Gc<CNode>),
    L(Gc<LNode>),
    T(Gc<TNode>),
}

impl Main {
    #[inline]
    fn erased(self) -> ObjRef {
        match self {
            Main::C(n) => n.erase(),
            Main::L(n) => n.erase(),
            Main::T(n) => n.erase(),
        }
    }

    #[inline]
    fn encode(self) -> usize {
        match self {
            Main::C(n) => n.erase().as_ptr() as usize,
            Main::L(n) => n.erase().as_ptr() as usize | 1,
            Main::T(n) => n.erase().as_ptr() as usize | 2,
        }
    }

    /// Decode a tagged pointer previously produced by `encode`.
    #[inline]
    unsafe fn decode(bits: usize) -> Main {
        let obj = ObjRef(unsafe {
            NonNull::new_unchecked((bits & !3) as *mut crate::object::Header)
        });
        match bits & 3 {
            0 => Main::C(unsafe { obj.downcast_unchecked() }),
            1 => Main::L(unsafe { obj.downcast_unchecked() }),
            _ => Main::T(unsafe { obj.downcast_unchecked() }),
        }
    }
}

/// Atomic tagged pointer to a main node, with the strong-field barrier
/// applied on successful exchange.
struct AtomicMain(AtomicUsize);

impl AtomicMain {
    fn new(main: Main) -> AtomicMain {
        AtomicMain(AtomicUsize::new(main.encode()))
    }

    #[inline]
    fn load(&self) -> Main {
        unsafe { Main::decode(self.0.load(Ordering::Acquire)) }
    }

    /// CAS the main pointer; shades both the displaced and installed
    /// nodes on success.
    fn compare_exchange(&self, current: Main, new: Main) -> bool {
        if self
            .0
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            shade(current.erased());
            shade(new.erased());
            true
        } else {
            false
        }
    }
}

// =============================================================================
// CNode construction
// =============================================================================

#[inline]
fn flagpos(hash: u64, lev: u32, bmp: u64) -> (u64, usize) {
    let index = (hash >> lev) & 63;
    let flag = 1u64 << index;
    let pos = (bmp & (flag - 1)).count_ones() as usize;
    (flag, pos)
}

impl CNode {
    fn width(&self) -> usize {
        self.bmp.count_ones() as usize
    }

    /// Copy with `branch` inserted at `pos` under `flag`.
    fn inserted(&self, flag: u64, pos: usize, branch: Branch) -> Gc<CNode> {
        debug_assert_eq!(self.bmp & flag, 0);
        let mut branches = Vec::with_capacity(self.branches.len() + 1);
        branches.extend_from_slice(&self.branches[..pos]);
        branches.push(branch);
        branches.extend_from_slice(&self.branches[pos..]);
        for &b in branches.iter() {
            shade_weak(b.erased());
        }
        alloc(CNode {
            bmp: self.bmp | flag,
            branches: branches.into_boxed_slice(),
        })
    }

    /// Copy with the branch at `pos` replaced.
    fn updated(&self, pos: usize, branch: Branch) -> Gc<CNode> {
        let mut branches = self.branches.to_vec();
        branches[pos] = branch;
        for &b in branches.iter() {
            shade_weak(b.erased());
        }
        alloc(CNode {
            bmp: self.bmp,
            branches: branches.into_boxed_slice(),
        })
    }

    /// Copy with the branch at `pos` under `flag` removed.
    fn removed(&self, pos: usize, flag: u64) -> Gc<CNode> {
        debug_assert_ne!(self.bmp & flag, 0);
        let mut branches = Vec::with_capacity(self.branches.len() - 1);
        branches.extend_from_slice(&self.branches[..pos]);
        branches.extend_from_slice(&self.branches[pos + 1..]);
        for &b in branches.iter() {
            shade_weak(b.erased());
        }
        alloc(CNode {
            bmp: self.bmp ^ flag,
            branches: branches.into_boxed_slice(),
        })
    }

    /// Build the smallest sub-trie distinguishing two strings with
    /// distinct contents (but possibly colliding hash prefixes).
    fn pair(sn1: Gc<SNode>, sn2: Gc<SNode>, lev: u32) -> Gc<CNode> {
        debug_assert!(sn1.as_bytes() != sn2.as_bytes());
        let a1 = (sn1.hash() >> lev) & 63;
        let a2 = (sn2.hash() >> lev) & 63;
        let flag1 = 1u64 << a1;
        if a1 != a2 {
            let flag2 = 1u64 << a2;
            let (first, second) = if a1 < a2 { (sn1, sn2) } else { (sn2, sn1) };
            alloc(CNode {
                bmp: flag1 | flag2,
                branches: vec![Branch::S(first), Branch::S(second)].into_boxed_slice(),
            })
        } else if lev + 6 < 64 {
            // Same 6 bits at this level: descend.
            let sub = alloc(INode::new(Main::C(CNode::pair(sn1, sn2, lev + 6))));
            alloc(CNode {
                bmp: flag1,
                branches: vec![Branch::I(sub)].into_boxed_slice(),
            })
        } else {
            // Full 64-bit hash collision: collision list.
            let tail = alloc(LNode {
                sn: sn1,
                next: None,
            });
            let head = alloc(LNode {
                sn: sn2,
                next: Some(tail),
            });
            let sub = alloc(INode::new(Main::L(head)));
            alloc(CNode {
                bmp: flag1,
                branches: vec![Branch::I(sub)].into_boxed_slice(),
            })
        }
    }
}

// =============================================================================
// Prokopec helpers
// =============================================================================

fn entomb(sn: Gc<SNode>) -> Main {
    Main::T(alloc(TNode { sn }))
}

fn resurrect(branch: Branch) -> Branch {
    match branch {
        Branch::I(i) => match i.main.load() {
            Main::T(tn) => Branch::S(tn.sn),
            _ => branch,
        },
        Branch::S(_) => branch,
    }
}

fn to_contracted(cn: Gc<CNode>, lev: u32) -> Main {
    if lev == 0 || cn.width() > 1 {
        return Main::C(cn);
    }
    match cn.branches.first() {
        Some(&Branch::S(sn)) => entomb(sn),
        _ => Main::C(cn),
    }
}

fn to_compressed(cn: Gc<CNode>, lev: u32) -> Main {
    let branches: Vec<Branch> = cn.branches.iter().map(|&b| resurrect(b)).collect();
    for &b in branches.iter() {
        shade_weak(b.erased());
    }
    let ncn = alloc(CNode {
        bmp: cn.bmp,
        branches: branches.into_boxed_slice(),
    });
    to_contracted(ncn, lev)
}

fn clean(i: Gc<INode>, lev: u32) {
    if let Main::C(cn) = i.main.load() {
        let desired = to_compressed(cn, lev);
        let _ = i.main.compare_exchange(Main::C(cn), desired);
    }
}

fn clean_parent(p: Gc<INode>, i: Gc<INode>, hash: u64, lev: u32) {
    loop {
        let m = i.main.load();
        match p.main.load() {
            Main::C(cn) => {
                let (flag, pos) = flagpos(hash, lev, cn.bmp);
                if cn.bmp & flag == 0 {
                    return;
                }
                if cn.branches[pos] != Branch::I(i) {
                    return;
                }
                if let Main::T(tn) = m {
                    let ncn = cn.updated(pos, Branch::S(tn.sn));
                    let desired = to_contracted(ncn, lev);
                    if p.main.compare_exchange(Main::C(cn), desired) {
                        return;
                    }
                    // Lost the race; reload and retry.
                } else {
                    return;
                }
            }
            _ => return,
        }
    }
}

// =============================================================================
// Insertion and removal
// =============================================================================

/// Try to upgrade a candidate leaf from white to black. Returns the
/// color that decided the attempt: anything but red means the leaf is
/// (now) live and canonical.
fn upgrade(sn: Gc<SNode>) -> Color {
    let white = local_white();
    match sn.erase().header().transition(white, white.flip()) {
        Ok(()) => white.flip(),
        Err(seen) => {
            debug_assert_ne!(seen, Color::GRAY);
            seen
        }
    }
}

/// One descent attempt; `None` means a CAS was lost and the caller must
/// restart from the root.
fn iinsert(
    i: Gc<INode>,
    q: &Query,
    lev: u32,
    parent: Option<Gc<INode>>,
) -> Option<Gc<SNode>> {
    match i.main.load() {
        Main::C(cn) => {
            let (flag, pos) = flagpos(q.hash, lev, cn.bmp);
            if cn.bmp & flag == 0 {
                // Empty slot: install a fresh leaf.
                let sn = new_snode(q);
                let ncn = cn.inserted(flag, pos, Branch::S(sn));
                if i.main.compare_exchange(Main::C(cn), Main::C(ncn)) {
                    Some(sn)
                } else {
                    None
                }
            } else {
                match cn.branches[pos] {
                    Branch::I(sub) => iinsert(sub, q, lev + 6, Some(i)),
                    Branch::S(sn) => {
                        let equivalent =
                            sn.hash() == q.hash && sn.as_bytes() == q.bytes;
                        if equivalent && upgrade(sn) != Color::RED {
                            return Some(sn);
                        }
                        // Either a distinct string shares the slot, or the
                        // resident is condemned: install a replacement.
                        let nsn = new_snode(q);
                        let branch = if equivalent {
                            Branch::S(nsn)
                        } else {
                            Branch::I(alloc(INode::new(Main::C(CNode::pair(
                                sn,
                                nsn,
                                lev + 6,
                            )))))
                        };
                        let ncn = cn.updated(pos, branch);
                        if i.main.compare_exchange(Main::C(cn), Main::C(ncn)) {
                            Some(nsn)
                        } else {
                            None
                        }
                    }
                }
            }
        }
        Main::T(_) => {
            if let Some(p) = parent {
                clean(p, lev - 6);
            }
            None
        }
        Main::L(ln) => {
            // Collision bucket: a live equivalent wins outright.
            let mut cursor = Some(ln);
            while let Some(node) = cursor {
                if node.sn.as_bytes() == q.bytes {
                    if upgrade(node.sn) != Color::RED {
                        return Some(node.sn);
                    }
                    break;
                }
                cursor = node.next;
            }
            let (head, nsn) = lnode_inserted(ln, q);
            if i.main.compare_exchange(Main::L(ln), Main::L(head)) {
                Some(nsn)
            } else {
                None
            }
        }
    }
}

/// Rebuild a collision list with a fresh leaf for `q`, replacing any
/// equivalent resident. The untouched tail is reused.
fn lnode_inserted(head: Gc<LNode>, q: &Query) -> (Gc<LNode>, Gc<SNode>) {
    let mut prefix: Vec<Gc<SNode>> = Vec::new();
    let mut tail: Option<Gc<LNode>> = None;
    let mut found = false;
    let mut cursor = Some(head);
    while let Some(node) = cursor {
        if node.sn.as_bytes() == q.bytes {
            tail = node.next;
            found = true;
            break;
        }
        prefix.push(node.sn);
        cursor = node.next;
    }

    let nsn = new_snode(q);
    if !found {
        // Prepend, reusing the whole old list.
        shade(head.erase());
        return (
            alloc(LNode {
                sn: nsn,
                next: Some(head),
            }),
            nsn,
        );
    }
    if let Some(t) = tail {
        shade(t.erase());
    }
    let mut list = alloc(LNode {
        sn: nsn,
        next: tail,
    });
    for &sn in prefix.iter().rev() {
        list = alloc(LNode {
            sn,
            next: Some(list),
        });
    }
    (list, nsn)
}

enum Removed {
    NotFound,
    Done(Gc<SNode>),
    Restart,
}

fn iremove(
    i: Gc<INode>,
    key: Gc<SNode>,
    lev: u32,
    parent: Option<Gc<INode>>,
) -> Removed {
    match i.main.load() {
        Main::C(cn) => {
            let (flag, pos) = flagpos(key.hash(), lev, cn.bmp);
            if cn.bmp & flag == 0 {
                return Removed::NotFound;
            }
            let result = match cn.branches[pos] {
                Branch::I(sub) => iremove(sub, key, lev + 6, Some(i)),
                Branch::S(sn) => {
                    if !Gc::ptr_eq(sn, key) {
                        Removed::NotFound
                    } else {
                        let ncn = cn.removed(pos, flag);
                        let desired = to_contracted(ncn, lev);
                        if i.main.compare_exchange(Main::C(cn), desired) {
                            Removed::Done(sn)
                        } else {
                            Removed::Restart
                        }
                    }
                }
            };
            if let Removed::Done(_) = result {
                // The removal may have left this level entombed; splice
                // the tomb into the parent.
                if let Main::T(_) = i.main.load() {
                    if let Some(p) = parent {
                        clean_parent(p, i, key.hash(), lev - 6);
                    }
                }
            }
            result
        }
        Main::T(_) => {
            if let Some(p) = parent {
                clean(p, lev - 6);
            }
            Removed::Restart
        }
        Main::L(ln) => match lnode_removed(ln, key) {
            None => Removed::NotFound,
            Some((desired, sn)) => {
                if i.main.compare_exchange(Main::L(ln), desired) {
                    Removed::Done(sn)
                } else {
                    Removed::Restart
                }
            }
        },
    }
}

/// Rebuild a collision list without `key` (by identity). A list
/// shrinking to one element becomes a tomb.
fn lnode_removed(head: Gc<LNode>, key: Gc<SNode>) -> Option<(Main, Gc<SNode>)> {
    let mut prefix: Vec<Gc<SNode>> = Vec::new();
    let mut tail: Option<Gc<LNode>> = None;
    let mut found = None;
    let mut cursor = Some(head);
    while let Some(node) = cursor {
        if Gc::ptr_eq(node.sn, key) {
            tail = node.next;
            found = Some(node.sn);
            break;
        }
        prefix.push(node.sn);
        cursor = node.next;
    }
    let removed = found?;

    if let Some(t) = tail {
        shade(t.erase());
    }
    let mut list = tail;
    for &sn in prefix.iter().rev() {
        list = Some(alloc(LNode { sn, next: list }));
    }
    let desired = match list {
        Some(h) if h.next.is_none() => entomb(h.sn),
        Some(h) => Main::L(h),
        // A stored list always has at least two nodes, so removing one
        // leaves at least one.
        None => unreachable!("collision list emptied"),
    };
    Some((desired, removed))
}

// =============================================================================
// The intern set
// =============================================================================

/// The concurrent weak intern set. One global instance backs
/// [`intern`]; tests may create private instances.
pub struct Ctrie {
    root: Gc<INode>,
}

unsafe impl Trace for Ctrie {
    fn trace(&self, cx: &mut ScanContext) {
        cx.push(self.root.erase());
    }
}

impl Ctrie {
    /// Allocate a fresh, empty intern set. Must be called from an
    /// entered mutator; the caller is responsible for keeping the
    /// returned trie alive (e.g. as a root).
    ///
    /// Note that the sweep race unlinks condemned leaves from the
    /// *global* set only: a private trie is for quiescent use (tests,
    /// offline analysis), where every leaf stays strongly reachable or
    /// no collector is running.
    pub fn create() -> Gc<Ctrie> {
        let empty = alloc(CNode {
            bmp: 0,
            branches: Vec::new().into_boxed_slice(),
        });
        let root = alloc(INode::new(Main::C(empty)));
        alloc(Ctrie { root })
    }

    /// Return the canonical leaf for `q`, installing one if needed.
    pub fn emplace(&self, q: &Query) -> Gc<SNode> {
        loop {
            if let Some(sn) = iinsert(self.root, q, 0, None) {
                return sn;
            }
        }
    }

    /// Remove a leaf by pointer identity. Returns it if it was present.
    pub fn remove(&self, key: Gc<SNode>) -> Option<Gc<SNode>> {
        loop {
            match iremove(self.root, key, 0, None) {
                Removed::Restart => continue,
                Removed::NotFound => return None,
                Removed::Done(sn) => return Some(sn),
            }
        }
    }

    /// Count the trie's nodes by kind. A diagnostic walk, only
    /// meaningful while the trie is quiescent.
    pub fn census(&self) -> Census {
        let mut census = Census::default();
        census_inode(self.root, &mut census);
        census
    }
}

/// Node counts from [`Ctrie::census`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Census {
    pub inodes: usize,
    pub cnodes: usize,
    pub snodes: usize,
    pub tnodes: usize,
    pub lnodes: usize,
}

fn census_inode(i: Gc<INode>, census: &mut Census) {
    census.inodes += 1;
    match i.main.load() {
        Main::C(cn) => {
            census.cnodes += 1;
            for &b in cn.branches.iter() {
                match b {
                    Branch::I(sub) => census_inode(sub, census),
                    Branch::S(_) => census.snodes += 1,
                }
            }
        }
        Main::T(_) => {
            census.tnodes += 1;
            census.snodes += 1;
        }
        Main::L(ln) => {
            let mut cursor = Some(ln);
            while let Some(node) = cursor {
                census.lnodes += 1;
                census.snodes += 1;
                cursor = node.next;
            }
        }
    }
}

/// The global intern set, created on first use and pinned as a global
/// root.
fn strings() -> Gc<Ctrie> {
    let g = global();
    let mut gs = g.state.lock();
    if let Some(r) = gs.strings {
        return unsafe { r.downcast_unchecked::<Ctrie>() };
    }
    let ctrie = Ctrie::create();
    let erased = ctrie.erase();
    gs.strings = Some(erased);
    gs.roots.push(erased);
    ctrie
}

/// Return the canonical interned string for `bytes`.
///
/// Pointer equality on the result is content equality. Must be called
/// from an entered mutator.
pub fn intern(bytes: &[u8]) -> Gc<SNode> {
    strings().emplace(&Query::new(bytes))
}
