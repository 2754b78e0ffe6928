//! Region groups: hierarchical memory accounting and admission control.
//!
//! Groups form a tree. Every byte a region takes or gives back is added to
//! its group and to every ancestor. A group is under *soft pressure* once its
//! usage reaches the soft limit and under *pressure* once it exceeds the hard
//! limit; both transitions are reported to an optional listener.
//!
//! ```text
//!                 root (hard = 1 GB)
//!                /                  \
//!        memtables (soft)         cache
//!         |     |                   |
//!       r1     r2                  r3
//! ```
//!
//! While any ancestor of a group is under pressure, requests admitted through
//! [`RegionGroup::run_when_memory_available`] wait in a FIFO queue at the
//! topmost blocking ancestor. Once pressure is relieved they are released
//! one at a time: the next waiter goes when the previous one has finished.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::GroupConfig;
use crate::error::{MemoryError, MemoryResult};
use crate::heap::IndexedHeap;
use crate::region::RegionId;

/// Receives pressure transitions of a group.
///
/// Callbacks run after the accounting change that caused them, with no
/// group state borrowed, so they may inspect groups freely.
pub trait PressureListener {
    /// The group went above its hard limit.
    fn on_pressure(&self, _group: &str) {}

    /// The group went back to or below its hard limit.
    fn on_relief(&self, _group: &str) {}

    /// The group reached its soft limit.
    fn on_soft_pressure(&self, _group: &str) {}

    /// The group went back below its soft limit.
    fn on_soft_relief(&self, _group: &str) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Pressure,
    Relief,
    SoftPressure,
    SoftRelief,
}

// =============================================================================
// Group internals
// =============================================================================

struct GroupState {
    total_memory: usize,
    under_pressure: bool,
    under_soft_pressure: bool,
    subgroups: Vec<Weak<GroupNode>>,
    /// Member regions keyed so that the largest is on top.
    regions: IndexedHeap<RegionId, Reverse<usize>>,
    blocked: VecDeque<(u64, oneshot::Sender<()>)>,
    /// Request released and still running.
    running: Option<u64>,
}

/// Shared node of the group tree. Regions and subgroups hold it by `Rc`.
pub(crate) struct GroupNode {
    name: String,
    config: GroupConfig,
    parent: Option<Rc<GroupNode>>,
    state: RefCell<GroupState>,
    listener: RefCell<Option<Rc<dyn PressureListener>>>,
    next_request: Cell<u64>,
}

impl GroupNode {
    fn new(name: String, config: GroupConfig, parent: Option<Rc<GroupNode>>) -> Self {
        Self {
            name,
            config,
            parent,
            state: RefCell::new(GroupState {
                total_memory: 0,
                under_pressure: false,
                under_soft_pressure: false,
                subgroups: Vec::new(),
                regions: IndexedHeap::new(),
                blocked: VecDeque::new(),
                running: None,
            }),
            listener: RefCell::new(None),
            next_request: Cell::new(0),
        }
    }

    pub fn add_region(&self, id: RegionId) {
        self.state.borrow_mut().regions.push(id, Reverse(0));
    }

    pub fn resize_region(&self, id: RegionId, total_space: usize) {
        self.state
            .borrow_mut()
            .regions
            .update(id, Reverse(total_space));
    }

    pub fn remove_region(&self, id: RegionId) {
        self.state.borrow_mut().regions.remove(id);
    }

    /// Adds `delta` bytes to this group and every ancestor.
    pub fn update(self: &Rc<Self>, delta: isize) {
        let mut transitions = Vec::new();
        let mut relieved: Option<Rc<GroupNode>> = None;

        let mut node = Some(Rc::clone(self));
        while let Some(current) = node {
            {
                let mut state = current.state.borrow_mut();
                state.total_memory = state
                    .total_memory
                    .checked_add_signed(delta)
                    .unwrap_or_else(|| {
                        panic!("group {} accounting went negative", current.name)
                    });
                let total = state.total_memory;

                let soft = total >= current.config.soft_limit;
                if soft != state.under_soft_pressure {
                    state.under_soft_pressure = soft;
                    let transition = if soft {
                        Transition::SoftPressure
                    } else {
                        Transition::SoftRelief
                    };
                    transitions.push((Rc::clone(&current), transition));
                }

                let hard = total > current.config.hard_limit;
                if hard != state.under_pressure {
                    state.under_pressure = hard;
                    if hard {
                        transitions.push((Rc::clone(&current), Transition::Pressure));
                    } else {
                        transitions.push((Rc::clone(&current), Transition::Relief));
                        relieved = Some(Rc::clone(&current));
                    }
                }
            }
            node = current.parent.clone();
        }

        for (group, transition) in transitions {
            group.notify(transition);
        }
        if let Some(top) = relieved {
            top.release_subtree();
        }
    }

    pub fn memory_used(&self) -> usize {
        self.state.borrow().total_memory
    }

    /// True if neither this group nor any ancestor is under pressure.
    pub fn execution_permitted(&self) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if current.state.borrow().under_pressure {
                return false;
            }
            node = current.parent.as_deref();
        }
        true
    }

    /// Largest member region of this group's subtree with its total space.
    fn largest_region(&self) -> Option<(usize, RegionId)> {
        let (own, subgroups) = {
            let state = self.state.borrow();
            let own = state
                .regions
                .peek()
                .map(|(id, &Reverse(total))| (total, id));
            let subgroups: Vec<_> = state.subgroups.iter().filter_map(Weak::upgrade).collect();
            (own, subgroups)
        };
        subgroups
            .iter()
            .filter_map(|group| group.largest_region())
            .chain(own)
            .max()
    }

    /// Topmost group on the path from the root that is under pressure or
    /// already has waiters.
    fn blocking_ancestor(self: &Rc<Self>) -> Option<Rc<GroupNode>> {
        let mut path = Vec::new();
        let mut node = Some(Rc::clone(self));
        while let Some(current) = node {
            node = current.parent.clone();
            path.push(current);
        }
        path.into_iter().rev().find(|group| {
            let state = group.state.borrow();
            state.under_pressure || !state.blocked.is_empty()
        })
    }

    fn enqueue(&self, sender: oneshot::Sender<()>) -> u64 {
        let id = self.next_request.get();
        self.next_request.set(id + 1);
        self.state.borrow_mut().blocked.push_back((id, sender));
        id
    }

    /// Lets the next waiter run if execution is permitted and no released
    /// request is still running.
    fn release_requests(&self) {
        if !self.execution_permitted() {
            return;
        }
        let mut state = self.state.borrow_mut();
        if state.running.is_some() {
            return;
        }
        while let Some((id, sender)) = state.blocked.pop_front() {
            if sender.send(()).is_ok() {
                state.running = Some(id);
                trace!(group = %self.name, request = id, "request released");
                return;
            }
        }
    }

    /// Forgets request `id`, whether still queued or running, and releases the next one.
    fn finish_request(&self, id: u64) {
        {
            let mut state = self.state.borrow_mut();
            if state.running == Some(id) {
                state.running = None;
            } else {
                state.blocked.retain(|(queued, _)| *queued != id);
            }
        }
        self.release_requests();
    }

    fn release_subtree(&self) {
        self.release_requests();
        let subgroups: Vec<_> = self
            .state
            .borrow()
            .subgroups
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for group in subgroups {
            group.release_subtree();
        }
    }

    fn notify(&self, transition: Transition) {
        debug!(group = %self.name, ?transition, bytes = self.memory_used(), "memory pressure changed");
        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            match transition {
                Transition::Pressure => listener.on_pressure(&self.name),
                Transition::Relief => listener.on_relief(&self.name),
                Transition::SoftPressure => listener.on_soft_pressure(&self.name),
                Transition::SoftRelief => listener.on_soft_relief(&self.name),
            }
        }
    }
}

/// Finishes a queued request when dropped, however the wait ended.
struct ReleaseNext {
    group: Rc<GroupNode>,
    id: u64,
}

impl Drop for ReleaseNext {
    fn drop(&mut self) {
        self.group.finish_request(self.id);
    }
}

// =============================================================================
// RegionGroup
// =============================================================================

/// A node of the memory accounting tree.
///
/// A group must outlive its member regions and its subgroups.
pub struct RegionGroup {
    node: Rc<GroupNode>,
}

impl RegionGroup {
    /// Creates a root group.
    pub fn new(name: impl Into<String>, config: GroupConfig) -> MemoryResult<Self> {
        config.validate().map_err(MemoryError::config)?;
        Ok(Self {
            node: Rc::new(GroupNode::new(name.into(), config, None)),
        })
    }

    /// Creates a subgroup of `parent`.
    pub fn with_parent(
        name: impl Into<String>,
        config: GroupConfig,
        parent: &RegionGroup,
    ) -> MemoryResult<Self> {
        config.validate().map_err(MemoryError::config)?;
        let node = Rc::new(GroupNode::new(
            name.into(),
            config,
            Some(Rc::clone(&parent.node)),
        ));
        parent
            .node
            .state
            .borrow_mut()
            .subgroups
            .push(Rc::downgrade(&node));
        Ok(Self { node })
    }

    pub(crate) fn node(&self) -> &Rc<GroupNode> {
        &self.node
    }

    /// Returns the group name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// Returns the group limits.
    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.node.config
    }

    /// Bytes used by this group and its subgroups.
    #[must_use]
    pub fn memory_used(&self) -> usize {
        self.node.memory_used()
    }

    /// True while usage is above the hard limit.
    #[must_use]
    pub fn under_pressure(&self) -> bool {
        self.node.state.borrow().under_pressure
    }

    /// True while usage is at or above the soft limit.
    #[must_use]
    pub fn under_soft_pressure(&self) -> bool {
        self.node.state.borrow().under_soft_pressure
    }

    /// True if no group on the path to the root is under pressure.
    #[must_use]
    pub fn execution_permitted(&self) -> bool {
        self.node.execution_permitted()
    }

    /// Requests waiting in this group's queue.
    #[must_use]
    pub fn blocked_requests(&self) -> usize {
        self.node.state.borrow().blocked.len()
    }

    /// Installs the listener notified of this group's pressure transitions.
    pub fn set_listener(&self, listener: Rc<dyn PressureListener>) {
        *self.node.listener.borrow_mut() = Some(listener);
    }

    /// Removes the pressure listener.
    pub fn clear_listener(&self) {
        self.node.listener.borrow_mut().take();
    }

    /// Accounts memory not owned by any member region.
    pub fn update(&self, delta: isize) {
        self.node.update(delta);
    }

    /// Largest region of this group and its subgroups.
    pub fn get_largest_region(&self) -> Option<RegionId> {
        self.node.largest_region().map(|(_, id)| id)
    }

    /// Runs `f` once memory is available.
    ///
    /// Requests below the admission threshold, and requests no ancestor
    /// blocks, run immediately. Others wait in FIFO order until pressure is
    /// relieved and the request before them has finished. With a `timeout`,
    /// a request still waiting when it expires fails with
    /// [`MemoryError::Timeout`] and leaves the queue.
    pub async fn run_when_memory_available<F, Fut, R>(
        &self,
        request_size: usize,
        timeout: Option<Duration>,
        f: F,
    ) -> MemoryResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if request_size < self.node.config.admission_threshold {
            return Ok(f().await);
        }
        let Some(blocker) = self.node.blocking_ancestor() else {
            return Ok(f().await);
        };

        let (tx, rx) = oneshot::channel();
        let id = blocker.enqueue(tx);
        let _release = ReleaseNext {
            group: Rc::clone(&blocker),
            id,
        };
        trace!(group = %blocker.name, request = id, bytes = request_size, "request queued");
        blocker.release_requests();

        let released = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(released) => released,
                Err(_) => {
                    debug!(group = %blocker.name, request = id, "request timed out");
                    return Err(MemoryError::Timeout {
                        duration_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };
        match released {
            Ok(()) => Ok(f().await),
            Err(_) => Err(MemoryError::GroupShutdown {
                group: blocker.name.clone(),
            }),
        }
    }
}

impl fmt::Debug for RegionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.node.state.borrow();
        f.debug_struct("RegionGroup")
            .field("name", &self.node.name)
            .field("memory_used", &state.total_memory)
            .field("under_pressure", &state.under_pressure)
            .field("under_soft_pressure", &state.under_soft_pressure)
            .field("blocked", &state.blocked.len())
            .finish()
    }
}

impl Drop for RegionGroup {
    fn drop(&mut self) {
        let total = {
            let mut state = self.node.state.borrow_mut();
            assert!(
                state.regions.is_empty(),
                "region group {} dropped with member regions",
                self.node.name
            );
            assert!(
                state.subgroups.iter().all(|group| group.strong_count() == 0),
                "region group {} dropped with live subgroups",
                self.node.name
            );
            // Waiters see their sender go away and fail with GroupShutdown.
            state.blocked.clear();
            state.total_memory
        };
        if let Some(parent) = &self.node.parent {
            let this = Rc::downgrade(&self.node);
            parent
                .state
                .borrow_mut()
                .subgroups
                .retain(|group| !group.ptr_eq(&this));
            if total > 0 {
                parent.update(-(total as isize));
            }
        }
    }
}
