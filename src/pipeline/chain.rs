//! Arena-backed stage chain.
//!
//! Every stage of one physical connection, including the sub-chains of its
//! multiplexed logical connections, lives in one [`Pipeline`]. Nodes are
//! addressed by generational [`StageHandle`]s, so a handle to a freed node
//! simply stops resolving.
//!
//! Dispatch is deferred: events a stage emits are delivered after its handler
//! returns, ahead of anything queued earlier. The result is depth-first
//! delivery, as if each dispatch were a direct call, without ever re-entering
//! a stage that is still running.

use std::collections::VecDeque;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::boundary::{HighBoundary, LowBoundary};
use super::{EnvBlock, Signal, Stage};
use crate::error::{Error, Result};

/// Address of a node in a [`Pipeline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageHandle {
    index: u32,
    generation: u32,
}

/// One delivery to a stage.
#[derive(Debug)]
pub enum Event {
    /// Data dispatched down by the stage above
    DataFromUp(Bytes),
    /// Data dispatched up by the stage below
    DataFromDown(Bytes),
    /// Signal dispatched down by the stage above
    SignalFromUp(Signal),
    /// Signal dispatched up by the stage below
    SignalFromDown(Signal),
}

/// Event posted from an I/O task into its connection task.
#[derive(Debug)]
pub struct Inbound {
    /// Node that should receive the event
    pub target: StageHandle,
    /// The event
    pub event: Event,
}

/// Sender half of a connection task's event queue.
pub type Mailbox = mpsc::UnboundedSender<Inbound>;

/// The two ends of a chain built by [`Pipeline::build_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    low: StageHandle,
    high: StageHandle,
}

impl SessionHandle {
    /// Transport-facing end.
    pub fn bottom(&self) -> StageHandle {
        self.low
    }

    /// Application-facing end.
    pub fn top(&self) -> StageHandle {
        self.high
    }

    /// Feed a signal in at the bottom and run the chain until it settles.
    pub fn dispatch_signal_up(&self, pipeline: &mut Pipeline, signal: Signal) -> Result<()> {
        pipeline.deliver(self.low, Event::SignalFromDown(signal));
        pipeline.drive()
    }

    /// Feed a signal in at the top and run the chain until it settles.
    pub fn dispatch_signal_down(&self, pipeline: &mut Pipeline, signal: Signal) -> Result<()> {
        pipeline.deliver(self.high, Event::SignalFromUp(signal));
        pipeline.drive()
    }
}

/// Proxies for the two boundary adapters of a chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct Bounds {
    /// Stage the Low adapter forwards to
    pub low: Option<StageHandle>,
    /// Stage the High adapter forwards to
    pub high: Option<StageHandle>,
}

struct Node {
    stage: Option<Box<dyn Stage>>,
    up: Option<StageHandle>,
    down: Option<StageHandle>,
    env: usize,
    linked: bool,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

struct EnvSlot {
    block: EnvBlock,
    refs: usize,
}

struct Delivery {
    target: StageHandle,
    event: Event,
}

/// Owner of every stage of one physical connection.
pub struct Pipeline {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    envs: Vec<EnvSlot>,
    free_envs: Vec<usize>,
    queue: VecDeque<Delivery>,
    staged: Vec<Delivery>,
    released: Vec<StageHandle>,
    mailbox: Mailbox,
}

impl Pipeline {
    /// Create an empty pipeline whose I/O tasks post into `mailbox`.
    pub fn new(mailbox: Mailbox) -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            envs: Vec::new(),
            free_envs: Vec::new(),
            queue: VecDeque::new(),
            staged: Vec::new(),
            released: Vec::new(),
            mailbox,
        }
    }

    /// Wrap `stages` (bottom first) with Low and High adapters and link them.
    pub fn build_session(
        &mut self,
        env: EnvBlock,
        bounds: Bounds,
        stages: Vec<Box<dyn Stage>>,
    ) -> Result<SessionHandle> {
        let env = self.alloc_env(env);

        let low = self.alloc_node(Box::new(LowBoundary::new(bounds.low)), env);
        let mut last = low;
        for stage in stages {
            let node = self.alloc_node(stage, env);
            self.link_up(last, node)?;
            last = node;
        }
        let high = self.alloc_node(Box::new(HighBoundary::new(bounds.high)), env);
        self.link_up(last, high)?;

        tracing::trace!(?low, ?high, "session built");
        Ok(SessionHandle { low, high })
    }

    /// Queue an event for a node. Nothing runs until [`Pipeline::drive`].
    pub fn deliver(&mut self, target: StageHandle, event: Event) {
        self.queue.push_back(Delivery { target, event });
    }

    /// Run queued events until the queue is empty.
    ///
    /// An error from a stage is an invariant violation; the queue is left as
    /// is and the caller is expected to drop the pipeline.
    pub fn drive(&mut self) -> Result<()> {
        while let Some(Delivery { target, event }) = self.queue.pop_front() {
            let Some((mut stage, env)) = self.take_stage(target) else {
                tracing::trace!(?target, ?event, "dropping event for released stage");
                continue;
            };

            let result = {
                let mut ctx = Context {
                    pipeline: &mut *self,
                    node: target,
                    env,
                };
                match event {
                    Event::DataFromUp(data) => stage.fetch_data_from_up(&mut ctx, data),
                    Event::DataFromDown(data) => stage.fetch_data_from_down(&mut ctx, data),
                    Event::SignalFromUp(signal) => stage.fetch_signal_from_up(&mut ctx, signal),
                    Event::SignalFromDown(signal) => stage.fetch_signal_from_down(&mut ctx, signal),
                }
            };

            if let Some(node) = self.node_mut(target) {
                node.stage = Some(stage);
            }
            while let Some(delivery) = self.staged.pop() {
                self.queue.push_front(delivery);
            }

            result?;
        }

        self.sweep();
        Ok(())
    }

    /// Environment of the chain `handle` belongs to.
    pub fn env(&self, handle: StageHandle) -> Option<&EnvBlock> {
        self.node(handle).map(|node| &self.envs[node.env].block)
    }

    /// Names of the stages from the bottom of `session` to its top.
    pub fn stage_names(&self, session: SessionHandle) -> Vec<&'static str> {
        let mut names = Vec::new();
        let mut cursor = Some(session.low);
        while let Some(handle) = cursor {
            let Some(node) = self.node(handle) else { break };
            names.push(node.stage.as_ref().map_or("<running>", |s| s.name()));
            if handle == session.high {
                break;
            }
            cursor = node.up;
        }
        names
    }

    /// Number of live nodes, released ones included until they are swept.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.node.is_some()).count()
    }

    /// Whether the pipeline holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc_env(&mut self, block: EnvBlock) -> usize {
        let slot = EnvSlot { block, refs: 0 };
        match self.free_envs.pop() {
            Some(index) => {
                self.envs[index] = slot;
                index
            }
            None => {
                self.envs.push(slot);
                self.envs.len() - 1
            }
        }
    }

    fn alloc_node(&mut self, stage: Box<dyn Stage>, env: usize) -> StageHandle {
        self.envs[env].refs += 1;
        let node = Node {
            stage: Some(stage),
            up: None,
            down: None,
            env,
            linked: true,
        };

        match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                StageHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                StageHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        }
    }

    fn node(&self, handle: StageHandle) -> Option<&Node> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, handle: StageHandle) -> Option<&mut Node> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Take the stage out of its node, along with the node's env slot.
    fn take_stage(&mut self, handle: StageHandle) -> Option<(Box<dyn Stage>, usize)> {
        self.node_mut(handle)
            .and_then(|node| node.stage.take().map(|stage| (stage, node.env)))
    }

    /// Insert `new` directly above `anchor`.
    fn link_up(&mut self, anchor: StageHandle, new: StageHandle) -> Result<()> {
        let above = self.unlinked_neighbours(anchor, new)?.up;
        self.set_links(new, above, Some(anchor));
        if let Some(above) = above {
            self.node_mut(above).ok_or(Error::Invariant("stale neighbour"))?.down = Some(new);
        }
        self.node_mut(anchor).ok_or(Error::Invariant("stale anchor"))?.up = Some(new);
        Ok(())
    }

    /// Insert `new` directly below `anchor`.
    fn link_down(&mut self, anchor: StageHandle, new: StageHandle) -> Result<()> {
        let below = self.unlinked_neighbours(anchor, new)?.down;
        self.set_links(new, Some(anchor), below);
        if let Some(below) = below {
            self.node_mut(below).ok_or(Error::Invariant("stale neighbour"))?.up = Some(new);
        }
        self.node_mut(anchor).ok_or(Error::Invariant("stale anchor"))?.down = Some(new);
        Ok(())
    }

    /// Check that `new` is fresh and return the anchor's current links.
    fn unlinked_neighbours(&self, anchor: StageHandle, new: StageHandle) -> Result<Links> {
        let fresh = self.node(new).ok_or(Error::Invariant("stale stage handle"))?;
        if fresh.up.is_some() || fresh.down.is_some() || !fresh.linked {
            return Err(Error::Invariant("attaching an already linked stage"));
        }
        let anchor = self.node(anchor).ok_or(Error::Invariant("stale anchor"))?;
        if !anchor.linked {
            return Err(Error::Invariant("attaching next to a detached stage"));
        }
        Ok(Links {
            up: anchor.up,
            down: anchor.down,
        })
    }

    fn set_links(&mut self, handle: StageHandle, up: Option<StageHandle>, down: Option<StageHandle>) {
        if let Some(node) = self.node_mut(handle) {
            node.up = up;
            node.down = down;
        }
    }

    /// Remove `handle` from its chain, joining its neighbours.
    ///
    /// The node keeps its own links until it is swept, so events already
    /// queued for it still flow along the new shape of the chain.
    fn unlink(&mut self, handle: StageHandle) -> Result<()> {
        let node = self.node_mut(handle).ok_or(Error::Invariant("stale stage handle"))?;
        if !node.linked {
            return Err(Error::Invariant("stage detached twice"));
        }
        node.linked = false;
        let (up, down) = (node.up, node.down);

        if let Some(up) = up.and_then(|h| self.node_mut(h)) {
            up.down = down;
        }
        if let Some(down) = down.and_then(|h| self.node_mut(h)) {
            down.up = up;
        }
        self.released.push(handle);
        Ok(())
    }

    /// Mark every node of `session` for release.
    fn release_chain(&mut self, session: SessionHandle) {
        let mut cursor = Some(session.low);
        while let Some(handle) = cursor {
            let Some(node) = self.node_mut(handle) else { break };
            cursor = if handle == session.high { None } else { node.up };
            let was_linked = std::mem::replace(&mut node.linked, false);
            if was_linked {
                self.released.push(handle);
            }
        }
    }

    /// Free released nodes. Only called with an empty queue.
    fn sweep(&mut self) {
        for handle in std::mem::take(&mut self.released) {
            let Some(slot) = self.slots.get_mut(handle.index as usize) else { continue };
            if slot.generation != handle.generation {
                continue;
            }
            let Some(node) = slot.node.take() else { continue };
            slot.generation = slot.generation.wrapping_add(1);
            self.free_slots.push(handle.index);

            let env = &mut self.envs[node.env];
            env.refs -= 1;
            if env.refs == 0 {
                self.free_envs.push(node.env);
            }
            // Dropping the stage here closes whatever sockets it owns.
            drop(node);
        }
    }

    #[cfg(test)]
    pub(crate) fn links_are_consistent(&self, session: SessionHandle) -> bool {
        let mut cursor = session.low;
        loop {
            let Some(node) = self.node(cursor) else { return false };
            if cursor == session.high {
                return true;
            }
            let Some(up) = node.up else { return false };
            match self.node(up) {
                Some(above) if above.down == Some(cursor) && above.linked => cursor = up,
                _ => return false,
            }
        }
    }
}

struct Links {
    up: Option<StageHandle>,
    down: Option<StageHandle>,
}

/// A stage's view of its own node.
pub struct Context<'a> {
    pipeline: &'a mut Pipeline,
    node: StageHandle,
    // Env slots are only freed by `sweep`, never while a stage runs.
    env: usize,
}

impl Context<'_> {
    /// Handle of the running stage.
    pub fn handle(&self) -> StageHandle {
        self.node
    }

    /// Send data to the stage above.
    pub fn dispatch_data_up(&mut self, data: Bytes) -> Result<()> {
        let up = self.up()?;
        self.stage(up, Event::DataFromDown(data));
        Ok(())
    }

    /// Send data to the stage below.
    pub fn dispatch_data_down(&mut self, data: Bytes) -> Result<()> {
        let down = self.down()?;
        self.stage(down, Event::DataFromUp(data));
        Ok(())
    }

    /// Send a signal to the stage above.
    pub fn dispatch_signal_up(&mut self, signal: Signal) -> Result<()> {
        let up = self.up()?;
        self.stage(up, Event::SignalFromDown(signal));
        Ok(())
    }

    /// Send a signal to the stage below.
    pub fn dispatch_signal_down(&mut self, signal: Signal) -> Result<()> {
        let down = self.down()?;
        self.stage(down, Event::SignalFromUp(signal));
        Ok(())
    }

    /// Insert a new stage directly above this one.
    pub fn attach_up(&mut self, stage: Box<dyn Stage>) -> Result<StageHandle> {
        let new = self.pipeline.alloc_node(stage, self.env);
        self.pipeline.link_up(self.node, new)?;
        Ok(new)
    }

    /// Insert a new stage directly below this one.
    pub fn attach_down(&mut self, stage: Box<dyn Stage>) -> Result<StageHandle> {
        let new = self.pipeline.alloc_node(stage, self.env);
        self.pipeline.link_down(self.node, new)?;
        Ok(new)
    }

    /// Remove this stage from the chain, joining its neighbours.
    ///
    /// The stage keeps running for events already on their way to it and
    /// can still dispatch to its former neighbours until those are handled.
    pub fn detach(&mut self) -> Result<()> {
        self.pipeline.unlink(self.node)
    }

    /// Environment of this chain.
    pub fn env(&self) -> &EnvBlock {
        &self.pipeline.envs[self.env].block
    }

    /// Mutable environment of this chain.
    pub fn env_mut(&mut self) -> &mut EnvBlock {
        &mut self.pipeline.envs[self.env].block
    }

    /// Deliver an event straight to another node, such as a sub-chain
    /// this stage built.
    pub fn deliver(&mut self, target: StageHandle, event: Event) {
        self.stage(target, event);
    }

    /// Build a sub-chain in the same pipeline.
    pub fn spawn_session(
        &mut self,
        env: EnvBlock,
        low_proxy: Option<StageHandle>,
        stages: Vec<Box<dyn Stage>>,
    ) -> Result<SessionHandle> {
        self.pipeline.build_session(
            env,
            Bounds {
                low: low_proxy,
                high: None,
            },
            stages,
        )
    }

    /// Free a sub-chain once pending events have been handled.
    pub fn release_session(&mut self, session: SessionHandle) {
        self.pipeline.release_chain(session);
    }

    /// Sender that I/O tasks use to feed events back to this connection.
    pub fn mailbox(&self) -> Mailbox {
        self.pipeline.mailbox.clone()
    }

    fn up(&self) -> Result<StageHandle> {
        self.pipeline
            .node(self.node)
            .and_then(|node| node.up)
            .ok_or(Error::Invariant("no stage above"))
    }

    fn down(&self) -> Result<StageHandle> {
        self.pipeline
            .node(self.node)
            .and_then(|node| node.down)
            .ok_or(Error::Invariant("no stage below"))
    }

    fn stage(&mut self, target: StageHandle, event: Event) {
        tracing::trace!(from = ?self.node, to = ?target, ?event, "dispatch");
        self.pipeline.staged.push(Delivery { target, event });
    }
}
