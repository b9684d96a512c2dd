//! Per-vector handler chains.
//!
//! Several devices can share one vector. Handlers are tried in registration
//! order and the first one that claims the interrupt ends the dispatch.

/// What a handler reports back to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    /// Not this device; try the next handler on the line.
    Unhandled,
}

/// A handler function plus the opaque context it was registered with.
#[derive(Debug, Clone, Copy)]
pub struct Handler {
    pub func: fn(usize) -> IrqReturn,
    pub ctx: usize,
}

impl Handler {
    pub const fn new(func: fn(usize) -> IrqReturn, ctx: usize) -> Self {
        Self { func, ctx }
    }

    pub fn call(&self) -> IrqReturn {
        (self.func)(self.ctx)
    }

    /// Same function and context.
    pub fn same_as(&self, other: &Handler) -> bool {
        self.func as usize == other.func as usize && self.ctx == other.ctx
    }
}

/// How many handlers may share one vector.
pub const MAX_SHARED: usize = 4;

/// The handlers registered on one vector, in registration order.
#[derive(Debug, Clone, Copy)]
pub struct HandlerChain {
    slots: [Option<Handler>; MAX_SHARED],
}

/// Outcome of [`HandlerChain::dispatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Claimed by the handler at this position in the chain.
    Handled(usize),
    /// Every registered handler declined.
    Unhandled,
    /// Nothing is registered on the vector.
    Empty,
}

impl HandlerChain {
    pub const EMPTY: Self = Self {
        slots: [None; MAX_SHARED],
    };

    pub fn is_empty(&self) -> bool {
        self.slots[0].is_none()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().take_while(|s| s.is_some()).count()
    }

    /// Appends `handler`; returns `false` when the chain is full.
    pub fn push(&mut self, handler: Handler) -> bool {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(handler);
                true
            }
            None => false,
        }
    }

    /// Removes `handler`, keeping the order of the rest.
    pub fn remove(&mut self, handler: Handler) -> bool {
        let Some(pos) = self
            .slots
            .iter()
            .position(|s| s.is_some_and(|h| h.same_as(&handler)))
        else {
            return false;
        };
        self.slots[pos..].rotate_left(1);
        self.slots[MAX_SHARED - 1] = None;
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handler> {
        self.slots.iter().map_while(Option::as_ref)
    }

    pub fn dispatch(&self) -> Dispatch {
        if self.is_empty() {
            return Dispatch::Empty;
        }
        self.iter()
            .position(|h| h.call() == IrqReturn::Handled)
            .map_or(Dispatch::Unhandled, Dispatch::Handled)
    }
}

/// Handler chains for `N` consecutive vectors starting at `base`.
pub struct HandlerTable<const N: usize> {
    base: u8,
    chains: [HandlerChain; N],
}

impl<const N: usize> HandlerTable<N> {
    pub const fn new(base: u8) -> Self {
        Self {
            base,
            chains: [HandlerChain::EMPTY; N],
        }
    }

    fn index(&self, vector: u8) -> Option<usize> {
        let index = vector.checked_sub(self.base)? as usize;
        (index < N).then_some(index)
    }

    pub fn chain(&self, vector: u8) -> Option<&HandlerChain> {
        self.index(vector).map(|i| &self.chains[i])
    }

    pub fn chain_mut(&mut self, vector: u8) -> Option<&mut HandlerChain> {
        self.index(vector).map(|i| &mut self.chains[i])
    }
}
