//! Global system interrupt to vector routing and dispatch.

use ksync::IrqSpinlock;

use crate::{
    Dispatch, Handler, HandlerTable, IRQ_VECTOR_BASE, IRQ_VECTORS, IrqController, IrqError,
    IrqReturn, LEGACY_VECTOR_BASE, LEGACY_VECTORS, VectorAllocator,
};

const ROUTED_VECTORS: usize = LEGACY_VECTORS + IRQ_VECTORS;

struct RouterState<C> {
    controller: C,
    vectors: VectorAllocator,
    handlers: HandlerTable<ROUTED_VECTORS>,
    /// GSI currently routed to each vector.
    routes: [Option<u32>; ROUTED_VECTORS],
}

impl<C: IrqController> RouterState<C> {
    fn vector_of(&self, gsi: u32) -> Option<u8> {
        self.routes
            .iter()
            .position(|r| *r == Some(gsi))
            .map(|i| LEGACY_VECTOR_BASE + i as u8)
    }

    fn slot(vector: u8) -> usize {
        usize::from(vector - LEGACY_VECTOR_BASE)
    }
}

/// Owns the interrupt controller and every device handler chain.
///
/// Handlers run without the router lock held, so a handler may register or
/// remove handlers itself.
pub struct IrqRouter<C> {
    state: IrqSpinlock<RouterState<C>>,
}

impl<C: IrqController> IrqRouter<C> {
    pub fn new(controller: C) -> Self {
        Self {
            state: IrqSpinlock::new(RouterState {
                controller,
                vectors: VectorAllocator::new(IRQ_VECTOR_BASE, IRQ_VECTORS),
                handlers: HandlerTable::new(LEGACY_VECTOR_BASE),
                routes: [None; ROUTED_VECTORS],
            }),
        }
    }

    /// Attaches `func(ctx)` to `gsi` and returns the vector it arrives on.
    ///
    /// A GSI that is already routed keeps its vector and the handler joins
    /// the end of its chain. Otherwise a vector is taken from the bitmap (or
    /// the controller's fixed one) and the controller is programmed.
    pub fn irq_add_handler(
        &self,
        gsi: u32,
        func: fn(usize) -> IrqReturn,
        ctx: usize,
    ) -> Result<u8, IrqError> {
        let handler = Handler::new(func, ctx);
        let mut state = self.state.lock();

        if let Some(vector) = state.vector_of(gsi) {
            let chain = state
                .handlers
                .chain_mut(vector)
                .expect("routed vector has a handler chain");
            if !chain.push(handler) {
                return Err(IrqError::SharedLineFull(gsi));
            }
            log::debug!("gsi {gsi}: shared handler added on vector {vector:#x}");
            return Ok(vector);
        }

        let fixed = state.controller.fixed_vector(gsi);
        let vector = match fixed {
            Some(vector) => vector,
            None => state.vectors.allocate().ok_or(IrqError::Exhausted)?,
        };
        if let Err(err) = state.controller.route(gsi, vector) {
            if fixed.is_none() {
                state.vectors.free(vector);
            }
            return Err(err);
        }
        state.routes[RouterState::<C>::slot(vector)] = Some(gsi);
        state
            .handlers
            .chain_mut(vector)
            .expect("routed vector has a handler chain")
            .push(handler);
        log::debug!("gsi {gsi}: routed to vector {vector:#x}");
        Ok(vector)
    }

    /// Detaches a handler. When the last handler of a GSI goes, the line is
    /// masked and its vector returned to the bitmap.
    pub fn irq_remove_handler(&self, gsi: u32, func: fn(usize) -> IrqReturn, ctx: usize) -> bool {
        let mut state = self.state.lock();
        let Some(vector) = state.vector_of(gsi) else {
            return false;
        };
        let chain = state
            .handlers
            .chain_mut(vector)
            .expect("routed vector has a handler chain");
        if !chain.remove(Handler::new(func, ctx)) {
            return false;
        }
        if chain.is_empty() {
            state.controller.unroute(gsi);
            state.routes[RouterState::<C>::slot(vector)] = None;
            if state.vectors.contains(vector) {
                state.vectors.free(vector);
            }
            log::debug!("gsi {gsi}: unrouted from vector {vector:#x}");
        }
        true
    }

    /// Runs the chain for `vector` and acknowledges the interrupt.
    ///
    /// Nobody claiming the interrupt is not an error: shared lines fire for
    /// devices with nothing pending.
    pub fn irq_handle(&self, vector: u8) -> Dispatch {
        let chain = self.state.lock().handlers.chain(vector).copied();
        let result = match chain {
            Some(chain) => chain.dispatch(),
            None => {
                log::warn!("interrupt on vector {vector:#x} outside the routed range");
                Dispatch::Empty
            }
        };
        if !matches!(result, Dispatch::Handled(_)) {
            log::debug!("unhandled interrupt on vector {vector:#x}");
        }
        self.state.lock().controller.eoi(vector);
        result
    }

    pub fn vector_of(&self, gsi: u32) -> Option<u8> {
        self.state.lock().vector_of(gsi)
    }

    pub fn free_vectors(&self) -> usize {
        self.state.lock().vectors.available()
    }

    pub fn with_controller<T>(&self, f: impl FnOnce(&mut C) -> T) -> T {
        f(&mut self.state.lock().controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Controller that accepts every route and records what it was told.
    #[derive(Default)]
    struct FakeController {
        fixed: bool,
        routed: Vec<(u32, u8)>,
        unrouted: Vec<u32>,
        eois: Vec<u8>,
    }

    impl IrqController for FakeController {
        fn fixed_vector(&self, gsi: u32) -> Option<u8> {
            (self.fixed && gsi < 16).then(|| LEGACY_VECTOR_BASE + gsi as u8)
        }

        fn route(&mut self, gsi: u32, vector: u8) -> Result<(), IrqError> {
            if gsi == 99 {
                return Err(IrqError::NoRoute(gsi));
            }
            self.routed.push((gsi, vector));
            Ok(())
        }

        fn unroute(&mut self, gsi: u32) {
            self.unrouted.push(gsi);
        }

        fn eoi(&mut self, vector: u8) {
            self.eois.push(vector);
        }
    }

    fn handled(_: usize) -> IrqReturn {
        IrqReturn::Handled
    }

    fn unhandled(_: usize) -> IrqReturn {
        IrqReturn::Unhandled
    }

    #[test]
    fn allocates_and_programs_a_vector() {
        let router = IrqRouter::new(FakeController::default());
        let vector = router.irq_add_handler(17, handled, 0).unwrap();
        assert_eq!(vector, IRQ_VECTOR_BASE);
        assert_eq!(router.vector_of(17), Some(vector));
        router.with_controller(|c| assert_eq!(c.routed, [(17, IRQ_VECTOR_BASE)]));
    }

    #[test]
    fn same_gsi_shares_its_vector() {
        let router = IrqRouter::new(FakeController::default());
        let a = router.irq_add_handler(11, unhandled, 1).unwrap();
        let b = router.irq_add_handler(11, handled, 2).unwrap();
        assert_eq!(a, b);
        assert_eq!(router.free_vectors(), IRQ_VECTORS - 1);
        router.with_controller(|c| assert_eq!(c.routed.len(), 1));
    }

    #[test]
    fn exhaustion_is_reported() {
        let router = IrqRouter::new(FakeController::default());
        for gsi in 0..IRQ_VECTORS as u32 {
            router.irq_add_handler(100 + gsi, handled, 0).unwrap();
        }
        assert_eq!(router.irq_add_handler(500, handled, 0), Err(IrqError::Exhausted));
    }

    #[test]
    fn failed_route_returns_the_vector() {
        let router = IrqRouter::new(FakeController::default());
        assert_eq!(router.irq_add_handler(99, handled, 0), Err(IrqError::NoRoute(99)));
        assert_eq!(router.free_vectors(), IRQ_VECTORS);
        assert_eq!(router.vector_of(99), None);
    }

    #[test]
    fn full_shared_line_is_reported() {
        let router = IrqRouter::new(FakeController::default());
        for ctx in 0..crate::MAX_SHARED {
            router.irq_add_handler(20, unhandled, ctx).unwrap();
        }
        assert_eq!(router.irq_add_handler(20, unhandled, 9), Err(IrqError::SharedLineFull(20)));
    }

    #[test]
    fn fixed_vectors_bypass_the_bitmap() {
        let router = IrqRouter::new(FakeController {
            fixed: true,
            ..Default::default()
        });
        assert_eq!(router.irq_add_handler(4, handled, 0), Ok(0x24));
        assert_eq!(router.free_vectors(), IRQ_VECTORS);
        assert!(router.irq_remove_handler(4, handled, 0));
        assert_eq!(router.free_vectors(), IRQ_VECTORS);
    }

    #[test]
    fn shared_vector_dispatches_in_registration_order() {
        static ORDER: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        fn record_unhandled(ctx: usize) -> IrqReturn {
            ORDER.lock().unwrap().push(ctx);
            IrqReturn::Unhandled
        }
        fn record_handled(ctx: usize) -> IrqReturn {
            ORDER.lock().unwrap().push(ctx);
            IrqReturn::Handled
        }

        let router = IrqRouter::new(FakeController::default());
        let vector = router.irq_add_handler(10, record_unhandled, 1).unwrap();
        router.irq_add_handler(10, record_handled, 2).unwrap();

        assert_eq!(router.irq_handle(vector), Dispatch::Handled(1));
        assert_eq!(*ORDER.lock().unwrap(), [1, 2]);
        router.with_controller(|c| assert_eq!(c.eois, [vector]));
    }

    #[test]
    fn unclaimed_interrupt_is_only_logged() {
        let router = IrqRouter::new(FakeController::default());
        let vector = router.irq_add_handler(10, unhandled, 1).unwrap();
        router.irq_add_handler(10, unhandled, 2).unwrap();
        assert_eq!(router.irq_handle(vector), Dispatch::Unhandled);
        assert_eq!(router.irq_handle(vector + 1), Dispatch::Empty);
        assert_eq!(router.irq_handle(0x90), Dispatch::Empty);
        router.with_controller(|c| assert_eq!(c.eois.len(), 3));
    }

    #[test]
    fn removing_the_last_handler_unroutes() {
        let router = IrqRouter::new(FakeController::default());
        router.irq_add_handler(30, handled, 1).unwrap();
        router.irq_add_handler(30, unhandled, 2).unwrap();

        assert!(router.irq_remove_handler(30, handled, 1));
        assert!(router.vector_of(30).is_some());
        assert!(!router.irq_remove_handler(30, handled, 1));

        assert!(router.irq_remove_handler(30, unhandled, 2));
        assert_eq!(router.vector_of(30), None);
        assert_eq!(router.free_vectors(), IRQ_VECTORS);
        router.with_controller(|c| assert_eq!(c.unrouted, [30]));
    }

    #[test]
    fn handlers_may_reenter_the_router() {
        use std::sync::OnceLock;
        static ROUTER: OnceLock<IrqRouter<FakeController>> = OnceLock::new();
        fn reentrant(_: usize) -> IrqReturn {
            ROUTER.get().unwrap().irq_add_handler(40, handled, 0).unwrap();
            IrqReturn::Handled
        }

        let router = ROUTER.get_or_init(|| IrqRouter::new(FakeController::default()));
        let vector = router.irq_add_handler(41, reentrant, 0).unwrap();
        router.irq_handle(vector);
        assert!(router.vector_of(40).is_some());
    }
}
