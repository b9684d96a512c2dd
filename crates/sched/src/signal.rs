//! Signal numbers, sets and dispositions.

use core::fmt;

/// A signal number in `1..=31`, numbered as on Linux.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signal(u8);

impl Signal {
    pub const SIGHUP: Signal = Signal(1);
    pub const SIGINT: Signal = Signal(2);
    pub const SIGQUIT: Signal = Signal(3);
    pub const SIGILL: Signal = Signal(4);
    pub const SIGTRAP: Signal = Signal(5);
    pub const SIGABRT: Signal = Signal(6);
    pub const SIGBUS: Signal = Signal(7);
    pub const SIGFPE: Signal = Signal(8);
    pub const SIGKILL: Signal = Signal(9);
    pub const SIGUSR1: Signal = Signal(10);
    pub const SIGSEGV: Signal = Signal(11);
    pub const SIGUSR2: Signal = Signal(12);
    pub const SIGPIPE: Signal = Signal(13);
    pub const SIGALRM: Signal = Signal(14);
    pub const SIGTERM: Signal = Signal(15);
    pub const SIGSTKFLT: Signal = Signal(16);
    pub const SIGCHLD: Signal = Signal(17);
    pub const SIGCONT: Signal = Signal(18);
    pub const SIGSTOP: Signal = Signal(19);
    pub const SIGTSTP: Signal = Signal(20);
    pub const SIGTTIN: Signal = Signal(21);
    pub const SIGTTOU: Signal = Signal(22);
    pub const SIGURG: Signal = Signal(23);
    pub const SIGXCPU: Signal = Signal(24);
    pub const SIGXFSZ: Signal = Signal(25);
    pub const SIGVTALRM: Signal = Signal(26);
    pub const SIGPROF: Signal = Signal(27);
    pub const SIGWINCH: Signal = Signal(28);
    pub const SIGIO: Signal = Signal(29);
    pub const SIGPWR: Signal = Signal(30);
    pub const SIGSYS: Signal = Signal(31);

    pub const MAX: u8 = 31;

    pub const fn new(number: u8) -> Option<Signal> {
        if number >= 1 && number <= Self::MAX {
            Some(Signal(number))
        } else {
            None
        }
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    /// Neither catchable nor ignorable.
    pub const fn is_unblockable(self) -> bool {
        self.0 == Self::SIGKILL.0 || self.0 == Self::SIGSTOP.0
    }

    pub const fn default_action(self) -> DefaultAction {
        match self.0 {
            17 | 23 | 28 => DefaultAction::Ignore,
            18 => DefaultAction::Continue,
            19..=22 => DefaultAction::Stop,
            _ => DefaultAction::Terminate,
        }
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signal({})", self.0)
    }
}

/// What happens to a signal nobody installed a handler for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultAction {
    Terminate,
    Ignore,
    /// Job control is not implemented; stopping terminates.
    Stop,
    Continue,
}

/// A set of signals, bit `n` for signal `n`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSet(u32);

impl SignalSet {
    pub const EMPTY: SignalSet = SignalSet(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & !1)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn insert(&mut self, signal: Signal) {
        self.0 |= 1 << signal.0;
    }

    pub fn remove(&mut self, signal: Signal) {
        self.0 &= !(1 << signal.0);
    }

    pub fn contains(self, signal: Signal) -> bool {
        self.0 & (1 << signal.0) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: SignalSet) -> SignalSet {
        SignalSet(self.0 | other.0)
    }

    pub fn difference(self, other: SignalSet) -> SignalSet {
        SignalSet(self.0 & !other.0)
    }

    /// Lowest-numbered member.
    pub fn first(self) -> Option<Signal> {
        (self.0 != 0).then(|| Signal(self.0.trailing_zeros() as u8))
    }
}

impl From<Signal> for SignalSet {
    fn from(signal: Signal) -> Self {
        SignalSet(1 << signal.0)
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries((1..=Signal::MAX).filter(|n| self.0 & (1 << n) != 0))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SigHandler {
    #[default]
    Default,
    Ignore,
    /// User-space entry point.
    Handler(u64),
}

/// One entry of a process's disposition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigAction {
    pub handler: SigHandler,
    /// Blocked in addition to the signal itself while the handler runs.
    pub mask: SignalSet,
    /// Return address pushed for the handler; it must issue `sigreturn`.
    pub restorer: u64,
}

impl SigAction {
    /// Raw `sigaction` argument encoding: 0 is default, 1 is ignore,
    /// anything else is a handler address.
    pub fn from_raw(handler: u64, mask: u32, restorer: u64) -> Self {
        let handler = match handler {
            0 => SigHandler::Default,
            1 => SigHandler::Ignore,
            addr => SigHandler::Handler(addr),
        };
        Self {
            handler,
            mask: SignalSet::from_bits(mask),
            restorer,
        }
    }

    pub fn raw_handler(&self) -> u64 {
        match self.handler {
            SigHandler::Default => 0,
            SigHandler::Ignore => 1,
            SigHandler::Handler(addr) => addr,
        }
    }
}

/// What delivering a signal amounts to, given its disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Discard,
    Terminate,
    RunHandler(SigAction),
}

pub fn resolve(signal: Signal, action: &SigAction) -> Delivery {
    if signal == Signal::SIGKILL || signal == Signal::SIGSTOP {
        return Delivery::Terminate;
    }
    match action.handler {
        SigHandler::Ignore => Delivery::Discard,
        SigHandler::Handler(_) => Delivery::RunHandler(*action),
        SigHandler::Default => match signal.default_action() {
            DefaultAction::Terminate | DefaultAction::Stop => Delivery::Terminate,
            DefaultAction::Ignore | DefaultAction::Continue => Delivery::Discard,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_are_bounded() {
        assert_eq!(Signal::new(0), None);
        assert_eq!(Signal::new(32), None);
        assert_eq!(Signal::new(9), Some(Signal::SIGKILL));
    }

    #[test]
    fn first_is_lowest_numbered() {
        let mut set = SignalSet::EMPTY;
        set.insert(Signal::SIGTERM);
        set.insert(Signal::SIGINT);
        set.insert(Signal::SIGSYS);
        assert_eq!(set.first(), Some(Signal::SIGINT));
        set.remove(Signal::SIGINT);
        assert_eq!(set.first(), Some(Signal::SIGTERM));
        assert_eq!(SignalSet::EMPTY.first(), None);
    }

    #[test]
    fn bit_zero_is_never_a_member() {
        assert!(SignalSet::from_bits(1).is_empty());
        assert_eq!(format!("{:?}", SignalSet::from_bits(0b110)), "{1, 2}");
    }

    #[test]
    fn default_actions() {
        assert_eq!(Signal::SIGCHLD.default_action(), DefaultAction::Ignore);
        assert_eq!(Signal::SIGCONT.default_action(), DefaultAction::Continue);
        assert_eq!(Signal::SIGTSTP.default_action(), DefaultAction::Stop);
        assert_eq!(Signal::SIGSEGV.default_action(), DefaultAction::Terminate);
    }

    #[test]
    fn dispositions_resolve() {
        let ignore = SigAction::from_raw(1, 0, 0);
        let handle = SigAction::from_raw(0x40_1000, 0, 0x40_2000);
        assert_eq!(resolve(Signal::SIGTERM, &SigAction::default()), Delivery::Terminate);
        assert_eq!(resolve(Signal::SIGCHLD, &SigAction::default()), Delivery::Discard);
        assert_eq!(resolve(Signal::SIGTERM, &ignore), Delivery::Discard);
        assert_eq!(resolve(Signal::SIGUSR1, &handle), Delivery::RunHandler(handle));
        assert_eq!(resolve(Signal::SIGKILL, &handle), Delivery::Terminate);
    }

    #[test]
    fn raw_handler_round_trips() {
        let action = SigAction::from_raw(0x40_1000, 1 << 2, 0);
        assert_eq!(action.raw_handler(), 0x40_1000);
        assert!(action.mask.contains(Signal::SIGINT));
    }
}
