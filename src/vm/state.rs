/// The lifecycle state of a VM, as reported by the hypervisor.
///
/// `Stopped` and `Error` are terminal. [VmState::can_transition_to] encodes every legal edge; anything else a
/// hypervisor reports is logged as a warning and still recorded by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmState {
    Unknown,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Stopped,
    Error,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Unknown => write!(f, "unknown"),
            VmState::Starting => write!(f, "starting"),
            VmState::Running => write!(f, "running"),
            VmState::Pausing => write!(f, "pausing"),
            VmState::Paused => write!(f, "paused"),
            VmState::Resuming => write!(f, "resuming"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Error => write!(f, "error"),
        }
    }
}

impl VmState {
    pub const ALL: [VmState; 9] = [
        VmState::Unknown,
        VmState::Starting,
        VmState::Running,
        VmState::Pausing,
        VmState::Paused,
        VmState::Resuming,
        VmState::Stopping,
        VmState::Stopped,
        VmState::Error,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, VmState::Stopped | VmState::Error)
    }

    pub fn can_transition_to(&self, next: VmState) -> bool {
        use VmState::*;

        match (self, next) {
            (Unknown, Starting | Error) => true,
            (Starting, Running | Stopping | Stopped | Error) => true,
            (Running, Pausing | Stopping | Stopped | Error) => true,
            (Pausing, Paused | Running | Error) => true,
            (Paused, Resuming | Stopping | Stopped | Error) => true,
            (Resuming, Running | Paused | Error) => true,
            (Stopping, Stopped | Error) => true,
            _ => false,
        }
    }

    /// Whether every consecutive pair of `states` is a legal transition.
    pub fn is_legal_path(states: &[VmState]) -> bool {
        states.windows(2).all(|pair| pair[0].can_transition_to(pair[1]))
    }
}
