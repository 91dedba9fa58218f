use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{hypervisor::VirtualMachine, id::VmId, network::NetworkError};

use super::state::VmState;

/// A failure delivered on a VM's error channel.
#[derive(Debug, Clone)]
pub enum VmFault {
    /// The hypervisor moved the VM into the `error` state.
    HypervisorError,
    /// The virtual network's switch died; the VM has no network any more.
    NetworkFailed(Arc<NetworkError>),
}

impl std::fmt::Display for VmFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmFault::HypervisorError => write!(f, "The hypervisor put the VM into the error state"),
            VmFault::NetworkFailed(err) => write!(f, "The VM's virtual network failed: {err}"),
        }
    }
}

/// What the relay publishes for the owning VM.
#[derive(Debug)]
pub(crate) struct RelayOutputs {
    pub state: watch::Sender<VmState>,
    pub history: Arc<Mutex<Vec<VmState>>>,
    pub overruns: Arc<AtomicU64>,
    pub faults: mpsc::UnboundedSender<VmFault>,
}

impl RelayOutputs {
    pub fn new(initial: VmState) -> (Self, watch::Receiver<VmState>, mpsc::UnboundedReceiver<VmFault>) {
        let (state, state_rx) = watch::channel(initial);
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let outputs = Self {
            state,
            history: Arc::new(Mutex::new(vec![initial])),
            overruns: Arc::new(AtomicU64::new(0)),
            faults,
        };
        (outputs, state_rx, faults_rx)
    }

    fn record(&self, vm_id: &VmId, next: VmState) {
        let previous = *self.state.borrow();
        if previous == next {
            return;
        }
        if !previous.can_transition_to(next) {
            tracing::warn!(%vm_id, from = %previous, to = %next, "hypervisor reported an unexpected state transition");
        }

        self.history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(next);
        self.state.send_replace(next);
        tracing::info!(%vm_id, from = %previous, to = %next, "vm state changed");

        if next == VmState::Error {
            let _ = self.faults.send(VmFault::HypervisorError);
        }
    }
}

/// Copy hypervisor notifications, in arrival order, into the VM's state watch and history until the VM reaches a
/// terminal state or `cancel` fires. Switch failures are forwarded to the error channel.
pub(crate) async fn run<M: VirtualMachine>(
    vm_id: VmId,
    machine: Arc<M>,
    mut states: broadcast::Receiver<VmState>,
    mut network_failure: watch::Receiver<Option<Arc<NetworkError>>>,
    outputs: RelayOutputs,
    cancel: CancellationToken,
) {
    let mut network_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = network_failure.changed(), if network_open => {
                if changed.is_err() {
                    network_open = false;
                    continue;
                }
                let failure = network_failure.borrow_and_update().clone();
                if let Some(err) = failure {
                    tracing::error!(%vm_id, error = %err, "virtual network failed");
                    let _ = outputs.faults.send(VmFault::NetworkFailed(err));
                    network_open = false;
                }
            }
            received = states.recv() => match received {
                Ok(state) => outputs.record(&vm_id, state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    outputs.overruns.fetch_add(1, Ordering::Relaxed);
                    let current = machine.current_state();
                    tracing::warn!(%vm_id, skipped, %current, "state notifications overran, re-reading the current state");
                    outputs.record(&vm_id, current);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    outputs.record(&vm_id, machine.current_state());
                    break;
                }
            },
        }

        if outputs.state.borrow().is_terminal() {
            break;
        }
    }

    tracing::debug!(%vm_id, "state relay exited");
}
