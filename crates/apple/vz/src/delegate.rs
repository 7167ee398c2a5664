//! VM delegate feeding terminal lifecycle events into the state stream.

use crate::state::VmState;
use objc2::rc::Retained;
use objc2::{DefinedClass, MainThreadMarker, MainThreadOnly, define_class};
use objc2_foundation::{NSError, NSObject, NSObjectProtocol};
use objc2_virtualization::{VZVirtualMachine, VZVirtualMachineDelegate};
use tokio::sync::mpsc;

pub struct VmDelegateIvars {
    events: mpsc::Sender<VmState>,
}

define_class!(
    // SAFETY:
    // - NSObject has no subclassing requirements
    // - We don't implement Drop
    #[unsafe(super(NSObject))]
    #[thread_kind = MainThreadOnly]
    #[ivars = VmDelegateIvars]
    pub struct VmDelegate;

    unsafe impl NSObjectProtocol for VmDelegate {}

    unsafe impl VZVirtualMachineDelegate for VmDelegate {
        #[unsafe(method(guestDidStopVirtualMachine:))]
        fn guest_did_stop(&self, _vm: &VZVirtualMachine) {
            tracing::info!("guest stopped the VM");
            let _ = self.ivars().events.try_send(VmState::Stopped);
        }

        #[unsafe(method(virtualMachine:didStopWithError:))]
        fn vm_did_stop_with_error(&self, _vm: &VZVirtualMachine, error: &NSError) {
            tracing::error!("VM stopped with error: {}", error.localizedDescription());
            let _ = self.ivars().events.try_send(VmState::Error);
        }
    }
);

impl VmDelegate {
    pub fn new(mtm: MainThreadMarker, events: mpsc::Sender<VmState>) -> Retained<Self> {
        let this = Self::alloc(mtm);
        let this = this.set_ivars(VmDelegateIvars { events });
        // SAFETY: Calling init on a freshly allocated NSObject subclass
        unsafe { objc2::msg_send![super(this), init] }
    }
}
