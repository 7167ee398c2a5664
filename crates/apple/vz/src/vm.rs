//! VM construction and the thread-safe handle over it.
//!
//! Virtualization.framework objects must be touched from the main thread;
//! every operation here marshals onto it with `run_on_main` and hands
//! results back over channels.

use crate::delegate::VmDelegate;
use crate::device::{Device, VmSpec};
use crate::error::{Result, VzError};
use crate::state::{Capabilities, VmState};
use block2::RcBlock;
use dispatch2::{MainThreadBound, run_on_main};
use objc2::AnyThread;
use objc2::rc::Retained;
use objc2::runtime::ProtocolObject;
use objc2_foundation::{NSArray, NSError, NSFileHandle, NSString, NSURL};
use objc2_virtualization::{
    VZDiskImageStorageDeviceAttachment, VZEntropyDeviceConfiguration,
    VZFileHandleSerialPortAttachment, VZLinuxBootLoader, VZSerialPortConfiguration,
    VZSharedDirectory, VZSingleDirectoryShare, VZSocketDeviceConfiguration,
    VZStorageDeviceConfiguration, VZVirtioBlockDeviceConfiguration,
    VZVirtioConsoleDeviceSerialPortConfiguration, VZVirtioEntropyDeviceConfiguration,
    VZVirtioFileSystemDeviceConfiguration, VZVirtioSocketDeviceConfiguration, VZVirtualMachine,
    VZVirtualMachineConfiguration,
};
use std::os::fd::IntoRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

const STATE_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);
const STATE_CHANNEL_DEPTH: usize = 8;

/// Shared handle to a created VM. Clones refer to the same machine.
#[derive(Clone)]
pub struct VmHandle {
    inner: Arc<Inner>,
}

struct Inner {
    vm: Option<MainThreadBound<Retained<VZVirtualMachine>>>,
    delegate: Option<MainThreadBound<Retained<VmDelegate>>>,
    events: mpsc::Sender<VmState>,
    events_rx: std::sync::Mutex<Option<mpsc::Receiver<VmState>>>,
}

impl VmHandle {
    /// Builds the device graph, validates the configuration, and
    /// instantiates the VM. Runs on the main thread.
    pub fn create(spec: &VmSpec) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::channel(STATE_CHANNEL_DEPTH);
        let delegate_events = events_tx.clone();
        let spec = spec.clone();

        let (vm, delegate) = run_on_main(move |mtm| create_on_main(mtm, &spec, delegate_events))?;

        Ok(Self {
            inner: Arc::new(Inner {
                vm: Some(vm),
                delegate: Some(delegate),
                events: events_tx,
                events_rx: std::sync::Mutex::new(Some(events_rx)),
            }),
        })
    }

    /// The state transition stream. Can be taken once; fed by the
    /// sampler, the delegate, and resume().
    pub fn take_events(&self) -> Option<mpsc::Receiver<VmState>> {
        self.inner.events_rx.lock().ok()?.take()
    }

    /// Publishes distinct state samples onto the event stream until
    /// cancelled.
    pub fn spawn_state_sampler(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            let mut last = handle.state();
            let mut interval = tokio::time::interval(STATE_SAMPLE_INTERVAL);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }

                let state = handle.state();
                if state != last {
                    tracing::info!("VM state changed: {state}");
                    last = state;
                    if handle.inner.events.send(state).await.is_err() {
                        return;
                    }
                }
            }
        })
    }

    pub fn state(&self) -> VmState {
        self.on_vm(|vm| {
            // SAFETY: main thread, valid VM object.
            unsafe { VmState::from(vm.state()) }
        })
    }

    pub fn capabilities(&self) -> Capabilities {
        self.on_vm(|vm| {
            // SAFETY: main thread, valid VM object.
            unsafe {
                Capabilities {
                    can_start: vm.canStart(),
                    can_request_stop: vm.canRequestStop(),
                    can_stop: vm.canStop(),
                    can_pause: vm.canPause(),
                    can_resume: vm.canResume(),
                }
            }
        })
    }

    pub async fn start(&self) -> Result<()> {
        self.completion_op(
            |vm, handler| {
                // SAFETY: main thread; the completion handler is retained
                // by the Objective-C runtime.
                unsafe { vm.startWithCompletionHandler(handler) }
            },
            VzError::StartFailed,
        )
        .await
    }

    /// Forceful stop.
    pub async fn stop(&self) -> Result<()> {
        self.completion_op(
            |vm, handler| {
                // SAFETY: see start().
                unsafe { vm.stopWithCompletionHandler(handler) }
            },
            VzError::StopFailed,
        )
        .await
    }

    pub async fn pause(&self) -> Result<()> {
        self.completion_op(
            |vm, handler| {
                // SAFETY: see start().
                unsafe { vm.pauseWithCompletionHandler(handler) }
            },
            VzError::PauseFailed,
        )
        .await
    }

    pub async fn resume(&self) -> Result<()> {
        // The sampler can miss a fast resume, and time resync hangs off
        // this transition, so publish it ourselves.
        let _ = self.inner.events.try_send(VmState::Resuming);

        self.completion_op(
            |vm, handler| {
                // SAFETY: see start().
                unsafe { vm.resumeWithCompletionHandler(handler) }
            },
            VzError::ResumeFailed,
        )
        .await
    }

    /// Graceful stop request, allowed only when the guest can receive it.
    pub fn request_stop(&self) -> Result<()> {
        self.on_vm(|vm| {
            // SAFETY: main thread, valid VM object.
            unsafe {
                if !vm.canRequestStop() {
                    return Err(VzError::RequestStopFailed(
                        "not allowed in current state".to_string(),
                    ));
                }
                vm.requestStopWithError().map_err(|e| {
                    VzError::RequestStopFailed(e.localizedDescription().to_string())
                })
            }
        })
    }

    /// Runs `f` with the VM object on the main thread.
    pub(crate) fn on_vm<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Retained<VZVirtualMachine>) -> R + Send,
        R: Send,
    {
        let inner = self.inner.clone();
        run_on_main(move |mtm| {
            let vm = inner
                .vm
                .as_ref()
                .expect("VM is present until the handle drops")
                .get(mtm);
            f(vm)
        })
    }

    async fn completion_op<F>(&self, op: F, wrap: fn(String) -> VzError) -> Result<()>
    where
        F: FnOnce(&Retained<VZVirtualMachine>, &RcBlock<dyn Fn(*mut NSError)>) + Send,
    {
        let (tx, rx) = oneshot::channel::<std::result::Result<(), String>>();

        self.on_vm(move |vm| {
            let tx = std::sync::Mutex::new(Some(tx));
            let handler = RcBlock::new(move |error: *mut NSError| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    if error.is_null() {
                        let _ = tx.send(Ok(()));
                    } else {
                        // SAFETY: non-null error points to a valid NSError
                        // per the framework contract.
                        let message = unsafe { (*error).localizedDescription().to_string() };
                        let _ = tx.send(Err(message));
                    }
                }
            });

            // The Objective-C runtime retains the handler; we cannot know
            // when it releases it.
            std::mem::forget(handler.clone());

            op(vm, &handler);
        });

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(wrap(message)),
            Err(_) => Err(wrap("completion handler dropped".to_string())),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let vm = self.vm.take();
        let delegate = self.delegate.take();

        if vm.is_some() || delegate.is_some() {
            run_on_main(move |mtm| {
                if let Some(vm) = vm {
                    let vm = vm.into_inner(mtm);
                    // SAFETY: clearing the delegate before it drops
                    // prevents a callback into a freed object.
                    unsafe { vm.setDelegate(None) };
                }
                if let Some(delegate) = delegate {
                    drop(delegate.into_inner(mtm));
                }
            });
        }
    }
}

type BoundVm = MainThreadBound<Retained<VZVirtualMachine>>;
type BoundDelegate = MainThreadBound<Retained<VmDelegate>>;

fn create_on_main(
    mtm: objc2::MainThreadMarker,
    spec: &VmSpec,
    delegate_events: mpsc::Sender<VmState>,
) -> Result<(BoundVm, BoundDelegate)> {
    let config = build_config(spec)?;

    // SAFETY: Objective-C FFI against Virtualization.framework on the
    // main thread; all objects are used per their API contracts and
    // retained by the returned handles.
    unsafe {
        config
            .validateWithError()
            .map_err(|e| VzError::InvalidVmConfig(e.localizedDescription().to_string()))?;

        let vm = VZVirtualMachine::initWithConfiguration(VZVirtualMachine::alloc(), &config);

        let delegate = VmDelegate::new(mtm, delegate_events);
        vm.setDelegate(Some(ProtocolObject::from_ref(&*delegate)));

        Ok((
            MainThreadBound::new(vm, mtm),
            MainThreadBound::new(delegate, mtm),
        ))
    }
}

fn build_config(spec: &VmSpec) -> Result<Retained<VZVirtualMachineConfiguration>> {
    let path_str = |p: &std::path::Path| {
        p.to_str()
            .map(str::to_owned)
            .ok_or_else(|| VzError::InvalidPath(p.to_path_buf()))
    };

    // SAFETY: Objective-C FFI; all objects are used per their API
    // contracts and ownership stays with the returned configuration.
    unsafe {
        let config = VZVirtualMachineConfiguration::new();

        let kernel_url = NSURL::fileURLWithPath(&NSString::from_str(&path_str(&spec.kernel)?));
        let boot_loader =
            VZLinuxBootLoader::initWithKernelURL(VZLinuxBootLoader::alloc(), &kernel_url);
        let initrd_url = NSURL::fileURLWithPath(&NSString::from_str(&path_str(&spec.initrd)?));
        boot_loader.setInitialRamdiskURL(Some(&initrd_url));
        boot_loader.setCommandLine(&NSString::from_str(&spec.cmdline));
        config.setBootLoader(Some(&boot_loader));

        config.setCPUCount(spec.cpus as usize);
        config.setMemorySize(spec.memory_bytes);

        let mut storage: Vec<Retained<VZStorageDeviceConfiguration>> = Vec::new();
        let mut sharing: Vec<Retained<VZVirtioFileSystemDeviceConfiguration>> = Vec::new();
        let mut serial: Vec<Retained<VZSerialPortConfiguration>> = Vec::new();
        let mut entropy: Vec<Retained<VZEntropyDeviceConfiguration>> = Vec::new();
        let mut want_vsock = false;

        for device in &spec.devices {
            match device {
                Device::Block { path, read_only } => {
                    let url = NSURL::fileURLWithPath(&NSString::from_str(&path_str(path)?));
                    let attachment = VZDiskImageStorageDeviceAttachment::initWithURL_readOnly_error(
                        VZDiskImageStorageDeviceAttachment::alloc(),
                        &url,
                        *read_only,
                    )
                    .map_err(|e| {
                        VzError::InvalidVmConfig(format!(
                            "disk attachment {}: {}",
                            path.display(),
                            e.localizedDescription()
                        ))
                    })?;

                    let block = VZVirtioBlockDeviceConfiguration::initWithAttachment(
                        VZVirtioBlockDeviceConfiguration::alloc(),
                        &attachment,
                    );
                    storage.push(Retained::into_super(block));
                }
                Device::Vsock { .. } => {
                    // All vsock ports share one virtio-socket device;
                    // listeners are attached per port after creation.
                    want_vsock = true;
                }
                Device::Fs { tag, share_dir } => {
                    let url = NSURL::fileURLWithPath(&NSString::from_str(&path_str(share_dir)?));
                    let dir = VZSharedDirectory::initWithURL_readOnly(
                        VZSharedDirectory::alloc(),
                        &url,
                        false,
                    );
                    let share =
                        VZSingleDirectoryShare::initWithDirectory(VZSingleDirectoryShare::alloc(), &dir);

                    let fs = VZVirtioFileSystemDeviceConfiguration::initWithTag(
                        VZVirtioFileSystemDeviceConfiguration::alloc(),
                        &NSString::from_str(tag),
                    );
                    fs.setShare(Some(&share));
                    sharing.push(fs);
                }
                Device::SerialStdio => {
                    let attachment =
                        VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                            VZFileHandleSerialPortAttachment::alloc(),
                            Some(&NSFileHandle::fileHandleWithStandardInput()),
                            Some(&NSFileHandle::fileHandleWithStandardOutput()),
                        );
                    let port = VZVirtioConsoleDeviceSerialPortConfiguration::new();
                    port.setAttachment(Some(&attachment));
                    serial.push(Retained::into_super(Retained::into_super(port)));
                }
                Device::SerialFile { path } => {
                    let file = std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)?;
                    // NSFileHandle takes ownership of the descriptor.
                    let handle = NSFileHandle::initWithFileDescriptor(
                        NSFileHandle::alloc(),
                        file.into_raw_fd(),
                    );
                    let attachment =
                        VZFileHandleSerialPortAttachment::initWithFileHandleForReading_fileHandleForWriting(
                            VZFileHandleSerialPortAttachment::alloc(),
                            None,
                            Some(&handle),
                        );
                    let port = VZVirtioConsoleDeviceSerialPortConfiguration::new();
                    port.setAttachment(Some(&attachment));
                    serial.push(Retained::into_super(Retained::into_super(port)));
                }
                Device::Rng => {
                    let rng = VZVirtioEntropyDeviceConfiguration::new();
                    entropy.push(Retained::into_super(rng));
                }
            }
        }

        if !storage.is_empty() {
            let array: Retained<NSArray<VZStorageDeviceConfiguration>> =
                NSArray::from_retained_slice(&storage);
            config.setStorageDevices(&array);
        }

        if want_vsock {
            let vsock = VZVirtioSocketDeviceConfiguration::new();
            let array: Retained<NSArray<VZSocketDeviceConfiguration>> =
                NSArray::from_retained_slice(&[Retained::into_super(vsock)]);
            config.setSocketDevices(&array);
        }

        if !sharing.is_empty() {
            let upcast: Vec<_> = sharing.into_iter().map(Retained::into_super).collect();
            let array = NSArray::from_retained_slice(&upcast);
            config.setDirectorySharingDevices(&array);
        }

        if !serial.is_empty() {
            let array: Retained<NSArray<VZSerialPortConfiguration>> =
                NSArray::from_retained_slice(&serial);
            config.setSerialPorts(&array);
        }

        if !entropy.is_empty() {
            let array: Retained<NSArray<VZEntropyDeviceConfiguration>> =
                NSArray::from_retained_slice(&entropy);
            config.setEntropyDevices(&array);
        }

        Ok(config)
    }
}
