//! S3-resume replay engine (spec.md §4.8): for every known device, bring up
//! its transport, query and clear Opal locking, optionally enable BlockSid,
//! then tear everything back down — one device's failure never stops the
//! rest. Ground truth for the "every device gets an attempt" loop is
//! `OpalPasswordSmm.c`'s controller-list walk (see DESIGN.md).

use heapless::Vec;

use super::device::{OpalDeviceKind, OpalSmmDevice, SmmDeviceList, MAX_BRIDGE_HOPS};
use super::error::OpalError;
use super::pci::{close_bridge_path, open_bridge_path, BridgeSnapshot, PciConfigIo};
use super::session::{OpalSessionHelper, SupportedAttributes};
use super::transport::{OpalTrustedIo, TransportHandle};
use super::variable::OpalExtraInfoVariable;
use crate::time::PlatformClock;

/// Bridge memory window reserved to reach an NVMe endpoint during replay;
/// generously oversized relative to the fixed NVMe register BAR (spec.md §4.7).
const NVME_BAR_WINDOW_SIZE: u32 = 0x0001_0000;

/// Per-device hardware access the replay engine needs but does not own
/// itself: transport contexts are platform resources constructed by the
/// firmware glue around this crate, not by `replay::run`.
pub trait ReplayHost {
    fn transport_for<'a>(&'a mut self, device: &OpalSmmDevice) -> TransportHandle<'a>;
    fn session<'a>(&'a mut self, device: &OpalSmmDevice) -> &'a mut dyn OpalSessionHelper;
}

/// spec.md §6's produced storage-security command surface, attached to
/// `device` by binding whichever transport `host` currently has wired up
/// for it. A TCG session-layer implementation sitting above this core is
/// the intended caller; `replay::run` itself only needs `ReplayHost::session`.
pub fn storage_security_for<'a, C: PlatformClock>(
    host: &'a mut impl ReplayHost,
    device: &OpalSmmDevice,
    clock: &'a C,
) -> OpalTrustedIo<'a, 'a, C> {
    OpalTrustedIo::new(host.transport_for(device), clock)
}

/// spec.md §4.8: "Failures... are reported but do not abort the rest of the
/// list" — a caller inspects this instead of a bare `Result` to tell partial
/// success from total failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub attempted: usize,
    pub unlocked: usize,
    pub failed: usize,
}

/// Run the S3-resume unlock pass over every device in `devices`.
pub fn run<C: PlatformClock>(
    devices: &mut SmmDeviceList,
    pci: &impl PciConfigIo,
    clock: &C,
    extra_info: &impl OpalExtraInfoVariable,
    host: &mut impl ReplayHost,
) -> ReplaySummary {
    let mut summary = ReplaySummary::default();

    for device in devices.devices_mut() {
        summary.attempted += 1;
        match try_unlock_one(device, pci, clock, extra_info, host) {
            Ok(true) => summary.unlocked += 1,
            Ok(false) => {}
            Err(_) => summary.failed += 1,
        }
    }

    summary
}

fn try_unlock_one<C: PlatformClock>(
    device: &mut OpalSmmDevice,
    pci: &impl PciConfigIo,
    clock: &C,
    extra_info: &impl OpalExtraInfoVariable,
    host: &mut impl ReplayHost,
) -> Result<bool, OpalError> {
    device.state = device.state.on_controller_init();

    let mut bridge_snapshots: Vec<BridgeSnapshot, MAX_BRIDGE_HOPS> = Vec::new();
    if matches!(device.kind, OpalDeviceKind::Nvme { .. }) && !device.bridge_chain.is_empty() {
        let bar = match host.transport_for(device) {
            TransportHandle::Nvme(ctx) => ctx.mmio_base as u32,
            _ => 0,
        };
        bridge_snapshots =
            open_bridge_path(pci, &device.bridge_chain, device.bdf.bus, bar, NVME_BAR_WINDOW_SIZE)?;
    }

    let bring_up = match host.transport_for(device) {
        TransportHandle::Ahci(ctx) => super::ahci::port_init(ctx, clock),
        TransportHandle::Nvme(ctx) => {
            let nsid = match device.kind {
                OpalDeviceKind::Nvme { nsid } => nsid,
                _ => 1,
            };
            ctx.init(clock, nsid)
        }
        TransportHandle::Ide(_) => Ok(()),
    };

    let result = bring_up.and_then(|()| unlock_and_block_sid(device, extra_info, host));

    close_bridge_path(pci, &bridge_snapshots);
    device.state = device.state.on_controller_exit();

    result
}

/// Steps 3-4 of spec.md §4.8: query locking state, unlock if locked, and
/// opt-in BlockSid if the caller has asked for it via the persisted variable.
fn unlock_and_block_sid(
    device: &mut OpalSmmDevice,
    extra_info: &impl OpalExtraInfoVariable,
    host: &mut impl ReplayHost,
) -> Result<bool, OpalError> {
    let locking = host.session(device).get_locking_info()?;

    let mut unlocked = false;
    if locking.locked {
        host.session(device).unlock(&device.password)?;
        device.state = device.state.on_unlock_issued();
        unlocked = true;
    }

    if extra_info.read_enable_block_sid() {
        let attrs = host.session(device).get_supported_attributes()?;
        if attrs.contains(SupportedAttributes::BLOCK_SID) {
            host.session(device).block_sid(true)?;
        }
    }

    Ok(unlocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opal::device::PciAddress;
    use crate::opal::ide::IdeContext;
    use crate::opal::session::LockingInfo;
    use crate::opal::state::OpalDeviceState;
    use core::cell::Cell;

    struct NoopClock;
    impl PlatformClock for NoopClock {
        fn monotonic_us(&self) -> u64 {
            0
        }
        fn stall_us(&self, _microseconds: u64) {}
    }

    struct NoopPci;
    impl PciConfigIo for NoopPci {
        fn read8(&self, _addr: PciAddress, _offset: u16) -> u8 {
            0
        }
        fn read16(&self, _addr: PciAddress, _offset: u16) -> u16 {
            0
        }
        fn read32(&self, _addr: PciAddress, _offset: u16) -> u32 {
            0
        }
        fn write8(&self, _addr: PciAddress, _offset: u16, _value: u8) {}
        fn write16(&self, _addr: PciAddress, _offset: u16, _value: u16) {}
        fn write32(&self, _addr: PciAddress, _offset: u16, _value: u32) {}
    }

    struct FixedExtraInfo(bool);
    impl OpalExtraInfoVariable for FixedExtraInfo {
        fn read_enable_block_sid(&self) -> bool {
            self.0
        }
    }

    struct FakeSession {
        locked: bool,
        unlock_calls: Cell<u32>,
        fail_unlock: bool,
    }
    impl OpalSessionHelper for FakeSession {
        fn get_supported_attributes(&self) -> Result<SupportedAttributes, OpalError> {
            Ok(SupportedAttributes::LOCKING)
        }
        fn get_locking_info(&self) -> Result<LockingInfo, OpalError> {
            Ok(LockingInfo {
                locked: self.locked,
                locking_enabled: true,
                media_encryption: true,
            })
        }
        fn unlock(&self, _password: &[u8]) -> Result<(), OpalError> {
            self.unlock_calls.set(self.unlock_calls.get() + 1);
            if self.fail_unlock {
                Err(OpalError::DeviceError)
            } else {
                Ok(())
            }
        }
        fn block_sid(&self, _enable: bool) -> Result<(), OpalError> {
            Ok(())
        }
    }

    struct IdeOnlyHost {
        ide: IdeContext,
        session: FakeSession,
    }
    impl ReplayHost for IdeOnlyHost {
        fn transport_for<'a>(&'a mut self, _device: &OpalSmmDevice) -> TransportHandle<'a> {
            TransportHandle::Ide(&mut self.ide)
        }
        fn session<'a>(&'a mut self, _device: &OpalSmmDevice) -> &'a mut dyn OpalSessionHelper {
            &mut self.session
        }
    }

    fn sample_device() -> OpalSmmDevice {
        OpalSmmDevice::new(
            PciAddress { bus: 0, device: 3, function: 0 },
            OpalDeviceKind::Ide { port: 0 },
        )
    }

    #[test]
    fn locked_device_gets_unlocked_and_counted() {
        let mut devices = SmmDeviceList::new();
        devices.seed_once(&[sample_device()]).unwrap();
        let mut host = IdeOnlyHost {
            ide: IdeContext { command_block: 0x1F0, control_block: 0x3F6, port: 0 },
            session: FakeSession { locked: true, unlock_calls: Cell::new(0), fail_unlock: false },
        };
        let summary = run(&mut devices, &NoopPci, &NoopClock, &FixedExtraInfo(false), &mut host);
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.unlocked, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(host.session.unlock_calls.get(), 1);
        assert_eq!(devices.devices()[0].state, OpalDeviceState::Unknown);
    }

    #[test]
    fn unlock_failure_is_reported_without_aborting_other_devices() {
        let mut devices = SmmDeviceList::new();
        devices.seed_once(&[sample_device(), sample_device()]).unwrap();
        let mut host = IdeOnlyHost {
            ide: IdeContext { command_block: 0x1F0, control_block: 0x3F6, port: 0 },
            session: FakeSession { locked: true, unlock_calls: Cell::new(0), fail_unlock: true },
        };
        let summary = run(&mut devices, &NoopPci, &NoopClock, &FixedExtraInfo(false), &mut host);
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(host.session.unlock_calls.get(), 2, "every device must still get an attempt");
    }

    #[test]
    fn unlocked_device_is_left_alone() {
        let mut devices = SmmDeviceList::new();
        devices.seed_once(&[sample_device()]).unwrap();
        let mut host = IdeOnlyHost {
            ide: IdeContext { command_block: 0x1F0, control_block: 0x3F6, port: 0 },
            session: FakeSession { locked: false, unlock_calls: Cell::new(0), fail_unlock: false },
        };
        let summary = run(&mut devices, &NoopPci, &NoopClock, &FixedExtraInfo(false), &mut host);
        assert_eq!(summary.unlocked, 0);
        assert_eq!(host.session.unlock_calls.get(), 0);
    }

    #[test]
    fn storage_security_is_attached_to_the_devices_transport() {
        use crate::opal::error::OpalError;
        use crate::opal::transport::{StorageSecurityCommand, MAX_SEND_PAYLOAD_BYTES};

        let mut host = IdeOnlyHost {
            ide: IdeContext { command_block: 0x1F0, control_block: 0x3F6, port: 0 },
            session: FakeSession { locked: false, unlock_calls: Cell::new(0), fail_unlock: false },
        };
        let device = sample_device();
        let mut security = storage_security_for(&mut host, &device, &NoopClock);

        let oversized = [0u8; MAX_SEND_PAYLOAD_BYTES + 1];
        assert_eq!(security.send_data(0x01, 0x0000, &oversized), Err(OpalError::OutOfResources));
    }
}
