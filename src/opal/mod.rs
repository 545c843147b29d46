//! Opal/TCG self-encrypting-drive unlock core: the S3-resume replay engine
//! and the three storage transports it drives (spec.md §1, §4.5-§4.9).

pub mod ahci;
pub mod device;
pub mod error;
pub mod ide;
pub mod nvme;
pub mod pci;
pub mod replay;
pub mod session;
pub mod state;
pub mod transport;
pub mod variable;

pub use device::{OpalDeviceKind, OpalSmmDevice, PciAddress, SmmDeviceList};
pub use error::OpalError;
pub use replay::{storage_security_for, ReplayHost, ReplaySummary};
pub use session::OpalSessionHelper;
pub use state::OpalDeviceState;
pub use transport::{OpalTrustedIo, StorageSecurityCommand, TransportHandle, TrustedIoDirection};
pub use variable::OpalExtraInfoVariable;
