//! Opal session helper collaborator (spec.md §6): full TCG/Opal session
//! negotiation is out of scope for this core, which only invokes a
//! supplied helper for the handful of operations S3 replay needs.

use super::error::OpalError;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SupportedAttributes: u32 {
        const LOCKING        = 1 << 0;
        const BLOCK_SID      = 1 << 1;
        const GEOMETRY_REPORTING = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockingInfo {
    pub locked: bool,
    pub locking_enabled: bool,
    pub media_encryption: bool,
}

pub trait OpalSessionHelper {
    fn get_supported_attributes(&self) -> Result<SupportedAttributes, OpalError>;

    fn get_locking_info(&self) -> Result<LockingInfo, OpalError>;

    fn unlock(&self, password: &[u8]) -> Result<(), OpalError>;

    fn block_sid(&self, enable: bool) -> Result<(), OpalError>;
}
