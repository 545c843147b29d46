//! Per-device S3-resume state machine (spec.md §4.9): `UNKNOWN` -> `INIT`
//! after `controller_init`, back to `UNKNOWN` after `controller_exit` (or
//! if the device was never observed locked this resume).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpalDeviceState {
    Unknown,
    Init,
    InUse,
}

impl OpalDeviceState {
    pub fn on_controller_init(self) -> Self {
        match self {
            OpalDeviceState::Unknown => OpalDeviceState::Init,
            other => other,
        }
    }

    pub fn on_unlock_issued(self) -> Self {
        match self {
            OpalDeviceState::Init => OpalDeviceState::InUse,
            other => other,
        }
    }

    pub fn on_controller_exit(self) -> Self {
        OpalDeviceState::Unknown
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_lifecycle() {
        let mut state = OpalDeviceState::Unknown;
        state = state.on_controller_init();
        assert_eq!(state, OpalDeviceState::Init);
        state = state.on_unlock_issued();
        assert_eq!(state, OpalDeviceState::InUse);
        state = state.on_controller_exit();
        assert_eq!(state, OpalDeviceState::Unknown);
    }

    #[test]
    fn exit_without_lock_returns_to_unknown() {
        let mut state = OpalDeviceState::Unknown;
        state = state.on_controller_init();
        state = state.on_controller_exit();
        assert_eq!(state, OpalDeviceState::Unknown);
    }
}
