use crate::slave_state::SlaveState;

/// The AL control word written to register `0x0120` to request a state
/// transition.
///
/// Defined in ETG1000.6 Table 9 - AL Control Description.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct AlControl {
    /// Requested AL state.
    #[wire(bits = 4)]
    pub state: SlaveState,
    /// Error acknowledge flag.
    #[wire(bits = 1)]
    pub acknowledge: bool,
    /// ID request flag.
    #[wire(bits = 1, post_skip = 10)]
    pub id_request: bool,
}

impl AlControl {
    pub fn new(state: SlaveState) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Acknowledge a reported error while requesting `state`.
    pub fn acknowledge(state: SlaveState) -> Self {
        Self {
            state,
            acknowledge: true,
            ..Self::default()
        }
    }
}

/// The AL status word read from register `0x0130`.
///
/// Same layout as [`AlControl`], but bit 4 flags a pending error whose code
/// can be read from register `0x0134`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct AlStatus {
    /// Current AL state.
    #[wire(bits = 4)]
    pub state: SlaveState,
    /// A state change failed; the AL status code register holds the reason.
    #[wire(bits = 1)]
    pub error: bool,
    /// Device identification value is loaded.
    #[wire(bits = 1, post_skip = 10)]
    pub id_loaded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

    #[test]
    fn al_control() {
        let value = AlControl::acknowledge(SlaveState::SafeOp);

        assert_eq!(value.pack(), [0x04 | 0x10, 0x00]);
    }

    #[test]
    fn al_status_error() {
        let parsed = AlStatus::unpack_from_slice(&[0x11, 0x00]).unwrap();

        assert_eq!(parsed.state, SlaveState::Init);
        assert!(parsed.error);
    }

    #[test]
    fn unpack_short() {
        assert!(AlStatus::unpack_from_slice(&[0x04]).is_err());
    }
}
