/// AL (application layer) state for a single slave device.
///
/// Read from register `0x0130`
/// ([`RegisterAddress::AlStatus`](crate::register::RegisterAddress::AlStatus)).
///
/// Defined in ETG1000.6 6.4.1, ETG1000.6 Table 9.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[repr(u8)]
pub enum SlaveState {
    /// No state recorded/read/known.
    #[default]
    None = 0x00,
    /// EtherCAT `INIT` state.
    Init = 0x01,
    /// EtherCAT `PRE-OP` state.
    PreOp = 0x02,
    /// EtherCAT `BOOT` state, entered from `INIT` only, e.g. for FoE firmware
    /// download.
    Bootstrap = 0x03,
    /// EtherCAT `SAFE-OP` state.
    SafeOp = 0x04,
    /// EtherCAT `OP` state.
    Op = 0x08,
    /// State is a combination of the above variants or an unknown value.
    #[wire(catch_all)]
    Other(u8),
}

impl SlaveState {
    /// The next state on the ordered bring-up path towards `target`, or
    /// `None` if this state already is the target (or no path exists).
    ///
    /// AL transitions go strictly one hop at a time: `INIT` → `PRE-OP` →
    /// `SAFE-OP` → `OP`. `BOOT` is only reachable from `INIT`. Any state may
    /// fall back to a lower one directly.
    pub(crate) fn next_towards(self, target: SlaveState) -> Option<SlaveState> {
        if self == target {
            return None;
        }

        Some(match (self, target) {
            // Downward transitions are always allowed in one hop
            (_, SlaveState::Init) => SlaveState::Init,
            // BOOT is only reachable from INIT, and leaving it goes back
            // through INIT too
            (SlaveState::Init, SlaveState::Bootstrap) => SlaveState::Bootstrap,
            (_, SlaveState::Bootstrap) => SlaveState::Init,
            (SlaveState::Bootstrap, _) => SlaveState::Init,
            (SlaveState::Init, _) => SlaveState::PreOp,
            (SlaveState::PreOp, _) => SlaveState::SafeOp,
            (SlaveState::SafeOp, SlaveState::Op) => SlaveState::Op,
            (SlaveState::SafeOp, other) => other,
            (SlaveState::Op, other) => other,
            // Unknown current state: drop to INIT and start over
            (SlaveState::None | SlaveState::Other(_), _) => SlaveState::Init,
        })
    }

    /// True for `SAFE-OP` and `OP`, the states in which inputs are valid.
    pub fn is_exchanging_process_data(self) -> bool {
        matches!(self, SlaveState::SafeOp | SlaveState::Op)
    }
}

impl core::fmt::Display for SlaveState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SlaveState::None => f.write_str("None"),
            SlaveState::Init => f.write_str("Init"),
            SlaveState::PreOp => f.write_str("Pre-Operational"),
            SlaveState::Bootstrap => f.write_str("Bootstrap"),
            SlaveState::SafeOp => f.write_str("Safe-Operational"),
            SlaveState::Op => f.write_str("Operational"),
            SlaveState::Other(value) => write!(f, "Other({:01x})", value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_path_up() {
        assert_eq!(
            SlaveState::Init.next_towards(SlaveState::Op),
            Some(SlaveState::PreOp)
        );
        assert_eq!(
            SlaveState::PreOp.next_towards(SlaveState::Op),
            Some(SlaveState::SafeOp)
        );
        assert_eq!(
            SlaveState::SafeOp.next_towards(SlaveState::Op),
            Some(SlaveState::Op)
        );
        assert_eq!(SlaveState::Op.next_towards(SlaveState::Op), None);
    }

    #[test]
    fn fall_back_is_direct() {
        assert_eq!(
            SlaveState::Op.next_towards(SlaveState::Init),
            Some(SlaveState::Init)
        );
        assert_eq!(
            SlaveState::SafeOp.next_towards(SlaveState::PreOp),
            Some(SlaveState::PreOp)
        );
    }

    #[test]
    fn boot_only_from_init() {
        assert_eq!(
            SlaveState::Init.next_towards(SlaveState::Bootstrap),
            Some(SlaveState::Bootstrap)
        );
        assert_eq!(
            SlaveState::PreOp.next_towards(SlaveState::Bootstrap),
            Some(SlaveState::Init)
        );
        assert_eq!(
            SlaveState::Bootstrap.next_towards(SlaveState::Op),
            Some(SlaveState::Init)
        );
    }
}
