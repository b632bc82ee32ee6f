//! Asynchronous work items: SDO, FoE, EoE, SoE, VoE, register and dictionary
//! requests.
//!
//! The application creates a request against a slave configuration, arms it,
//! and polls its state from the cyclic context while the master's state
//! machines process it in the background. Requests run to a terminal state
//! (`Success`/`Failure`) or, for streamed FoE reads, park in `Ready` until
//! the application drains the buffer.

use crate::coe::DictionarySummary;
use crate::coe::abort_code::CoeAbortCode;
use crate::eoe::IpParameters;
use crate::error::Error;
use crate::foe::MAX_FILENAME;
use crate::{MAX_SDO_DATA, fmt};

/// Lifecycle of an acyclic request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RequestState {
    /// Created but not armed.
    #[default]
    Idle,
    /// Armed, waiting for the master to pick it up.
    Queued,
    /// Being processed.
    Busy,
    /// FoE read only: the receive buffer is full; drain it and resume.
    Ready,
    /// Completed successfully; data is valid.
    Success,
    /// Failed; see the error accessors.
    Failure,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

/// Transfer direction of a request.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum RequestDirection {
    /// Slave to master.
    #[default]
    Read,
    /// Master to slave.
    Write,
}

macro_rules! request_common {
    () => {
        /// Current lifecycle state.
        pub fn state(&self) -> RequestState {
            self.state
        }

        /// Error from the last failure, if any.
        pub fn error(&self) -> Option<Error> {
            self.error
        }

        /// Payload buffer.
        pub fn data(&self) -> &[u8] {
            &self.data
        }

        pub(crate) fn finish(&mut self, result: Result<(), Error>) {
            match result {
                Ok(()) => self.state = RequestState::Success,
                Err(error) => {
                    self.state = RequestState::Failure;
                    self.error = Some(error);
                }
            }
        }
    };
}

/// An SDO upload or download request.
#[derive(Debug, Default)]
pub struct SdoRequest {
    pub(crate) config: usize,
    pub(crate) index: u16,
    pub(crate) sub_index: u8,
    pub(crate) complete_access: bool,
    pub(crate) direction: RequestDirection,
    pub(crate) data: heapless::Vec<u8, MAX_SDO_DATA>,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
    pub(crate) abort_code: Option<CoeAbortCode>,
}

impl SdoRequest {
    request_common!();

    /// SDO abort code from the slave, if the transfer was aborted.
    pub fn abort_code(&self) -> Option<CoeAbortCode> {
        self.abort_code
    }

    /// Re-target the request. Only allowed while no transfer is in flight.
    pub fn set_target(&mut self, index: u16, sub_index: u8) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.index = index;
        self.sub_index = sub_index;

        Ok(())
    }

    /// Fill the buffer ahead of a write.
    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.data.clear();
        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(crate::error::Item::Request))
    }

    fn arm(&mut self, direction: RequestDirection) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.direction = direction;
        self.error = None;
        self.abort_code = None;
        self.state = RequestState::Queued;

        Ok(())
    }

    /// Arm an upload of the target object into the buffer.
    pub fn read(&mut self) -> Result<(), Error> {
        self.arm(RequestDirection::Read)
    }

    /// Arm a download of the buffer to the target object.
    pub fn write(&mut self) -> Result<(), Error> {
        self.arm(RequestDirection::Write)
    }
}

/// A FoE file transfer request.
#[derive(Debug, Default)]
pub struct FoeRequest {
    pub(crate) config: usize,
    pub(crate) filename: heapless::String<MAX_FILENAME>,
    pub(crate) direction: RequestDirection,
    pub(crate) data: heapless::Vec<u8, MAX_SDO_DATA>,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
    /// Set when a read parks in `Ready`; cleared by `resume`.
    pub(crate) resume_requested: bool,
}

impl FoeRequest {
    request_common!();

    pub fn set_filename(&mut self, filename: &str) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.filename.clear();
        self.filename
            .push_str(filename)
            .map_err(|_| Error::Capacity(crate::error::Item::Request))
    }

    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.data.clear();
        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(crate::error::Item::Request))
    }

    /// Arm a file read.
    pub fn read(&mut self) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.direction = RequestDirection::Read;
        self.error = None;
        self.resume_requested = false;
        self.state = RequestState::Queued;

        Ok(())
    }

    /// Arm a file write of the buffer contents.
    pub fn write(&mut self) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.direction = RequestDirection::Write;
        self.error = None;
        self.resume_requested = false;
        self.state = RequestState::Queued;

        Ok(())
    }

    /// Continue a read parked in [`RequestState::Ready`] after draining
    /// [`Self::data`].
    pub fn resume(&mut self) -> Result<(), Error> {
        if self.state != RequestState::Ready {
            return Err(Error::Busy);
        }

        self.resume_requested = true;
        self.state = RequestState::Busy;

        Ok(())
    }
}

/// An EoE "set IP parameters" request.
#[derive(Debug, Default)]
pub struct EoeRequest {
    pub(crate) config: usize,
    pub(crate) params: IpParameters,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
    pub(crate) result: u16,
}

impl EoeRequest {
    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn finish(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state = RequestState::Success,
            Err(error) => {
                self.state = RequestState::Failure;
                self.error = Some(error);
            }
        }
    }

    /// Vendor defined result code from the response; zero on success.
    pub fn result(&self) -> u16 {
        self.result
    }

    /// Arm the request with the given parameters.
    pub fn set_ip(&mut self, params: IpParameters) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.params = params;
        self.error = None;
        self.result = 0;
        self.state = RequestState::Queued;

        Ok(())
    }
}

/// An SoE IDN read or write request.
#[derive(Debug, Default)]
pub struct SoeRequest {
    pub(crate) config: usize,
    pub(crate) drive_no: u8,
    pub(crate) idn: u16,
    pub(crate) direction: RequestDirection,
    pub(crate) data: heapless::Vec<u8, MAX_SDO_DATA>,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
    pub(crate) error_code: u16,
}

impl SoeRequest {
    request_common!();

    /// SERCOS error code from the slave, zero if none.
    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    pub fn set_target(&mut self, drive_no: u8, idn: u16) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.drive_no = drive_no;
        self.idn = idn;

        Ok(())
    }

    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.data.clear();
        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(crate::error::Item::Request))
    }

    fn arm(&mut self, direction: RequestDirection) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.direction = direction;
        self.error = None;
        self.error_code = 0;
        self.state = RequestState::Queued;

        Ok(())
    }

    pub fn read(&mut self) -> Result<(), Error> {
        self.arm(RequestDirection::Read)
    }

    pub fn write(&mut self) -> Result<(), Error> {
        self.arm(RequestDirection::Write)
    }
}

/// A VoE send or receive request.
#[derive(Debug, Default)]
pub struct VoeRequest {
    pub(crate) config: usize,
    pub(crate) vendor_id: u32,
    pub(crate) vendor_type: u16,
    pub(crate) direction: RequestDirection,
    pub(crate) data: heapless::Vec<u8, MAX_SDO_DATA>,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
}

impl VoeRequest {
    request_common!();

    /// Vendor header of the last received frame.
    pub fn vendor_header(&self) -> (u32, u16) {
        (self.vendor_id, self.vendor_type)
    }

    pub fn set_vendor_header(&mut self, vendor_id: u32, vendor_type: u16) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.vendor_id = vendor_id;
        self.vendor_type = vendor_type;

        Ok(())
    }

    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.data.clear();
        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(crate::error::Item::Request))
    }

    /// Arm a send of the buffer contents.
    pub fn write(&mut self) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.direction = RequestDirection::Write;
        self.error = None;
        self.state = RequestState::Queued;

        Ok(())
    }

    /// Arm a receive into the buffer.
    pub fn read(&mut self) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.direction = RequestDirection::Read;
        self.error = None;
        self.state = RequestState::Queued;

        Ok(())
    }
}

/// A raw slave register read or write processed acyclically.
#[derive(Debug, Default)]
pub struct RegRequest {
    pub(crate) config: usize,
    pub(crate) register: u16,
    pub(crate) direction: RequestDirection,
    pub(crate) data: heapless::Vec<u8, { crate::pdu_loop::REG_DATA_MAX }>,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
}

impl RegRequest {
    request_common!();

    pub fn set_data(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.data.clear();
        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(crate::error::Item::Request))
    }

    /// Arm a read of `len` bytes from `register`.
    pub fn read(&mut self, register: u16, len: usize) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        if len > self.data.capacity() {
            return Err(Error::Capacity(crate::error::Item::Request));
        }

        self.register = register;
        self.data.clear();
        let _ = self.data.resize(len, 0);
        self.direction = RequestDirection::Read;
        self.error = None;
        self.state = RequestState::Queued;

        Ok(())
    }

    /// Arm a write of the buffer to `register`.
    pub fn write(&mut self, register: u16) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.register = register;
        self.direction = RequestDirection::Write;
        self.error = None;
        self.state = RequestState::Queued;

        Ok(())
    }
}

/// An object dictionary scan request.
#[derive(Debug, Default)]
pub struct DictRequest {
    pub(crate) config: usize,
    pub(crate) state: RequestState,
    pub(crate) error: Option<Error>,
    pub(crate) summary: DictionarySummary,
}

impl DictRequest {
    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn error(&self) -> Option<Error> {
        self.error
    }

    pub(crate) fn finish(&mut self, result: Result<(), Error>) {
        match result {
            Ok(()) => self.state = RequestState::Success,
            Err(error) => {
                self.state = RequestState::Failure;
                self.error = Some(error);
            }
        }
    }

    /// Scan results after success.
    pub fn summary(&self) -> &DictionarySummary {
        &self.summary
    }

    /// Arm the scan.
    pub fn read(&mut self) -> Result<(), Error> {
        if self.state == RequestState::Busy {
            return Err(Error::Busy);
        }

        self.error = None;
        self.state = RequestState::Queued;

        Ok(())
    }
}

/// All request arenas, owned by the master.
#[derive(Debug, Default)]
pub(crate) struct Requests {
    pub sdo: heapless::Vec<SdoRequest, 8>,
    pub foe: heapless::Vec<FoeRequest, 4>,
    pub eoe: heapless::Vec<EoeRequest, 4>,
    pub soe: heapless::Vec<SoeRequest, 8>,
    pub voe: heapless::Vec<VoeRequest, 4>,
    pub reg: heapless::Vec<RegRequest, 8>,
    pub dict: heapless::Vec<DictRequest, 2>,
}

impl Requests {
    /// Fail every non-terminal request, e.g. on master release.
    pub fn fail_all_pending(&mut self) {
        fn sweep<T, const N: usize>(
            items: &mut heapless::Vec<T, N>,
            state: impl Fn(&mut T) -> (&mut RequestState, &mut Option<Error>),
        ) {
            for item in items.iter_mut() {
                let (item_state, error) = state(item);

                if !item_state.is_terminal() && *item_state != RequestState::Idle {
                    *item_state = RequestState::Failure;
                    *error = Some(Error::Internal);
                }
            }
        }

        fmt::debug!("Failing all pending acyclic requests");

        sweep(&mut self.sdo, |r| (&mut r.state, &mut r.error));
        sweep(&mut self.foe, |r| (&mut r.state, &mut r.error));
        sweep(&mut self.eoe, |r| (&mut r.state, &mut r.error));
        sweep(&mut self.soe, |r| (&mut r.state, &mut r.error));
        sweep(&mut self.voe, |r| (&mut r.state, &mut r.error));
        sweep(&mut self.reg, |r| (&mut r.state, &mut r.error));
        sweep(&mut self.dict, |r| (&mut r.state, &mut r.error));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_and_finish() {
        let mut request = SdoRequest::default();

        request.set_target(0x6000, 0x11).unwrap();
        request.read().unwrap();

        assert_eq!(request.state(), RequestState::Queued);

        request.state = RequestState::Busy;

        // Re-arming a busy request is refused
        assert_eq!(request.read(), Err(Error::Busy));

        request.finish(Ok(()));

        assert_eq!(request.state(), RequestState::Success);
        assert!(request.state().is_terminal());
    }

    #[test]
    fn foe_resume_only_from_ready() {
        let mut request = FoeRequest::default();

        assert!(request.resume().is_err());

        request.state = RequestState::Ready;

        request.resume().unwrap();

        assert_eq!(request.state(), RequestState::Busy);
        assert!(request.resume_requested);
    }

    #[test]
    fn fail_all_skips_terminal() {
        let mut requests = Requests::default();

        let mut done = SdoRequest::default();
        done.state = RequestState::Success;

        let mut pending = SdoRequest::default();
        pending.state = RequestState::Queued;

        requests.sdo.push(done).unwrap();
        requests.sdo.push(pending).unwrap();

        requests.fail_all_pending();

        assert_eq!(requests.sdo[0].state(), RequestState::Success);
        assert_eq!(requests.sdo[1].state(), RequestState::Failure);
    }
}
