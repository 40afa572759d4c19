//! SDO server
//!
//! Serves expedited and segmented transfers against the object
//! dictionary. A single transfer session is supported at a time; an
//! initiate request while a session is open implicitly abandons the old
//! session, and an abort from the client resets to idle without a
//! response.
//!
//! Segmented transfers are buffered: uploads snapshot the whole value
//! into the transfer buffer at initiate time so the client never sees a
//! torn read, and downloads accumulate into the buffer and commit in one
//! dictionary write on the final segment.
//!
//! A dictionary write may return [`WriteOutcome::Deferred`], parking the
//! session until the node resolves the pending operation (used by the
//! 1010h/1011h store and restore objects). A session that stays parked
//! past [`SDO_DEFER_TIMEOUT_TICKS`] aborts with a protocol timeout.

use tincan_common::sdo::{AbortCode, SdoRequest, SdoResponse};

use crate::dict::{find_entry, DictEntry, WriteOutcome};

/// Size of the transfer buffer; the largest object a segmented transfer
/// can move
pub const SDO_BUFFER_SIZE: usize = 256;

/// Ticks a deferred session may remain unresolved before it aborts
pub const SDO_DEFER_TIMEOUT_TICKS: u32 = 500;

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Idle,
    SegDownload {
        index: u16,
        sub: u8,
        received: usize,
        toggle: bool,
    },
    SegUpload {
        index: u16,
        sub: u8,
        offset: usize,
        total: usize,
        toggle: bool,
    },
    Deferred {
        index: u16,
        sub: u8,
        age: u32,
    },
}

/// The SDO server session state and transfer buffer
#[derive(Debug)]
pub struct SdoServer {
    state: State,
    buf: [u8; SDO_BUFFER_SIZE],
}

impl Default for SdoServer {
    fn default() -> Self {
        Self::new()
    }
}

impl SdoServer {
    /// Create an idle server
    pub const fn new() -> Self {
        Self {
            state: State::Idle,
            buf: [0; SDO_BUFFER_SIZE],
        }
    }

    /// True while a deferred write is waiting to be resolved
    pub fn is_deferred(&self) -> bool {
        matches!(self.state, State::Deferred { .. })
    }

    fn validate_download_size(
        index: u16,
        sub: u8,
        dl_size: usize,
        info: &tincan_common::objects::SubInfo,
    ) -> Result<(), SdoResponse> {
        if info.data_type.is_str() {
            // Strings may write shorter values
            if dl_size > info.size {
                return Err(SdoResponse::abort(
                    index,
                    sub,
                    AbortCode::DataTypeMismatchLengthHigh,
                ));
            }
        } else if dl_size < info.size {
            return Err(SdoResponse::abort(
                index,
                sub,
                AbortCode::DataTypeMismatchLengthLow,
            ));
        } else if dl_size > info.size {
            return Err(SdoResponse::abort(
                index,
                sub,
                AbortCode::DataTypeMismatchLengthHigh,
            ));
        }
        Ok(())
    }

    fn commit_write(
        &mut self,
        od: &[DictEntry],
        index: u16,
        sub: u8,
        data_len: usize,
    ) -> Option<SdoResponse> {
        // Lookup cannot fail here; it succeeded at initiate time
        let entry = match find_entry(od, index, sub) {
            Ok(e) => e,
            Err(e) => {
                self.state = State::Idle;
                return Some(SdoResponse::abort(index, sub, e.abort_code()));
            }
        };
        let data = &self.buf[..data_len];
        match entry.write(od, sub, data) {
            Ok(WriteOutcome::Done) => {
                self.state = State::Idle;
                Some(SdoResponse::download_acknowledge(index, sub))
            }
            Ok(WriteOutcome::Deferred) => {
                self.state = State::Deferred { index, sub, age: 0 };
                None
            }
            Err(abort_code) => {
                self.state = State::Idle;
                Some(SdoResponse::abort(index, sub, abort_code))
            }
        }
    }

    /// Handle one request frame, returning the response to transmit (if
    /// any)
    pub fn handle_request(&mut self, req: &SdoRequest, od: &[DictEntry]) -> Option<SdoResponse> {
        match *req {
            SdoRequest::InitiateUpload { index, sub } => {
                let entry = match find_entry(od, index, sub) {
                    Ok(e) => e,
                    Err(e) => return Some(SdoResponse::abort(index, sub, e.abort_code())),
                };
                let info = match entry.sub_info(sub) {
                    Ok(i) => i,
                    Err(code) => return Some(SdoResponse::abort(index, sub, code)),
                };
                if !info.access_type.is_readable() {
                    return Some(SdoResponse::abort(index, sub, AbortCode::WriteOnly));
                }
                let total = match entry.read_size(od, sub) {
                    Ok(s) => s,
                    Err(code) => return Some(SdoResponse::abort(index, sub, code)),
                };
                if total <= 4 {
                    self.state = State::Idle;
                    let mut buf = [0u8; 4];
                    if let Err(code) = entry.read(od, sub, 0, &mut buf[..total]) {
                        return Some(SdoResponse::abort(index, sub, code));
                    }
                    Some(SdoResponse::expedited_upload(index, sub, &buf[..total]))
                } else {
                    if total > SDO_BUFFER_SIZE {
                        return Some(SdoResponse::abort(index, sub, AbortCode::OutOfMemory));
                    }
                    // Snapshot the value so segments come from a single
                    // consistent read
                    if let Err(code) = entry.read(od, sub, 0, &mut self.buf[..total]) {
                        return Some(SdoResponse::abort(index, sub, code));
                    }
                    self.state = State::SegUpload {
                        index,
                        sub,
                        offset: 0,
                        total,
                        toggle: false,
                    };
                    Some(SdoResponse::upload_acknowledge(index, sub, total as u32))
                }
            }
            SdoRequest::ReqUploadSegment { t } => {
                let (index, sub, offset, total, toggle) = match self.state {
                    State::SegUpload {
                        index,
                        sub,
                        offset,
                        total,
                        toggle,
                    } => (index, sub, offset, total, toggle),
                    _ => {
                        self.state = State::Idle;
                        return Some(SdoResponse::abort(
                            0,
                            0,
                            AbortCode::InvalidCommandSpecifier,
                        ));
                    }
                };
                if t != toggle {
                    self.state = State::Idle;
                    return Some(SdoResponse::abort(
                        index,
                        sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                }
                let seg_len = (total - offset).min(7);
                let last = offset + seg_len == total;
                let resp =
                    SdoResponse::upload_segment(t, last, &self.buf[offset..offset + seg_len]);
                if last {
                    self.state = State::Idle;
                } else {
                    self.state = State::SegUpload {
                        index,
                        sub,
                        offset: offset + seg_len,
                        total,
                        toggle: !toggle,
                    };
                }
                Some(resp)
            }
            SdoRequest::InitiateDownload {
                n,
                e,
                s,
                index,
                sub,
                data,
            } => {
                let entry = match find_entry(od, index, sub) {
                    Ok(entry) => entry,
                    Err(err) => return Some(SdoResponse::abort(index, sub, err.abort_code())),
                };
                let info = match entry.sub_info(sub) {
                    Ok(i) => i,
                    Err(code) => return Some(SdoResponse::abort(index, sub, code)),
                };
                if !info.access_type.is_writable() {
                    return Some(SdoResponse::abort(index, sub, AbortCode::ReadOnly));
                }
                if e {
                    let dl_size = if s { 4 - n as usize } else { info.size.min(4) };
                    if let Err(resp) = Self::validate_download_size(index, sub, dl_size, &info) {
                        self.state = State::Idle;
                        return Some(resp);
                    }
                    self.buf[..dl_size].copy_from_slice(&data[..dl_size]);
                    self.commit_write(od, index, sub, dl_size)
                } else {
                    if s {
                        let announced = u32::from_le_bytes(data) as usize;
                        if let Err(resp) = Self::validate_download_size(index, sub, announced, &info)
                        {
                            self.state = State::Idle;
                            return Some(resp);
                        }
                        if announced > SDO_BUFFER_SIZE {
                            return Some(SdoResponse::abort(index, sub, AbortCode::OutOfMemory));
                        }
                    }
                    self.state = State::SegDownload {
                        index,
                        sub,
                        received: 0,
                        toggle: false,
                    };
                    Some(SdoResponse::download_acknowledge(index, sub))
                }
            }
            SdoRequest::DownloadSegment { t, n, c, data } => {
                let (index, sub, received, toggle) = match self.state {
                    State::SegDownload {
                        index,
                        sub,
                        received,
                        toggle,
                    } => (index, sub, received, toggle),
                    _ => {
                        self.state = State::Idle;
                        return Some(SdoResponse::abort(
                            0,
                            0,
                            AbortCode::InvalidCommandSpecifier,
                        ));
                    }
                };
                if t != toggle {
                    self.state = State::Idle;
                    return Some(SdoResponse::abort(
                        index,
                        sub,
                        AbortCode::ToggleNotAlternated,
                    ));
                }
                let seg_len = 7 - n as usize;
                if received + seg_len > SDO_BUFFER_SIZE {
                    self.state = State::Idle;
                    return Some(SdoResponse::abort(index, sub, AbortCode::OutOfMemory));
                }
                self.buf[received..received + seg_len].copy_from_slice(&data[..seg_len]);
                let received = received + seg_len;
                if c {
                    // Lookup succeeded at initiate time; re-fetch for the
                    // final size check and commit
                    let info = match find_entry(od, index, sub)
                        .map_err(|e| e.abort_code())
                        .and_then(|entry| entry.sub_info(sub))
                    {
                        Ok(i) => i,
                        Err(code) => {
                            self.state = State::Idle;
                            return Some(SdoResponse::abort(index, sub, code));
                        }
                    };
                    if let Err(resp) = Self::validate_download_size(index, sub, received, &info) {
                        self.state = State::Idle;
                        return Some(resp);
                    }
                    match self.commit_write(od, index, sub, received) {
                        // A normal download ack for a completed segmented
                        // transfer echoes the segment toggle
                        Some(resp) => match resp {
                            SdoResponse::ConfirmDownload { .. } => {
                                Some(SdoResponse::download_segment_acknowledge(t))
                            }
                            other => Some(other),
                        },
                        None => None,
                    }
                } else {
                    self.state = State::SegDownload {
                        index,
                        sub,
                        received,
                        toggle: !toggle,
                    };
                    Some(SdoResponse::download_segment_acknowledge(t))
                }
            }
            SdoRequest::Abort { .. } => {
                self.state = State::Idle;
                // An abort from the client gets no response
                None
            }
        }
    }

    /// Resolve a parked deferred write, producing the response that was
    /// withheld
    pub fn resolve_deferred(&mut self, result: Result<(), AbortCode>) -> Option<SdoResponse> {
        let (index, sub) = match self.state {
            State::Deferred { index, sub, .. } => (index, sub),
            _ => return None,
        };
        self.state = State::Idle;
        match result {
            Ok(()) => Some(SdoResponse::download_acknowledge(index, sub)),
            Err(code) => Some(SdoResponse::abort(index, sub, code)),
        }
    }

    /// Advance the deferred-session age by one tick
    ///
    /// Returns the timeout abort once a session exceeds
    /// [`SDO_DEFER_TIMEOUT_TICKS`].
    pub fn on_tick(&mut self) -> Option<SdoResponse> {
        if let State::Deferred { index, sub, age } = self.state {
            if age + 1 >= SDO_DEFER_TIMEOUT_TICKS {
                self.state = State::Idle;
                return Some(SdoResponse::abort(index, sub, AbortCode::SdoTimeout));
            }
            self.state = State::Deferred {
                index,
                sub,
                age: age + 1,
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dict::{DictBuilder, DictEntry, ObjectDict, ScalarCell, StrCell};
    use tincan_common::objects::SubInfo;

    fn test_dict() -> &'static ObjectDict<8> {
        let small = Box::leak(Box::new(ScalarCell::<u8>::new(0x11)));
        let word = Box::leak(Box::new(ScalarCell::<u32>::new(0xDEAD_BEEF)));
        let text = Box::leak(Box::new(StrCell::<24>::new()));
        text.set_str(b"tincan segmented value");
        let mut builder: DictBuilder<8> = DictBuilder::new();
        builder
            .add(DictEntry::raw(0x2000, 0, SubInfo::new_u8().rw(), small))
            .unwrap();
        builder
            .add(DictEntry::raw(0x2001, 0, SubInfo::new_u32().rw(), word))
            .unwrap();
        builder
            .add(DictEntry::raw(
                0x2002,
                0,
                SubInfo::new_visible_str(24).rw(),
                text,
            ))
            .unwrap();
        Box::leak(Box::new(builder.build().unwrap()))
    }

    fn round_trip(server: &mut SdoServer, od: &[DictEntry], req: SdoRequest) -> SdoResponse {
        server
            .handle_request(&req, od)
            .expect("expected a response")
    }

    #[test]
    fn expedited_upload_sizes() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x2000, 0));
        assert_eq!(resp, SdoResponse::expedited_upload(0x2000, 0, &[0x11]));

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x2001, 0));
        assert_eq!(
            resp,
            SdoResponse::expedited_upload(0x2001, 0, &0xDEAD_BEEFu32.to_le_bytes())
        );
    }

    #[test]
    fn expedited_download_writes_value() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();

        let resp = round_trip(
            &mut server,
            od,
            SdoRequest::expedited_download(0x2001, 0, &0x0102_0304u32.to_le_bytes()),
        );
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2001, 0));

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x2001, 0));
        assert_eq!(
            resp,
            SdoResponse::expedited_upload(0x2001, 0, &0x0102_0304u32.to_le_bytes())
        );
    }

    #[test]
    fn expedited_download_size_mismatch_aborts() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();

        let resp = round_trip(
            &mut server,
            od,
            SdoRequest::expedited_download(0x2001, 0, &[1, 2]),
        );
        assert_eq!(
            resp,
            SdoResponse::abort(0x2001, 0, AbortCode::DataTypeMismatchLengthLow)
        );
    }

    #[test]
    fn segmented_upload_shape() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();
        let expected = b"tincan segmented value";

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x2002, 0));
        assert_eq!(
            resp,
            SdoResponse::upload_acknowledge(0x2002, 0, expected.len() as u32)
        );

        // 22 bytes comes as ceil(22/7) = 4 segments, toggling from 0
        let mut collected = Vec::new();
        let mut toggle = false;
        loop {
            let resp = round_trip(&mut server, od, SdoRequest::upload_segment(toggle));
            match resp {
                SdoResponse::UploadSegment { t, n, c, data } => {
                    assert_eq!(t, toggle);
                    collected.extend_from_slice(&data[..7 - n as usize]);
                    if c {
                        break;
                    }
                }
                other => panic!("unexpected response {other:?}"),
            }
            toggle = !toggle;
        }
        assert_eq!(collected, expected);
        assert!(toggle); // 4 segments: last request used toggle=1
    }

    #[test]
    fn segmented_download_reassembles() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();
        let payload = b"hello from a client!";

        let resp = round_trip(
            &mut server,
            od,
            SdoRequest::initiate_download(0x2002, 0, Some(payload.len() as u32)),
        );
        assert_eq!(resp, SdoResponse::download_acknowledge(0x2002, 0));

        let mut toggle = false;
        for (i, chunk) in payload.chunks(7).enumerate() {
            let last = (i + 1) * 7 >= payload.len();
            let resp = round_trip(
                &mut server,
                od,
                SdoRequest::download_segment(toggle, last, chunk),
            );
            assert_eq!(resp, SdoResponse::download_segment_acknowledge(toggle));
            toggle = !toggle;
        }

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x2002, 0));
        assert_eq!(
            resp,
            SdoResponse::upload_acknowledge(0x2002, 0, payload.len() as u32)
        );
    }

    #[test]
    fn toggle_violation_aborts() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();

        round_trip(
            &mut server,
            od,
            SdoRequest::initiate_download(0x2002, 0, None),
        );
        // First segment must carry toggle 0
        let resp = round_trip(
            &mut server,
            od,
            SdoRequest::download_segment(true, false, &[1, 2, 3]),
        );
        assert_eq!(
            resp,
            SdoResponse::abort(0x2002, 0, AbortCode::ToggleNotAlternated)
        );
    }

    #[test]
    fn missing_object_aborts() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x5555, 0));
        assert_eq!(resp, SdoResponse::abort(0x5555, 0, AbortCode::NoSuchObject));

        let resp = round_trip(&mut server, od, SdoRequest::initiate_upload(0x2000, 9));
        assert_eq!(
            resp,
            SdoResponse::abort(0x2000, 9, AbortCode::NoSuchSubIndex)
        );
    }

    #[test]
    fn segment_without_session_aborts() {
        let od = test_dict().entries();
        let mut server = SdoServer::new();
        let resp = round_trip(&mut server, od, SdoRequest::upload_segment(false));
        assert_eq!(
            resp,
            SdoResponse::abort(0, 0, AbortCode::InvalidCommandSpecifier)
        );
    }
}
