//! Channel encoder session state machine.
//!
//! Open → Accepting → Draining → Closed. Once closed, the output buffer is
//! frozen and every further operation fails with `SessionClosed`.

use log::{debug, trace};

use super::{EncodedChannel, EncoderConfig, FfmpegEncoder, FrameEncoder};
use crate::error::EncodeError;
use crate::pack::PackedFrame;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Codec opened, nothing submitted yet.
    Open,
    /// At least one frame submitted.
    Accepting,
    /// End of stream signalled and remaining packets pulled.
    Draining,
    /// Trailer written; output is immutable.
    Closed,
}

/// One channel's encoder session.
///
/// A session that fails to open never exists, so there is no uninitialized
/// state to guard against.
pub struct ChannelEncoder<E: FrameEncoder = FfmpegEncoder> {
    backend: E,
    state: SessionState,
    frames_submitted: usize,
    encoded_frames: usize,
    packet_bytes: usize,
    output: Vec<u8>,
}

impl ChannelEncoder<FfmpegEncoder> {
    /// Open an FFmpeg-backed session.
    pub fn open(config: &EncoderConfig) -> Result<Self, EncodeError> {
        FfmpegEncoder::open(config).map(Self::with_backend)
    }
}

impl<E: FrameEncoder> ChannelEncoder<E> {
    /// Wrap an already opened codec.
    pub fn with_backend(backend: E) -> Self {
        Self {
            backend,
            state: SessionState::Open,
            frames_submitted: 0,
            encoded_frames: 0,
            packet_bytes: 0,
            output: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frames_submitted(&self) -> usize {
        self.frames_submitted
    }

    /// Packets emitted so far.
    pub fn encoded_frames(&self) -> usize {
        self.encoded_frames
    }

    /// Submit the next frame and pull at most one packet.
    pub fn submit(&mut self, frame: &PackedFrame) -> Result<(), EncodeError> {
        match self.state {
            SessionState::Open | SessionState::Accepting => {}
            SessionState::Draining => {
                return Err(EncodeError::EncodeSubmit {
                    frame: self.frames_submitted as i64,
                    reason: "end of stream already signalled".to_string(),
                });
            }
            SessionState::Closed => return Err(EncodeError::SessionClosed),
        }

        let pts = self.frames_submitted as i64;
        self.backend.send_frame(frame, pts)?;
        self.frames_submitted += 1;
        self.state = SessionState::Accepting;
        trace!("Submitted slice {} as pts {}", frame.slice, pts);

        self.pull_packet()?;
        Ok(())
    }

    /// Signal end of stream and drain the codec.
    ///
    /// After the drain, empty flush requests are issued until
    /// `frames_submitted + 1` packets have been accounted for, which covers
    /// encoders that hold one frame back past the first flush.
    pub fn finish(&mut self) -> Result<(), EncodeError> {
        match self.state {
            SessionState::Open | SessionState::Accepting => {}
            SessionState::Draining => return Ok(()),
            SessionState::Closed => return Err(EncodeError::SessionClosed),
        }
        self.state = SessionState::Draining;

        self.backend.send_eof()?;
        let mut drained = 0;
        while self.pull_packet()? {
            drained += 1;
        }
        debug!(
            "Drained {} delayed packets ({}/{} frames encoded)",
            drained, self.encoded_frames, self.frames_submitted
        );

        let target = self.frames_submitted + 1;
        for _ in self.encoded_frames..target {
            self.backend.send_eof()?;
            self.pull_packet()?;
        }
        Ok(())
    }

    /// Write the trailer and freeze the output. Drains first if needed.
    pub fn close(&mut self) -> Result<(), EncodeError> {
        match self.state {
            SessionState::Closed => return Err(EncodeError::SessionClosed),
            SessionState::Open | SessionState::Accepting => self.finish()?,
            SessionState::Draining => {}
        }
        self.output = self.backend.finish()?;
        self.state = SessionState::Closed;
        debug!(
            "Session closed: {} frames, {} packets, {} payload bytes, {} output bytes",
            self.frames_submitted,
            self.encoded_frames,
            self.packet_bytes,
            self.output.len()
        );
        Ok(())
    }

    /// Final output; only available once closed.
    pub fn output(&self) -> Result<&[u8], EncodeError> {
        match self.state {
            SessionState::Closed => Ok(&self.output),
            _ => Err(EncodeError::EncodeDrain(
                "output requested before the session was closed".to_string(),
            )),
        }
    }

    /// Consume the closed session into its channel payload.
    pub fn into_encoded(self, channel: usize) -> Result<EncodedChannel, EncodeError> {
        if self.state != SessionState::Closed {
            return Err(EncodeError::EncodeDrain(
                "session consumed before it was closed".to_string(),
            ));
        }
        Ok(EncodedChannel {
            channel,
            data: self.output,
        })
    }

    /// Returns true when a packet was emitted.
    fn pull_packet(&mut self) -> Result<bool, EncodeError> {
        match self.backend.receive_packet()? {
            Some(size) => {
                self.encoded_frames += 1;
                self.packet_bytes += size;
                debug_assert!(self.encoded_frames <= self.frames_submitted + 1);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::pack::PackedData;
    use std::collections::VecDeque;

    /// In-memory codec holding `latency` frames back until end of stream.
    /// Each packet is the frame's pts as 8 bytes followed by its first sample.
    pub(crate) struct FakeEncoder {
        latency: usize,
        queue: VecDeque<(i64, u8)>,
        eof: bool,
        pub eof_calls: usize,
        out: Vec<u8>,
        reject_at: Option<i64>,
    }

    impl FakeEncoder {
        pub(crate) fn new(latency: usize) -> Self {
            Self {
                latency,
                queue: VecDeque::new(),
                eof: false,
                eof_calls: 0,
                out: b"HDR".to_vec(),
                reject_at: None,
            }
        }

        pub(crate) fn rejecting(pts: i64) -> Self {
            Self {
                reject_at: Some(pts),
                ..Self::new(0)
            }
        }
    }

    impl FrameEncoder for FakeEncoder {
        fn send_frame(&mut self, frame: &PackedFrame, pts: i64) -> Result<(), EncodeError> {
            if self.reject_at == Some(pts) {
                return Err(EncodeError::EncodeSubmit {
                    frame: pts,
                    reason: "rejected".into(),
                });
            }
            let first = match &frame.data {
                PackedData::Rgb24(v) => v[0],
                PackedData::Gray16(v) => (v[0] >> 8) as u8,
            };
            self.queue.push_back((pts, first));
            Ok(())
        }

        fn send_eof(&mut self) -> Result<(), EncodeError> {
            self.eof = true;
            self.eof_calls += 1;
            Ok(())
        }

        fn receive_packet(&mut self) -> Result<Option<usize>, EncodeError> {
            if self.queue.len() > self.latency || (self.eof && !self.queue.is_empty()) {
                let (pts, first) = self.queue.pop_front().unwrap();
                self.out.extend_from_slice(&pts.to_le_bytes());
                self.out.push(first);
                Ok(Some(9))
            } else {
                Ok(None)
            }
        }

        fn finish(&mut self) -> Result<Vec<u8>, EncodeError> {
            self.out.extend_from_slice(b"END");
            Ok(std::mem::take(&mut self.out))
        }
    }

    pub(crate) fn gray_frame(slice: usize, value: u8) -> PackedFrame {
        PackedFrame {
            slice,
            width: 8,
            height: 8,
            data: PackedData::Rgb24(vec![value; 8 * 8 * 3]),
        }
    }

    #[test]
    fn test_latency_does_not_lose_frames() {
        for latency in 0..5 {
            let mut session = ChannelEncoder::with_backend(FakeEncoder::new(latency));
            for z in 0..3 {
                session.submit(&gray_frame(z, z as u8)).unwrap();
            }
            assert_eq!(session.frames_submitted(), 3);
            assert_eq!(session.encoded_frames(), 3usize.saturating_sub(latency));

            session.finish().unwrap();
            assert_eq!(session.state(), SessionState::Draining);
            assert!(session.encoded_frames() >= 3, "latency {}", latency);
            assert!(session.encoded_frames() <= session.frames_submitted() + 1);
        }
    }

    #[test]
    fn test_correction_step_pads_to_d_plus_one() {
        let mut session = ChannelEncoder::with_backend(FakeEncoder::new(2));
        for z in 0..4 {
            session.submit(&gray_frame(z, 0)).unwrap();
        }
        session.finish().unwrap();
        // one initial EOF plus one empty request for the missing d+1 packet
        assert_eq!(session.backend.eof_calls, 2);
    }

    #[test]
    fn test_output_in_submission_order() {
        let mut session = ChannelEncoder::with_backend(FakeEncoder::new(1));
        for z in 0..3 {
            session.submit(&gray_frame(z, 10 + z as u8)).unwrap();
        }
        session.close().unwrap();

        let out = session.output().unwrap();
        assert_eq!(&out[..3], b"HDR");
        assert_eq!(&out[out.len() - 3..], b"END");
        let body = &out[3..out.len() - 3];
        assert_eq!(body.len(), 27);
        for (z, packet) in body.chunks(9).enumerate() {
            assert_eq!(i64::from_le_bytes(packet[..8].try_into().unwrap()), z as i64);
            assert_eq!(packet[8], 10 + z as u8);
        }
    }

    #[test]
    fn test_closed_session_rejects_operations() {
        let mut session = ChannelEncoder::with_backend(FakeEncoder::new(0));
        session.submit(&gray_frame(0, 1)).unwrap();
        session.close().unwrap();

        assert!(matches!(session.submit(&gray_frame(1, 1)), Err(EncodeError::SessionClosed)));
        assert!(matches!(session.finish(), Err(EncodeError::SessionClosed)));
        assert!(matches!(session.close(), Err(EncodeError::SessionClosed)));
        assert!(session.output().is_ok());
    }

    #[test]
    fn test_submit_after_flush_rejected() {
        let mut session = ChannelEncoder::with_backend(FakeEncoder::new(0));
        session.finish().unwrap();
        assert!(matches!(
            session.submit(&gray_frame(0, 1)),
            Err(EncodeError::EncodeSubmit { .. })
        ));
    }

    #[test]
    fn test_output_before_close_is_error() {
        let session = ChannelEncoder::with_backend(FakeEncoder::new(0));
        assert!(session.output().is_err());
        assert!(session.into_encoded(0).is_err());
    }

    #[test]
    fn test_submit_error_propagates() {
        let mut session = ChannelEncoder::with_backend(FakeEncoder::rejecting(1));
        session.submit(&gray_frame(0, 1)).unwrap();
        let err = session.submit(&gray_frame(1, 1)).unwrap_err();
        assert!(matches!(err, EncodeError::EncodeSubmit { frame: 1, .. }));
        assert_eq!(session.frames_submitted(), 1);
    }

    #[test]
    fn test_encode_frames_helper() {
        let frames = (0..5).map(|z| gray_frame(z, 3));
        let (encoded, packets) = super::super::encode_frames(FakeEncoder::new(3), 2, frames).unwrap();
        assert_eq!(encoded.channel, 2);
        assert_eq!(packets, 5);
        assert_eq!(encoded.len(), 3 + 5 * 9 + 3);
    }
}
