//! In-band header frames for late joiners.
//!
//! The publisher re-emits the collection header inside the media stream so a
//! subscriber that joins mid-stream can start a rewrap without an out-of-band
//! manifest. A header frame is `b"NTDH"` followed by the encoded header.

use log::{debug, info};

use crate::header::{Header, ParsingError};

pub const HEADER_FRAME_MAGIC: [u8; 4] = *b"NTDH";
/// Upper bound on media time between header frames when keyframes are sparse
pub const DEFAULT_REINJECT_INTERVAL_MS: u64 = 2_000;

pub fn header_frame(header_bytes: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_FRAME_MAGIC.len() + header_bytes.len());
    frame.extend_from_slice(&HEADER_FRAME_MAGIC);
    frame.extend_from_slice(header_bytes);
    frame
}

#[derive(Debug, PartialEq)]
pub enum InbandFrame<'a> {
    Header(Header),
    Media(&'a [u8]),
}

/// Classify one transport payload.
pub fn parse_frame(payload: &[u8]) -> Result<InbandFrame<'_>, ParsingError> {
    match payload.strip_prefix(&HEADER_FRAME_MAGIC[..]) {
        Some(header_bytes) => Ok(InbandFrame::Header(Header::decode(header_bytes)?)),
        None => Ok(InbandFrame::Media(payload)),
    }
}

/// Decides when the header frame goes out: before the first frame, before
/// every keyframe, and whenever `interval_ms` of media time passed without one.
pub struct HeaderInjector {
    frame: Vec<u8>,
    interval_ms: u64,
    last_emitted_ms: Option<u64>,
}

impl HeaderInjector {
    pub fn new(header_bytes: &[u8]) -> Self {
        HeaderInjector {
            frame: header_frame(header_bytes),
            interval_ms: DEFAULT_REINJECT_INTERVAL_MS,
            last_emitted_ms: None,
        }
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn header_frame(&self) -> &[u8] {
        &self.frame
    }

    /// Swap in a new header after key rotation; it goes out before the next frame.
    pub fn replace_header(&mut self, header_bytes: &[u8]) {
        self.frame = header_frame(header_bytes);
        self.last_emitted_ms = None;
        info!("Collection header replaced, re-injecting on next frame");
    }

    /// Call once per outgoing media frame. Returns the header frame when it
    /// must be written ahead of this one.
    pub fn before_frame(&mut self, timestamp_ms: u64, is_keyframe: bool) -> Option<&[u8]> {
        let due = match self.last_emitted_ms {
            None => true,
            // timestamps going backwards mean a discontinuity
            Some(last) if timestamp_ms < last => true,
            Some(last) => is_keyframe || timestamp_ms - last >= self.interval_ms,
        };
        if !due {
            return None;
        }
        self.last_emitted_ms = Some(timestamp_ms);
        debug!("Injecting header frame at {}ms (keyframe: {})", timestamp_ms, is_keyframe);
        Some(&self.frame)
    }
}

/// What a subscriber should do with an incoming payload.
#[derive(Debug, PartialEq)]
pub enum JoinEvent<'a> {
    /// A header not seen before: rewrap with it.
    NewHeader(Header),
    /// Encrypted media under the current header.
    Media(&'a [u8]),
    /// Repeated header, or media before any header arrived.
    Skip,
}

/// Subscriber-side tracker that waits for the first header frame and then
/// reports only header changes.
#[derive(Default)]
pub struct LateJoiner {
    current: Option<Header>,
}

impl LateJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_header(&self) -> Option<&Header> {
        self.current.as_ref()
    }

    pub fn accept<'a>(&mut self, payload: &'a [u8]) -> Result<JoinEvent<'a>, ParsingError> {
        match parse_frame(payload)? {
            InbandFrame::Header(header) => {
                if self.current.as_ref() == Some(&header) {
                    return Ok(JoinEvent::Skip);
                }
                self.current = Some(header.clone());
                Ok(JoinEvent::NewHeader(header))
            }
            InbandFrame::Media(_) if self.current.is_none() => Ok(JoinEvent::Skip),
            InbandFrame::Media(media) => Ok(JoinEvent::Media(media)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::{CipherSuite, Policy, ResourceLocator};

    fn header(policy: &[u8]) -> Header {
        let mut key = vec![0x03];
        key.extend_from_slice(&[0x22; 32]);
        Header::new(
            CipherSuite::P256_AES256_GCM,
            ResourceLocator::parse("https://kas.example.com").unwrap(),
            Policy::Embedded(policy.to_vec()),
            vec![0x11; 16],
            key,
        )
        .unwrap()
    }

    #[test]
    fn test_header_frame_round_trip() {
        let header = header(b"{}");
        let frame = header_frame(&header.encode());
        assert_eq!(&frame[..4], b"NTDH");
        assert_eq!(parse_frame(&frame).unwrap(), InbandFrame::Header(header));

        let media = [0x00, 0x00, 0x01, 0x00, 0x00, 0x05];
        assert_eq!(parse_frame(&media).unwrap(), InbandFrame::Media(&media[..]));
    }

    #[test]
    fn test_truncated_header_frame_is_an_error() {
        let frame = header_frame(&header(b"{}").encode());
        assert_eq!(parse_frame(&frame[..frame.len() - 1]), Err(ParsingError::Truncated));
    }

    #[test]
    fn test_injection_schedule() {
        let mut injector = HeaderInjector::new(&header(b"{}").encode()).with_interval_ms(1_000);

        assert!(injector.before_frame(0, false).is_some());
        assert!(injector.before_frame(33, false).is_none());
        assert!(injector.before_frame(66, true).is_some());
        assert!(injector.before_frame(1_000, false).is_none());
        assert!(injector.before_frame(1_066, false).is_some());
        assert!(injector.before_frame(1_100, false).is_none());
        // discontinuity
        assert!(injector.before_frame(10, false).is_some());
    }

    #[test]
    fn test_replace_header_emits_immediately() {
        let first = header(b"{}").encode();
        let second = header(b"{\"expiry\":1}").encode();
        let mut injector = HeaderInjector::new(&first);
        injector.before_frame(0, true);
        assert!(injector.before_frame(10, false).is_none());

        injector.replace_header(&second);
        let frame = injector.before_frame(20, false).unwrap();
        assert_eq!(&frame[4..], second.as_slice());
    }

    #[test]
    fn test_late_joiner_waits_for_header() {
        let h = header(b"{}");
        let frame = header_frame(&h.encode());
        let media = [0x00, 0x00, 0x02, 0x00, 0x00, 0x00];
        let mut joiner = LateJoiner::new();

        assert_eq!(joiner.accept(&media).unwrap(), JoinEvent::Skip);
        assert_eq!(joiner.accept(&frame).unwrap(), JoinEvent::NewHeader(h.clone()));
        assert_eq!(joiner.accept(&media).unwrap(), JoinEvent::Media(&media[..]));
        assert_eq!(joiner.accept(&frame).unwrap(), JoinEvent::Skip);
        assert_eq!(joiner.current_header(), Some(&h));

        let rotated = header(b"{\"expiry\":2}");
        assert_eq!(
            joiner.accept(&header_frame(&rotated.encode())).unwrap(),
            JoinEvent::NewHeader(rotated)
        );
    }
}
