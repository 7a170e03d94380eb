//! Recovers self-delimited sensor reports from an arbitrary byte stream.
//!
//! The stream socket gives no alignment guarantees: a session may attach
//! mid-frame, the device occasionally interleaves garbage, and TCP chunks
//! reads wherever it likes. The framer owns a pending buffer and drains as
//! many complete reports as each append makes available, counting everything
//! it had to skip.

use crate::protocol::{self, DecodedReport, REPORT_BODY_LEN, REPORT_HEADER_LEN};
use crate::types::{ReportKind, SensorReport};

/// Upper bound on buffered unparsed bytes. Overflow is dropped from the
/// front, oldest first.
pub const MAX_PENDING_BYTES: usize = 131_072;

/// Counters accumulated over the life of a framer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerCounters {
    /// Bytes discarded while hunting for a header magic (includes buffer
    /// overflow drops).
    pub dropped_bytes: u64,
    /// Headers whose length field was not the fixed report size.
    pub invalid_report_length: u64,
    /// Bodies that failed to decode.
    pub decode_error: u64,
    /// Bodies carrying an unrecognized report kind.
    pub unknown_report_type: u64,
    pub imu_reports: u64,
    pub mag_reports: u64,
}

#[derive(Debug, Default)]
pub struct ReportFramer {
    pending: Vec<u8>,
    counters: FramerCounters,
}

impl ReportFramer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counters(&self) -> FramerCounters {
        self.counters
    }

    /// Append raw socket bytes and drain every complete report they unlock.
    pub fn append(&mut self, bytes: &[u8]) -> Vec<SensorReport> {
        self.pending.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.drain_one(&mut out) {}
        if self.pending.len() > MAX_PENDING_BYTES {
            let excess = self.pending.len() - MAX_PENDING_BYTES;
            self.pending.drain(..excess);
            self.counters.dropped_bytes += excess as u64;
            log::warn!("framer buffer overflow, dropped {excess} bytes");
        }
        out
    }

    /// Try to make progress on the pending buffer. Returns false once more
    /// bytes are needed.
    fn drain_one(&mut self, out: &mut Vec<SensorReport>) -> bool {
        if self.pending.len() < 2 {
            return false;
        }

        // Hunt for a header magic pair, discarding everything before it. The
        // final byte is kept back: it may be the first half of a pair split
        // across appends.
        let mut start = None;
        for i in 0..self.pending.len() - 1 {
            if protocol::is_report_magic(self.pending[i], self.pending[i + 1]) {
                start = Some(i);
                break;
            }
        }
        let start = match start {
            Some(i) => i,
            None => {
                let dropped = self.pending.len() - 1;
                self.pending.drain(..dropped);
                self.counters.dropped_bytes += dropped as u64;
                return false;
            }
        };
        if start > 0 {
            self.pending.drain(..start);
            self.counters.dropped_bytes += start as u64;
        }

        if self.pending.len() < REPORT_HEADER_LEN {
            return false;
        }
        let length = u32::from_be_bytes(self.pending[2..6].try_into().unwrap());
        if length != REPORT_BODY_LEN as u32 {
            // A false magic. Advance a single byte so a real header starting
            // inside the discarded window is still found.
            self.counters.invalid_report_length += 1;
            self.pending.drain(..1);
            self.counters.dropped_bytes += 1;
            return true;
        }

        let frame_len = REPORT_HEADER_LEN + REPORT_BODY_LEN;
        if self.pending.len() < frame_len {
            return false;
        }
        match protocol::decode_report_body(&self.pending[REPORT_HEADER_LEN..frame_len]) {
            Ok(DecodedReport::Report(report)) => {
                match report.kind {
                    ReportKind::Imu => self.counters.imu_reports += 1,
                    ReportKind::Magnetometer => self.counters.mag_reports += 1,
                }
                out.push(report);
            }
            Ok(DecodedReport::UnknownKind(kind)) => {
                self.counters.unknown_report_type += 1;
                log::trace!("skipping report with unknown kind 0x{kind:02x}");
            }
            Err(err) => {
                self.counters.decode_error += 1;
                log::warn!("report body decode failed: {err}");
            }
        }
        self.pending.drain(..frame_len);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_report;
    use crate::protocol::tests::sample_report;

    #[test]
    fn clean_stream() {
        let mut framer = ReportFramer::new();
        let mut bytes = Vec::new();
        for i in 0..5u64 {
            let mut r = sample_report();
            r.hmd_time_ns = i;
            bytes.extend_from_slice(&encode_report(&r));
        }
        let reports = framer.append(&bytes);
        assert_eq!(reports.len(), 5);
        assert_eq!(framer.counters().imu_reports, 5);
        assert_eq!(framer.counters().dropped_bytes, 0);
        for (i, r) in reports.iter().enumerate() {
            assert_eq!(r.hmd_time_ns, i as u64);
        }
    }

    #[test]
    fn resync_after_garbage_prefix() {
        let mut framer = ReportFramer::new();
        let mut bytes = vec![0x44, 0x45, 0x46];
        bytes.extend_from_slice(&encode_report(&sample_report()));

        // Split anywhere: both halves together must yield exactly one report.
        for split in 0..bytes.len() {
            let mut framer = ReportFramer::new();
            let mut reports = framer.append(&bytes[..split]);
            reports.extend(framer.append(&bytes[split..]));
            assert_eq!(reports.len(), 1, "split at {split}");
            assert!(
                framer.counters().dropped_bytes >= 3,
                "split at {split}: dropped {}",
                framer.counters().dropped_bytes
            );
        }

        let reports = framer.append(&bytes);
        assert_eq!(reports.len(), 1);
        assert!(framer.counters().dropped_bytes >= 3);
    }

    #[test]
    fn invalid_header_length() {
        let mut bytes = encode_report(&sample_report());
        bytes[2..6].copy_from_slice(&120u32.to_be_bytes());
        let mut framer = ReportFramer::new();
        let reports = framer.append(&bytes);
        assert!(reports.is_empty());
        assert_eq!(framer.counters().invalid_report_length, 1);
    }

    #[test]
    fn false_magic_then_valid_report() {
        // A magic pair with a wrong length, immediately followed by a real
        // report: one byte is dropped per false match and the report still
        // comes out.
        let mut bytes = vec![0x28, 0x36, 0x00, 0x00, 0x00, 0x10];
        bytes.extend_from_slice(&encode_report(&sample_report()));
        let mut framer = ReportFramer::new();
        let reports = framer.append(&bytes);
        assert_eq!(reports.len(), 1);
        assert!(framer.counters().invalid_report_length >= 1);
    }

    #[test]
    fn unknown_report_type() {
        let mut bytes = encode_report(&sample_report());
        bytes[REPORT_HEADER_LEN + 0x18..REPORT_HEADER_LEN + 0x1c]
            .copy_from_slice(&0x99u32.to_le_bytes());
        let mut framer = ReportFramer::new();
        let reports = framer.append(&bytes);
        assert!(reports.is_empty());
        assert_eq!(framer.counters().unknown_report_type, 1);

        // The stream continues: a following good report still decodes.
        let reports = framer.append(&encode_report(&sample_report()));
        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn chunking_invariance() {
        let mut bytes = vec![0xde, 0xad];
        for i in 0..4u64 {
            let mut r = sample_report();
            r.hmd_time_ns = 1000 + i;
            bytes.extend_from_slice(&encode_report(&r));
            bytes.push(0x27); // stray magic candidate between frames
        }

        let mut whole = ReportFramer::new();
        let expected = whole.append(&bytes);

        for chunk_size in [1usize, 3, 7, 64, 133, 1024] {
            let mut framer = ReportFramer::new();
            let mut got = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                got.extend(framer.append(chunk));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn buffer_bound_drops_front() {
        let mut framer = ReportFramer::new();
        // Garbage with no magic pair, larger than the bound.
        let garbage = vec![0x55u8; MAX_PENDING_BYTES + 4096];
        let reports = framer.append(&garbage);
        assert!(reports.is_empty());
        assert!(framer.counters().dropped_bytes >= 4096);

        // A report arriving afterwards still parses.
        let reports = framer.append(&encode_report(&sample_report()));
        assert_eq!(reports.len(), 1);
    }
}
