//! Receiver-side RFC 8888 congestion control feedback.
//!
//! The generator wraps every remote RTP stream, notes the arrival time of
//! each packet, and on a fixed interval writes one RTPFB (FMT 11) report
//! covering everything received since the previous report.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};
use webrtc::interceptor::stream_info::StreamInfo;
use webrtc::interceptor::{
    Attributes, Interceptor, InterceptorBuilder, RTCPReader, RTCPWriter, RTPReader, RTPWriter,
};
use webrtc::rtcp::raw_packet::RawPacket;

type InterceptorResult<T> = std::result::Result<T, webrtc::interceptor::Error>;

/// SDP feedback parameters announcing RFC 8888 support.
pub const CCFB_FEEDBACK_TYPE: &str = "ack";
pub const CCFB_FEEDBACK_PARAMETER: &str = "ccfb";

const RTPFB_PACKET_TYPE: u8 = 205;
const CCFB_FORMAT: u8 = 11;
const MAX_REPORTS_PER_SSRC: usize = 16384;
const ATO_UNAVAILABLE: u16 = 0x1FFF;
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Packets seen on one SSRC since the last report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamArrivals {
    pub ssrc: u32,
    /// Sequence number and arrival time relative to the generator's epoch.
    pub packets: Vec<(u16, Duration)>,
}

/// Encode one congestion control feedback report.
///
/// `report_time` shares the epoch of the arrival times. Streams without
/// packets are omitted. Returns `None` when nothing would be reported.
pub fn encode_report(
    sender_ssrc: u32,
    report_time: Duration,
    ntp_compact: u32,
    streams: &[StreamArrivals],
) -> Option<Bytes> {
    let blocks: Vec<(u32, u16, Vec<u16>)> = streams
        .iter()
        .filter_map(|stream| metric_blocks(stream, report_time))
        .collect();
    if blocks.is_empty() {
        return None;
    }

    let body_len: usize = blocks
        .iter()
        .map(|(_, _, metrics)| 8 + padded_len(metrics.len()) * 2)
        .sum();
    let total_len = 8 + body_len + 4;
    let mut buf = BytesMut::with_capacity(total_len);
    buf.put_u8(0x80 | CCFB_FORMAT);
    buf.put_u8(RTPFB_PACKET_TYPE);
    buf.put_u16((total_len / 4 - 1) as u16);
    buf.put_u32(sender_ssrc);
    for (ssrc, begin_seq, metrics) in &blocks {
        buf.put_u32(*ssrc);
        buf.put_u16(*begin_seq);
        buf.put_u16(metrics.len() as u16);
        for metric in metrics {
            buf.put_u16(*metric);
        }
        if metrics.len() % 2 == 1 {
            buf.put_u16(0);
        }
    }
    buf.put_u32(ntp_compact);
    Some(buf.freeze())
}

fn padded_len(count: usize) -> usize {
    count + count % 2
}

fn metric_blocks(stream: &StreamArrivals, report_time: Duration) -> Option<(u32, u16, Vec<u16>)> {
    let (reference, _) = *stream.packets.first()?;
    let offset = |seq: u16| seq.wrapping_sub(reference) as i16 as i32;
    let lowest = stream.packets.iter().map(|(seq, _)| offset(*seq)).min()?;
    let highest = stream.packets.iter().map(|(seq, _)| offset(*seq)).max()?;
    let begin_seq = reference.wrapping_add(lowest as i16 as u16);
    let count = ((highest - lowest + 1) as usize).min(MAX_REPORTS_PER_SSRC);

    let mut metrics = vec![0u16; count];
    for (seq, arrival) in &stream.packets {
        let index = seq.wrapping_sub(begin_seq) as usize;
        if index >= count || metrics[index] != 0 {
            continue;
        }
        // R=1, ECN=00 (Not-ECT), then the arrival time offset.
        metrics[index] = 0x8000 | arrival_time_offset(report_time, *arrival);
    }
    Some((stream.ssrc, begin_seq, metrics))
}

/// Offset in 1/1024 s between arrival and report, saturating below the
/// "unavailable" marker.
fn arrival_time_offset(report_time: Duration, arrival: Duration) -> u16 {
    let Some(delta) = report_time.checked_sub(arrival) else {
        return 0;
    };
    let units = delta.as_micros() * 1024 / 1_000_000;
    units.min(u128::from(ATO_UNAVAILABLE - 1)) as u16
}

/// Middle 32 bits of the 64-bit NTP timestamp for `now`.
pub fn ntp_compact(now: SystemTime) -> u32 {
    let since_unix = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs() + NTP_UNIX_OFFSET_SECS;
    let fraction = (u64::from(since_unix.subsec_nanos()) << 32) / 1_000_000_000;
    (((seconds & 0xFFFF) << 16) | (fraction >> 16)) as u32
}

#[derive(Default)]
struct ArrivalLog {
    streams: HashMap<u32, Vec<(u16, Duration)>>,
}

impl ArrivalLog {
    fn take(&mut self) -> Vec<StreamArrivals> {
        self.streams
            .iter_mut()
            .filter(|(_, packets)| !packets.is_empty())
            .map(|(ssrc, packets)| StreamArrivals {
                ssrc: *ssrc,
                packets: std::mem::take(packets),
            })
            .collect()
    }
}

/// Registers a [`CcfbGenerator`] for each peer connection.
pub struct CcfbGeneratorBuilder {
    interval: Duration,
}

impl CcfbGeneratorBuilder {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }
}

impl InterceptorBuilder for CcfbGeneratorBuilder {
    fn build(&self, id: &str) -> InterceptorResult<Arc<dyn Interceptor + Send + Sync>> {
        debug!(
            target = "peer::feedback",
            interceptor = id,
            interval_ms = self.interval.as_millis() as u64,
            "building rfc8888 feedback generator"
        );
        Ok(Arc::new(CcfbGenerator::new(self.interval)))
    }
}

pub struct CcfbGenerator {
    interval: Duration,
    sender_ssrc: u32,
    epoch: Instant,
    log: Arc<Mutex<ArrivalLog>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl CcfbGenerator {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            sender_ssrc: rand::random(),
            epoch: Instant::now(),
            log: Arc::new(Mutex::new(ArrivalLog::default())),
            ticker: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Interceptor for CcfbGenerator {
    async fn bind_rtcp_reader(
        &self,
        reader: Arc<dyn RTCPReader + Send + Sync>,
    ) -> Arc<dyn RTCPReader + Send + Sync> {
        reader
    }

    async fn bind_rtcp_writer(
        &self,
        writer: Arc<dyn RTCPWriter + Send + Sync>,
    ) -> Arc<dyn RTCPWriter + Send + Sync> {
        let mut ticker_slot = self.ticker.lock();
        if ticker_slot.is_none() {
            let log = Arc::clone(&self.log);
            let rtcp_writer = Arc::clone(&writer);
            let interval = self.interval;
            let sender_ssrc = self.sender_ssrc;
            let epoch = self.epoch;
            *ticker_slot = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let streams = log.lock().take();
                    let Some(report) = encode_report(
                        sender_ssrc,
                        epoch.elapsed(),
                        ntp_compact(SystemTime::now()),
                        &streams,
                    ) else {
                        continue;
                    };
                    let packet: Box<dyn webrtc::rtcp::packet::Packet + Send + Sync> =
                        Box::new(RawPacket(report));
                    if let Err(err) = rtcp_writer.write(&[packet], &Attributes::new()).await {
                        trace!(target = "peer::feedback", error = %err, "feedback write failed");
                    }
                }
            }));
        }
        writer
    }

    async fn bind_local_stream(
        &self,
        _info: &StreamInfo,
        writer: Arc<dyn RTPWriter + Send + Sync>,
    ) -> Arc<dyn RTPWriter + Send + Sync> {
        writer
    }

    async fn unbind_local_stream(&self, _info: &StreamInfo) {}

    async fn bind_remote_stream(
        &self,
        info: &StreamInfo,
        reader: Arc<dyn RTPReader + Send + Sync>,
    ) -> Arc<dyn RTPReader + Send + Sync> {
        self.log.lock().streams.entry(info.ssrc).or_default();
        Arc::new(ArrivalRecorder {
            parent: reader,
            ssrc: info.ssrc,
            epoch: self.epoch,
            log: Arc::clone(&self.log),
        })
    }

    async fn unbind_remote_stream(&self, info: &StreamInfo) {
        self.log.lock().streams.remove(&info.ssrc);
    }

    async fn close(&self) -> InterceptorResult<()> {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        Ok(())
    }
}

struct ArrivalRecorder {
    parent: Arc<dyn RTPReader + Send + Sync>,
    ssrc: u32,
    epoch: Instant,
    log: Arc<Mutex<ArrivalLog>>,
}

#[async_trait]
impl RTPReader for ArrivalRecorder {
    async fn read(
        &self,
        buf: &mut [u8],
        attributes: &Attributes,
    ) -> InterceptorResult<(webrtc::rtp::packet::Packet, Attributes)> {
        let (packet, attributes) = self.parent.read(buf, attributes).await?;
        let arrival = self.epoch.elapsed();
        if let Some(packets) = self.log.lock().streams.get_mut(&self.ssrc) {
            packets.push((packet.header.sequence_number, arrival));
        }
        Ok((packet, attributes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn report_marks_missing_sequence_numbers() {
        let stream = StreamArrivals {
            ssrc: 0x1122_3344,
            packets: vec![(10, ms(0)), (11, ms(500)), (13, ms(750))],
        };
        let report = encode_report(0xAABB_CCDD, ms(1000), 0x0102_0304, &[stream]).unwrap();

        assert_eq!(report.len(), 28);
        assert_eq!(&report[..4], &[0x8B, 205, 0, 6]);
        assert_eq!(&report[4..8], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&report[8..12], &[0x11, 0x22, 0x33, 0x44]);
        // begin_seq 10, four reports
        assert_eq!(&report[12..16], &[0, 10, 0, 4]);
        assert_eq!(&report[16..18], &[0x84, 0x00]);
        assert_eq!(&report[18..20], &[0x82, 0x00]);
        assert_eq!(&report[20..22], &[0x00, 0x00]);
        assert_eq!(&report[22..24], &[0x81, 0x00]);
        assert_eq!(&report[24..28], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn report_handles_sequence_wrap_and_padding() {
        let stream = StreamArrivals {
            ssrc: 7,
            packets: vec![(0, ms(10)), (65535, ms(0)), (1, ms(20))],
        };
        let report = encode_report(1, ms(20), 0, &[stream]).unwrap();

        // 8 header + 8 chunk + 3 metrics padded to 4 + 4 timestamp
        assert_eq!(report.len(), 28);
        assert_eq!(&report[12..16], &[0xFF, 0xFF, 0, 3]);
        for chunk in report[16..22].chunks(2) {
            assert_eq!(chunk[0] & 0x80, 0x80, "every packet was received");
        }
        assert_eq!(&report[22..24], &[0, 0]);
    }

    #[test]
    fn empty_streams_produce_no_report() {
        assert!(encode_report(1, ms(5), 0, &[]).is_none());
        let idle = StreamArrivals {
            ssrc: 9,
            packets: Vec::new(),
        };
        assert!(encode_report(1, ms(5), 0, &[idle]).is_none());
    }

    #[test]
    fn arrival_offset_saturates() {
        assert_eq!(arrival_time_offset(ms(1000), ms(0)), 1024);
        assert_eq!(arrival_time_offset(Duration::from_secs(60), ms(0)), 0x1FFE);
        assert_eq!(arrival_time_offset(ms(0), ms(5)), 0);
    }

    #[test]
    fn ntp_compact_uses_middle_bits() {
        let now = UNIX_EPOCH + Duration::from_millis(1_500);
        let seconds = (1 + NTP_UNIX_OFFSET_SECS) & 0xFFFF;
        assert_eq!(ntp_compact(now), ((seconds as u32) << 16) | 0x8000);
    }

    #[test]
    fn arrival_log_take_clears_packets() {
        let mut log = ArrivalLog::default();
        log.streams.insert(5, vec![(1, ms(1))]);
        log.streams.insert(6, Vec::new());
        let taken = log.take();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].ssrc, 5);
        assert!(log.take().is_empty());
        assert!(log.streams.contains_key(&5));
    }
}
