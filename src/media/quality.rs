//! Connection quality derived from WebRTC statistics.
//!
//! Every three seconds the sampler pulls the full statistics report,
//! folds it into a [`StreamMetrics`] in one pass and classifies the
//! result. It holds only a weak reference to the peer connection, so a
//! torn-down session ends the loop on the next tick.

use std::collections::HashMap;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;
use webrtc::ice::candidate::{CandidatePairState, CandidateType};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::{StatsReport, StatsReportType};

use crate::events::{AppEvent, EventSender};
use crate::models::{ConnectionQuality, QualityLevel, TransportPath};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(3);

/// Raw numbers pulled from one statistics report. Loss counters come
/// from the remote receiver reports on our outbound video; bytes from
/// local inbound video.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamMetrics {
    pub video_packets_received: u64,
    pub video_packets_lost: i64,
    pub video_bytes_received: u64,
    pub round_trip_time_ms: f64,
    pub transport_path: TransportPath,
}

/// Succeeded candidate pair reduced to what the selection rule needs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairSummary {
    pub path: TransportPath,
    pub nominated: bool,
    pub rtt_seconds: f64,
}

/// One pass over the report. Candidate pairs are resolved against the
/// local candidate table to learn their transport path.
pub fn collect_metrics(report: &StatsReport) -> StreamMetrics {
    let mut metrics = StreamMetrics::default();
    let mut locals: HashMap<&str, CandidateType> = HashMap::new();
    let mut succeeded: Vec<(&str, bool, f64)> = Vec::new();

    for stats in report.reports.values() {
        match stats {
            StatsReportType::LocalCandidate(c) => {
                locals.insert(c.id.as_str(), c.candidate_type);
            }
            StatsReportType::CandidatePair(p) if p.state == CandidatePairState::Succeeded => {
                succeeded.push((
                    p.local_candidate_id.as_str(),
                    p.nominated,
                    p.current_round_trip_time,
                ));
            }
            StatsReportType::InboundRTP(inbound) if inbound.kind == "video" => {
                metrics.video_bytes_received += inbound.bytes_received;
            }
            StatsReportType::RemoteInboundRTP(remote) if remote.kind == "video" => {
                metrics.video_packets_received += remote.packets_received;
                metrics.video_packets_lost += remote.packets_lost;
            }
            _ => {}
        }
    }

    let pairs: Vec<PairSummary> = succeeded
        .into_iter()
        .map(|(local_id, nominated, rtt_seconds)| PairSummary {
            path: locals
                .get(local_id)
                .copied()
                .map(path_for_candidate)
                .unwrap_or(TransportPath::Unknown),
            nominated,
            rtt_seconds,
        })
        .collect();
    if let Some((path, rtt_ms)) = select_pair(&pairs) {
        metrics.transport_path = path;
        metrics.round_trip_time_ms = rtt_ms;
    }

    metrics
}

fn path_for_candidate(candidate_type: CandidateType) -> TransportPath {
    match candidate_type {
        CandidateType::Relay => TransportPath::Relayed,
        CandidateType::ServerReflexive | CandidateType::PeerReflexive => TransportPath::NatTraversed,
        CandidateType::Host => TransportPath::Direct,
        CandidateType::Unspecified => TransportPath::Unknown,
    }
}

/// Deterministic winner among succeeded pairs: the most pessimistic
/// transport path first (any relay means relayed), nominated pairs over
/// non-nominated, then the lower round trip time. Returns the path and
/// the winner's RTT in milliseconds.
pub fn select_pair(pairs: &[PairSummary]) -> Option<(TransportPath, f64)> {
    let mut winner: Option<PairSummary> = None;
    for &pair in pairs {
        winner = Some(match winner {
            None => pair,
            Some(current) => better_pair(current, pair),
        });
    }
    winner.map(|p| (p.path, p.rtt_seconds * 1000.0))
}

fn better_pair(a: PairSummary, b: PairSummary) -> PairSummary {
    if a.path != b.path {
        return if b.path > a.path { b } else { a };
    }
    if a.nominated != b.nominated {
        return if b.nominated { b } else { a };
    }
    if b.rtt_seconds < a.rtt_seconds {
        b
    } else {
        a
    }
}

/// Classify a metrics snapshot. Bitrate is the average since the
/// sampler started, not a per-interval rate.
pub fn classify(metrics: &StreamMetrics, elapsed: Duration) -> ConnectionQuality {
    let packet_loss_percent = if metrics.video_packets_received > 0 {
        metrics.video_packets_lost.max(0) as f64 / metrics.video_packets_received as f64 * 100.0
    } else {
        0.0
    };
    let bitrate_kbps = if elapsed.as_secs_f64() > 0.0 {
        metrics.video_bytes_received as f64 * 8.0 / 1000.0 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    let rtt = metrics.round_trip_time_ms;

    let quality = if packet_loss_percent > 5.0 || rtt > 300.0 {
        QualityLevel::Poor
    } else if packet_loss_percent > 2.0 || rtt > 200.0 {
        QualityLevel::Fair
    } else if packet_loss_percent > 1.0 || rtt > 100.0 {
        QualityLevel::Good
    } else {
        QualityLevel::Excellent
    };

    ConnectionQuality {
        quality,
        transport_path: metrics.transport_path,
        packet_loss_percent,
        round_trip_time_ms: rtt,
        bitrate_kbps,
    }
}

/// Periodic sampler for a live session. Ends on its own when the peer
/// connection is dropped or nobody watches the output anymore.
pub fn spawn_sampler(
    pc: Weak<RTCPeerConnection>,
    quality_tx: watch::Sender<Option<ConnectionQuality>>,
    event_tx: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = tokio::time::Instant::now();
        let mut ticker = interval(SAMPLE_INTERVAL);
        // The first tick fires immediately; skip it so the first sample
        // has a full interval behind it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pc) = pc.upgrade() else { break };
            let report = pc.get_stats().await;
            drop(pc);
            let snapshot = classify(&collect_metrics(&report), started.elapsed());
            if quality_tx.send(Some(snapshot.clone())).is_err() {
                break;
            }
            let _ = event_tx.send(AppEvent::QualityUpdated(snapshot));
        }
        debug!("Quality sampler stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(received: u64, lost: i64, rtt_ms: f64) -> StreamMetrics {
        StreamMetrics {
            video_packets_received: received,
            video_packets_lost: lost,
            video_bytes_received: 0,
            round_trip_time_ms: rtt_ms,
            transport_path: TransportPath::Direct,
        }
    }

    #[test]
    fn ten_percent_loss_is_poor() {
        let q = classify(&metrics(100, 10, 50.0), Duration::from_secs(9));
        assert_eq!(q.packet_loss_percent, 10.0);
        assert_eq!(q.quality, QualityLevel::Poor);
    }

    #[test]
    fn clean_low_latency_is_excellent() {
        let q = classify(&metrics(1000, 0, 50.0), Duration::from_secs(9));
        assert_eq!(q.quality, QualityLevel::Excellent);
        assert_eq!(q.packet_loss_percent, 0.0);
    }

    #[test]
    fn ladder_thresholds() {
        let nine = Duration::from_secs(9);
        assert_eq!(classify(&metrics(0, 0, 150.0), nine).quality, QualityLevel::Good);
        assert_eq!(classify(&metrics(0, 0, 250.0), nine).quality, QualityLevel::Fair);
        assert_eq!(classify(&metrics(0, 0, 350.0), nine).quality, QualityLevel::Poor);
        assert_eq!(classify(&metrics(1000, 15, 0.0), nine).quality, QualityLevel::Good);
        assert_eq!(classify(&metrics(1000, 30, 0.0), nine).quality, QualityLevel::Fair);
    }

    #[test]
    fn no_packets_means_zero_loss_not_an_error() {
        let q = classify(&metrics(0, 0, 0.0), Duration::from_secs(3));
        assert_eq!(q.packet_loss_percent, 0.0);
        assert_eq!(q.quality, QualityLevel::Excellent);
    }

    #[test]
    fn negative_lost_counter_clamps_to_zero() {
        let q = classify(&metrics(100, -5, 0.0), Duration::from_secs(3));
        assert_eq!(q.packet_loss_percent, 0.0);
    }

    #[test]
    fn bitrate_averages_over_elapsed_time() {
        let m = StreamMetrics {
            video_bytes_received: 375_000,
            ..Default::default()
        };
        let q = classify(&m, Duration::from_secs(10));
        assert!((q.bitrate_kbps - 300.0).abs() < f64::EPSILON);
    }

    #[test]
    fn relay_pair_wins_regardless_of_order() {
        let host = PairSummary {
            path: TransportPath::Direct,
            nominated: true,
            rtt_seconds: 0.010,
        };
        let relay = PairSummary {
            path: TransportPath::Relayed,
            nominated: false,
            rtt_seconds: 0.080,
        };
        let (path, rtt) = select_pair(&[host, relay]).unwrap();
        assert_eq!(path, TransportPath::Relayed);
        assert!((rtt - 80.0).abs() < f64::EPSILON);
        let (path, _) = select_pair(&[relay, host]).unwrap();
        assert_eq!(path, TransportPath::Relayed);
    }

    #[test]
    fn nominated_breaks_ties_within_a_path() {
        let a = PairSummary {
            path: TransportPath::NatTraversed,
            nominated: false,
            rtt_seconds: 0.020,
        };
        let b = PairSummary {
            path: TransportPath::NatTraversed,
            nominated: true,
            rtt_seconds: 0.045,
        };
        let (_, rtt) = select_pair(&[a, b]).unwrap();
        assert!((rtt - 45.0).abs() < f64::EPSILON);
    }

    #[test]
    fn no_succeeded_pairs_leaves_defaults() {
        assert_eq!(select_pair(&[]), None);
        let m = StreamMetrics::default();
        let q = classify(&m, Duration::from_secs(3));
        assert_eq!(q.transport_path, TransportPath::Unknown);
        assert_eq!(q.round_trip_time_ms, 0.0);
    }
}
