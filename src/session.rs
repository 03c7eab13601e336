use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::packet::{self, DecodeError, ProbeResult, Timestamp};
use crate::transport::Transport;

const RECV_BUF_SIZE: usize = 1024;

pub struct SessionConfig {
    /// Number of probes to send. Zero is legal and yields an empty summary.
    pub count: u32,
    /// Pause between consecutive probes.
    pub interval: Duration,
    /// Bound on each receive wait; expiry counts toward loss.
    pub timeout: Duration,
    /// Count any inbound datagram as received, before validation. Off by
    /// default: the received counter then only reflects validated replies,
    /// so foreign traffic on the shared raw socket cannot inflate it.
    pub count_unvalidated: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SessionStats {
    pub transmitted: u32,
    pub received: u32,
}

impl SessionStats {
    pub fn loss_percent(&self) -> u32 {
        if self.transmitted == 0 {
            return 0;
        }
        (self.transmitted - self.received) * 100 / self.transmitted
    }
}

/// Per-probe outcomes, rendered by the console in `main`. Recorded by a
/// plain collector in tests.
pub trait Report {
    fn probe(&mut self, result: &ProbeResult);
    fn discard(&mut self, sequence: u16, reason: &DecodeError);
    fn timeout(&mut self, sequence: u16);
    fn transport_error(&mut self, err: &io::Error);
}

/// Drives the probe loop: send, bounded wait, decode, report, sleep.
/// Owns the transport and the session identifier for its whole lifetime;
/// single-threaded, one probe in flight at a time.
pub struct Session<T: Transport> {
    transport: T,
    identifier: u16,
    sequence: u16,
    config: SessionConfig,
    running: Arc<AtomicBool>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, identifier: u16, config: SessionConfig, running: Arc<AtomicBool>) -> Self {
        Session {
            transport,
            identifier,
            sequence: 0,
            config,
            running,
        }
    }

    /// Run the configured number of probes (or fewer, if the interrupt
    /// flag clears) and return the final counters. Nothing in here aborts
    /// the session: send failures, timeouts and malformed datagrams are
    /// all reported and the loop moves on.
    pub fn run(&mut self, report: &mut dyn Report, mut sleep: impl FnMut(Duration)) -> SessionStats {
        let mut stats = SessionStats::default();

        for probe in 0..self.config.count {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            self.sequence = self.sequence.wrapping_add(1);
            stats.transmitted += 1;

            let request = packet::build_echo_request(self.identifier, self.sequence, Timestamp::now());

            match self.transport.send(&request) {
                Err(e) => report.transport_error(&e),
                Ok(()) => self.receive_reply(&mut stats, report),
            }

            if probe + 1 < self.config.count {
                sleep(self.config.interval);
            }
        }

        stats
    }

    fn receive_reply(&mut self, stats: &mut SessionStats, report: &mut dyn Report) {
        // Fresh buffer per receive; nothing aliases it across iterations.
        let mut buf = [0u8; RECV_BUF_SIZE];

        match self.transport.recv(&mut buf, self.config.timeout) {
            Err(e) if is_timeout(&e) => report.timeout(self.sequence),
            Err(e) => report.transport_error(&e),
            Ok((bytes, source)) => {
                if self.config.count_unvalidated {
                    stats.received += 1;
                }

                let now = Timestamp::now();
                match packet::parse_echo_reply(&buf[..bytes], self.identifier, now, source) {
                    Ok(result) => {
                        if !self.config.count_unvalidated {
                            stats.received += 1;
                        }
                        report.probe(&result);
                    }
                    Err(reason) => report.discard(self.sequence, &reason),
                }
            }
        }
    }
}

// SO_RCVTIMEO expiry surfaces as EAGAIN on Linux, TimedOut elsewhere
fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}
