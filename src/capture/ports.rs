//! Even/odd UDP port pairs for the RTP tap (RTP on the even port, RTCP on the
//! next one).

use crate::config::CaptureConfig;
use crate::error::{RoomError, RoomResult};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Arc;
use tracing::debug;

struct AllocatorInner {
    bind_ip: IpAddr,
    min: u16,
    max: u16,
    max_attempts: u32,
    leased: Mutex<HashSet<u16>>,
}

/// Process-wide allocator. Clones share the same lease table.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<AllocatorInner>,
}

/// A reserved port pair. The pair goes back to the pool when dropped.
pub struct PortLease {
    pub audio_port: u16,
    pub rtcp_port: u16,
    inner: Arc<AllocatorInner>,
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease")
            .field("audio_port", &self.audio_port)
            .field("rtcp_port", &self.rtcp_port)
            .finish()
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.inner.leased.lock().remove(&self.audio_port);
    }
}

impl PortAllocator {
    pub fn new(bind_ip: IpAddr, min: u16, max: u16, max_attempts: u32) -> RoomResult<Self> {
        if min > max || max == 0 {
            return Err(RoomError::InvalidArgument(format!(
                "invalid capture port range [{min}, {max}]"
            )));
        }
        if first_even(min).map_or(true, |port| port >= max) {
            return Err(RoomError::InvalidArgument(format!(
                "capture port range [{min}, {max}] has no even/odd pair"
            )));
        }

        Ok(Self {
            inner: Arc::new(AllocatorInner {
                bind_ip,
                min,
                max,
                max_attempts: max_attempts.max(1),
                leased: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn from_config(config: &CaptureConfig) -> RoomResult<Self> {
        let bind_ip = config
            .listen_ip
            .parse()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        Self::new(
            bind_ip,
            config.port_min,
            config.port_max,
            config.max_port_attempts,
        )
    }

    /// Binds and immediately releases a UDP socket on `port`.
    pub fn is_port_available(&self, port: u16) -> bool {
        UdpSocket::bind((self.inner.bind_ip, port)).is_ok()
    }

    /// Draws uniformly random even ports from the range until one is free
    /// together with its successor, giving up after the configured number of
    /// attempts.
    pub fn allocate_even_pair(&self) -> RoomResult<PortLease> {
        let inner = &self.inner;
        let first = first_even(inner.min).unwrap_or(inner.min);
        // Last even port whose RTCP successor still fits in the range.
        let last = if inner.max % 2 == 0 {
            inner.max - 2
        } else {
            inner.max - 1
        };
        let slots = u32::from((last - first) / 2) + 1;

        let mut rng = rand::thread_rng();
        for attempt in 1..=inner.max_attempts {
            let audio_port = first + (rng.gen_range(0..slots) * 2) as u16;
            let rtcp_port = audio_port + 1;

            if inner.leased.lock().contains(&audio_port) {
                continue;
            }
            if !self.is_port_available(audio_port) || !self.is_port_available(rtcp_port) {
                debug!("port pair {}/{} busy (attempt {})", audio_port, rtcp_port, attempt);
                continue;
            }

            if inner.leased.lock().insert(audio_port) {
                return Ok(PortLease {
                    audio_port,
                    rtcp_port,
                    inner: Arc::clone(inner),
                });
            }
        }

        Err(RoomError::PortExhausted {
            min: inner.min,
            max: inner.max,
            attempts: inner.max_attempts,
        })
    }
}

fn first_even(min: u16) -> Option<u16> {
    if min % 2 == 0 {
        Some(min)
    } else {
        min.checked_add(1)
    }
}
