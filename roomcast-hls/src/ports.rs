//! RTP/RTCP port pool

use crate::error::{HlsError, Result};
use crate::types::{ParticipantId, PortPair, UserPorts};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Upper bound of the random start offset (inclusive, always even)
const MAX_RANDOM_OFFSET: u16 = 98;

/// Tracks which ports of `[base_port, max_port)` are handed out
///
/// Ports are drawn by a linear scan from the base, so the lowest free port
/// always wins. The allocator is cheap to share: one instance can serve every
/// room of the process.
#[derive(Debug)]
pub struct PortAllocator {
    base_port: u16,
    max_port: u16,
    allocated: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Create a pool whose base is shifted by a random even offset
    ///
    /// The shift lowers the odds of colliding with sockets a just-killed
    /// transcoder has not released yet.
    #[must_use]
    pub fn new(base_port: u16, max_port: u16) -> Self {
        let span = max_port.saturating_sub(base_port);
        // keep room for at least one participant above the shifted base
        let max_steps = MAX_RANDOM_OFFSET.min(span.saturating_sub(4)) / 2;
        let offset = rand::thread_rng().gen_range(0..=max_steps) * 2;
        Self::with_offset(base_port, max_port, offset)
    }

    /// Create a pool with an explicit base offset
    ///
    /// The shifted base is rounded up to an even port: pairs are handed out
    /// two slots at a time from the base, so this keeps every RTP port even.
    #[must_use]
    pub fn with_offset(base_port: u16, max_port: u16, offset: u16) -> Self {
        let base = base_port.saturating_add(offset);
        let base = base.saturating_add(base % 2);
        info!(
            base_port = base,
            max_port,
            offset,
            "Port allocator initialized"
        );
        Self {
            base_port: base,
            max_port,
            allocated: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub const fn base_port(&self) -> u16 {
        self.base_port
    }

    #[must_use]
    pub const fn max_port(&self) -> u16 {
        self.max_port
    }

    /// Reserve a video and an audio pair for every participant, in order
    ///
    /// Either every participant gets its ports or none does: on exhaustion
    /// the ports taken by this call are returned before the error surfaces.
    pub fn allocate_for_participants(&self, ids: &[ParticipantId]) -> Result<Vec<UserPorts>> {
        let mut allocated = self.allocated.lock();
        let mut taken = Vec::with_capacity(ids.len() * 4);

        let result = ids
            .iter()
            .map(|id| {
                let video = self.allocate_pair(&mut allocated, &mut taken)?;
                let audio = self.allocate_pair(&mut allocated, &mut taken)?;
                Ok(UserPorts {
                    participant_id: id.clone(),
                    video,
                    audio,
                })
            })
            .collect::<Result<Vec<_>>>();

        match result {
            Ok(user_ports) => {
                debug!(
                    participants = ids.len(),
                    allocated = allocated.len(),
                    "Allocated participant ports"
                );
                Ok(user_ports)
            }
            Err(e) => {
                for port in taken {
                    allocated.remove(&port);
                }
                Err(e)
            }
        }
    }

    fn allocate_pair(
        &self,
        allocated: &mut BTreeSet<u16>,
        taken: &mut Vec<u16>,
    ) -> Result<PortPair> {
        let rtp = self.allocate_single(allocated)?;
        taken.push(rtp);
        let rtcp = self.allocate_single(allocated)?;
        taken.push(rtcp);
        Ok(PortPair { rtp, rtcp })
    }

    fn allocate_single(&self, allocated: &mut BTreeSet<u16>) -> Result<u16> {
        let port = (self.base_port..self.max_port)
            .find(|port| !allocated.contains(port))
            .ok_or(HlsError::PortExhaustion {
                base: self.base_port,
                max: self.max_port,
            })?;
        allocated.insert(port);
        Ok(port)
    }

    /// Return the four ports of one participant; unknown ports are ignored
    pub fn release_for_participant(&self, user_ports: &UserPorts) {
        let mut allocated = self.allocated.lock();
        for port in user_ports.ports() {
            allocated.remove(&port);
        }
        debug!(
            participant_id = %user_ports.participant_id,
            remaining = allocated.len(),
            "Released participant ports"
        );
    }

    /// Return every port of the pool
    pub fn release_all(&self) {
        self.allocated.lock().clear();
        debug!("Released all ports");
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn ids(names: &[&str]) -> Vec<ParticipantId> {
        names.iter().map(|n| ParticipantId::from(*n)).collect()
    }

    #[test]
    fn test_random_offset_is_even_and_bounded() {
        for _ in 0..50 {
            let pool = PortAllocator::new(20000, 21000);
            let offset = pool.base_port() - 20000;
            assert_eq!(offset % 2, 0);
            assert!(offset <= MAX_RANDOM_OFFSET);
        }
    }

    #[test]
    fn test_random_offset_respects_small_ranges() {
        let pool = PortAllocator::new(20000, 20004);
        assert_eq!(pool.base_port(), 20000);
        assert!(pool.allocate_for_participants(&ids(&["a"])).is_ok());
    }

    #[test]
    fn test_odd_base_is_rounded_up_to_even() {
        let pool = PortAllocator::with_offset(30001, 30100, 0);
        assert_eq!(pool.base_port(), 30002);

        let pool = PortAllocator::with_offset(30001, 30100, 4);
        assert_eq!(pool.base_port(), 30006);

        let ports = pool.allocate_for_participants(&ids(&["a", "b"])).unwrap();
        for user in &ports {
            for pair in [user.video, user.audio] {
                assert_eq!(pair.rtp % 2, 0, "{pair:?}");
                assert_eq!(pair.rtcp, pair.rtp + 1);
            }
        }
    }

    #[test]
    fn test_allocation_order_and_layout() {
        let pool = PortAllocator::with_offset(20000, 21000, 0);
        let ports = pool.allocate_for_participants(&ids(&["a", "b"])).unwrap();

        assert_eq!(ports[0].participant_id.as_str(), "a");
        assert_eq!(ports[0].video, PortPair { rtp: 20000, rtcp: 20001 });
        assert_eq!(ports[0].audio, PortPair { rtp: 20002, rtcp: 20003 });
        assert_eq!(ports[1].participant_id.as_str(), "b");
        assert_eq!(ports[1].video, PortPair { rtp: 20004, rtcp: 20005 });
        assert_eq!(pool.allocated_count(), 8);
    }

    #[test]
    fn test_ports_never_repeat_without_release() {
        let pool = PortAllocator::with_offset(20000, 21000, 0);
        let mut seen = HashSet::new();

        for round in 0..10 {
            let names: Vec<String> = (0..3).map(|i| format!("p{round}-{i}")).collect();
            let ids: Vec<ParticipantId> = names.iter().map(|n| n.as_str().into()).collect();
            for user in pool.allocate_for_participants(&ids).unwrap() {
                for port in user.ports() {
                    assert!(seen.insert(port), "port {port} handed out twice");
                }
            }
        }
        assert_eq!(seen.len(), 120);
    }

    #[test]
    fn test_release_all_allows_reuse() {
        let pool = PortAllocator::with_offset(20000, 21000, 0);
        let first = pool.allocate_for_participants(&ids(&["a"])).unwrap();
        pool.release_all();
        assert_eq!(pool.allocated_count(), 0);

        let second = pool.allocate_for_participants(&ids(&["a"])).unwrap();
        assert_eq!(first[0].ports(), second[0].ports());
    }

    #[test]
    fn test_exhaustion_on_first_overflowing_allocation() {
        // room for exactly two participants
        let pool = PortAllocator::with_offset(20000, 20008, 0);
        pool.allocate_for_participants(&ids(&["a"])).unwrap();
        pool.allocate_for_participants(&ids(&["b"])).unwrap();
        assert_eq!(pool.allocated_count(), 8);

        let err = pool.allocate_for_participants(&ids(&["c"])).unwrap_err();
        assert!(matches!(
            err,
            HlsError::PortExhaustion {
                base: 20000,
                max: 20008
            }
        ));
        assert_eq!(pool.allocated_count(), 8);
    }

    #[test]
    fn test_failed_batch_rolls_back() {
        let pool = PortAllocator::with_offset(20000, 20010, 0);
        assert!(pool.allocate_for_participants(&ids(&["a", "b", "c"])).is_err());
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn test_release_for_participant_is_idempotent() {
        let pool = PortAllocator::with_offset(20000, 21000, 0);
        let ports = pool.allocate_for_participants(&ids(&["a", "b"])).unwrap();

        pool.release_for_participant(&ports[0]);
        assert_eq!(pool.allocated_count(), 4);
        pool.release_for_participant(&ports[0]);
        assert_eq!(pool.allocated_count(), 4);

        // freed low ports are handed out first again
        let again = pool.allocate_for_participants(&ids(&["c"])).unwrap();
        assert_eq!(again[0].ports(), ports[0].ports());
    }
}
