// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashSet;

use rand::Rng;

/// IEEE company identifier used by the LIO userspace tools for
/// locally generated unit serials.
pub const NAA_PREFIX: &str = "5001405";

pub fn generate_serial<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!("{}{:09x}", NAA_PREFIX, rng.gen::<u32>())
}

pub fn wwpn_from_serial(serial: &str) -> String {
    format!("naa.{serial}")
}

/// Hands out serials that are unique for the lifetime of the allocator.
///
/// The random part only carries 32 bits, so draws are checked against
/// everything handed out before and redrawn on collision.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    used: HashSet<String>,
}

impl SerialAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate<R: Rng + ?Sized>(&mut self, rng: &mut R) -> String {
        loop {
            let serial = generate_serial(rng);
            if self.used.insert(serial.clone()) {
                return serial;
            }
        }
    }

    /// Makes `serial` available again once its export is gone.
    pub fn release(&mut self, serial: &str) {
        self.used.remove(serial);
    }

    pub fn len(&self) -> usize {
        self.used.len()
    }

    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::mock::StepRng;
    use rand::thread_rng;

    use super::*;

    #[test]
    fn test_serial_format() {
        let serial = generate_serial(&mut StepRng::new(0x43a8_fbf4, 0));
        assert_eq!(serial, "5001405043a8fbf4");
        assert_eq!(wwpn_from_serial(&serial), "naa.5001405043a8fbf4");

        let serial = generate_serial(&mut thread_rng());
        assert!(serial.starts_with(NAA_PREFIX));
        assert_eq!(serial.len(), NAA_PREFIX.len() + 9);
        assert!(serial.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_allocator_redraws_collisions() {
        // A constant generator: the second draw collides with the first
        // until the step moves it along.
        let mut rng = StepRng::new(7, 0);
        let mut serials = SerialAllocator::new();
        let first = serials.allocate(&mut rng);

        let mut rng = StepRng::new(7, 1);
        let second = serials.allocate(&mut rng);
        assert_ne!(first, second);
        assert_eq!(serials.len(), 2);

        serials.release(&first);
        assert_eq!(serials.len(), 1);
    }

    #[test]
    fn test_wwpns_pairwise_distinct() {
        let mut rng = thread_rng();
        let mut serials = SerialAllocator::new();
        let wwpns: HashSet<String> = (0..10_000)
            .map(|_| wwpn_from_serial(&serials.allocate(&mut rng)))
            .collect();
        assert_eq!(wwpns.len(), 10_000);
    }
}
