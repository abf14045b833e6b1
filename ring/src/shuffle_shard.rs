use std::collections::BTreeSet;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::{search_token, Ring, RingDesc};

/// The deterministic seed for a tenant's selection within one zone.
///
/// Combining tenant and zone keeps a tenant's subring stable while still
/// drawing independent picks per zone.
pub fn shuffle_shard_seed(tenant: &str, zone: &str) -> u64 {
    crate::stable_hash64(&format!("{tenant}\u{0}{zone}"))
}

/// Number of instances to select per zone for the requested shard size.
pub fn shard_size_per_zone(shard_size: usize, zones: usize) -> usize {
    shard_size.div_ceil(zones).max(1)
}

impl Ring {
    /// Deterministic subset selection for one tenant: the tenant's
    /// "subring".
    ///
    /// `shard_size == 0` (or a size covering every instance) selects the
    /// full ring. Selection is balanced across zones and idempotent: the
    /// same tenant and topology always yield the same subring.
    pub fn shuffle_shard(&self, tenant: &str, shard_size: usize) -> Self {
        let desc = self.desc();
        if shard_size == 0 || shard_size >= desc.instances.len() {
            return self.with_state(desc);
        }

        let zones: Vec<String> = desc.zones().into_iter().map(str::to_owned).collect();
        let per_zone = shard_size_per_zone(shard_size, zones.len());

        let mut selected = RingDesc::default();
        for zone in &zones {
            let zone_tokens: Vec<(u32, String)> = desc
                .token_table()
                .into_iter()
                .filter(|(_, id)| desc.instances[id.as_str()].zone == *zone)
                .collect();
            if zone_tokens.is_empty() {
                continue;
            }

            let mut rng = SmallRng::seed_from_u64(shuffle_shard_seed(tenant, zone));
            let mut picked: BTreeSet<String> = BTreeSet::new();
            let zone_instances = desc
                .instances
                .values()
                .filter(|i| i.zone == *zone)
                .count();

            while picked.len() < per_zone.min(zone_instances) {
                let r: u32 = rng.gen();
                let mut idx = search_token(&zone_tokens, r);
                // Walk clockwise past instances already picked so every
                // draw contributes a new member.
                for _ in 0..zone_tokens.len() {
                    let (_, id) = &zone_tokens[idx];
                    if !picked.contains(id) {
                        picked.insert(id.clone());
                        selected.upsert(desc.instances[id.as_str()].clone());
                        break;
                    }
                    idx = (idx + 1) % zone_tokens.len();
                }
            }
        }

        self.with_state(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::test_util::{active_instance, ring_with};
    use crate::RingConfig;

    fn three_zone_ring() -> Ring {
        ring_with(
            RingConfig {
                replication_factor: 3,
                zone_awareness_enabled: true,
                ..Default::default()
            },
            (0..9).map(|i| {
                let zone = ["a", "b", "c"][i % 3];
                active_instance(
                    &format!("i{i}"),
                    zone,
                    vec![(i as u32 + 1) * 1_000, (i as u32 + 1) * 100_000],
                )
            }),
        )
    }

    #[test]
    fn test_zero_shard_size_selects_full_ring() {
        let ring = three_zone_ring();
        let sub = ring.shuffle_shard("tenant-1", 0);
        assert_eq!(sub.instance_count(), 9);
    }

    #[test]
    fn test_shuffle_shard_is_deterministic() {
        let ring = three_zone_ring();
        let a = ring.shuffle_shard("tenant-1", 3);
        let b = ring.shuffle_shard("tenant-1", 3);
        assert_eq!(a.desc(), b.desc());
    }

    #[test]
    fn test_shuffle_shard_balances_zones() {
        let ring = three_zone_ring();
        let sub = ring.shuffle_shard("tenant-1", 3);
        assert_eq!(sub.instance_count(), 3);

        let desc = sub.desc();
        for zone in ["a", "b", "c"] {
            assert_eq!(
                desc.instances.values().filter(|i| i.zone == zone).count(),
                1,
                "zone {zone} not represented exactly once"
            );
        }
    }

    #[test]
    fn test_different_tenants_get_different_subrings() {
        let ring = three_zone_ring();
        let picks: BTreeSet<String> = (0..50)
            .flat_map(|t| {
                ring.shuffle_shard(&format!("tenant-{t}"), 3)
                    .desc()
                    .instances
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        // Across many tenants the selection spreads over the whole ring.
        assert!(picks.len() > 3, "shuffle sharding never varied");
    }

    #[test]
    fn test_shard_size_per_zone() {
        assert_eq!(shard_size_per_zone(3, 3), 1);
        assert_eq!(shard_size_per_zone(4, 3), 2);
        assert_eq!(shard_size_per_zone(1, 3), 1);
    }
}
