use std::hash::Hasher;

use data_types::{Labels, TenantId};
use twox_hash::XxHash32;

/// Separator fed between hashed components, a byte that cannot occur in
/// UTF-8 input.
const SEPARATOR: [u8; 1] = [0xff];

/// The ring token of a series: an order-sensitive 32-bit hash over the
/// tenant and each (name, value) pair of the canonical (sorted,
/// empty-values-stripped) label set.
///
/// Stable across processes; a tested invariant.
pub fn shard_by_all_labels(tenant: &TenantId, labels: &Labels) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(tenant.as_str().as_bytes());
    for label in labels.iter() {
        if label.value.is_empty() {
            continue;
        }
        hasher.write(&SEPARATOR);
        hasher.write(label.name.as_bytes());
        hasher.write(&SEPARATOR);
        hasher.write(label.value.as_bytes());
    }
    hasher.finish() as u32
}

/// The ring token of a metric's metadata.
pub fn shard_by_metric_name(tenant: &TenantId, metric_name: &str) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(tenant.as_str().as_bytes());
    hasher.write(&SEPARATOR);
    hasher.write(metric_name.as_bytes());
    hasher.finish() as u32
}

/// The ring token of the tenant itself, used for subring seeds and
/// whole-tenant ownership.
pub fn shard_by_tenant(tenant: &TenantId) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(tenant.as_str().as_bytes());
    hasher.finish() as u32
}
