//! Messaging versions observed by the serializers.

/// Legacy baseline: no row filters, length-prefixed predicates.
pub const VERSION_10: u32 = 10;
/// Adds row filters and paging flags to range-slice commands.
pub const VERSION_11: u32 = 11;
/// Sub-objects self-describe their length; explicit prefixes dropped.
pub const VERSION_12: u32 = 12;
/// Tree requests carry `gc_before`.
pub const VERSION_20: u32 = 20;

pub const CURRENT_VERSION: u32 = VERSION_20;
