// ==== Acknowledgeable record metrics ====
/// Counter for resolved records (with status label: acknowledged/failed/auto_failed)
pub const RECORDS_RESOLVED: &str = "acknowledgeable_records_resolved_total";

/// Counter for records that were auto-failed because they were dropped unresolved
pub const RECORDS_AUTO_FAILED: &str = "acknowledgeable_records_auto_failed_total";

/// Histogram for time between record creation and resolution
pub const RECORD_RESOLUTION_DURATION: &str = "acknowledgeable_record_resolution_duration_seconds";

// ==== In-flight window metrics ====
/// Counter for records emitted downstream (an in-flight slot was acquired)
pub const RECORDS_EMITTED: &str = "acknowledgement_records_emitted_total";

/// Counter for records withheld because their partition was at its in-flight limit
pub const RECORDS_WITHHELD: &str = "acknowledgement_records_withheld_total";

/// Gauge for outstanding in-flight slots per partition
pub const PARTITION_IN_FLIGHT_SLOTS: &str = "acknowledgement_partition_in_flight_slots";

/// Counter for resolutions that arrived before an earlier record of the same partition
pub const OUT_OF_ORDER_RESOLUTIONS: &str = "acknowledgement_out_of_order_resolutions_total";

/// Counter for slots resolved more than once
pub const DOUBLE_RESOLUTIONS: &str = "acknowledgement_double_resolutions_total";

/// Counter for resolutions ignored because the subscription or partition is gone
pub const IGNORED_RESOLUTIONS: &str = "acknowledgement_ignored_resolutions_total";

/// Counter for slots released by partition revocation
pub const REVOKED_SLOTS: &str = "acknowledgement_revoked_slots_total";

/// Counter for records discarded before emission (revocation or rejection)
pub const RECORDS_DISCARDED: &str = "acknowledgement_records_discarded_total";

// ==== Error bus metrics ====
/// Counter for errors injected into a subscription's error bus
pub const BUS_ERRORS_INJECTED: &str = "acknowledgement_bus_errors_injected_total";

/// Counter for injections that found no live subscription
pub const BUS_ERRORS_DETACHED: &str = "acknowledgement_bus_errors_detached_total";
