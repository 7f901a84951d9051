/// Max engines (tenant databases) per process.
pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 4096;

pub const MAX_SLOTS_PER_SHIFT: usize = 64;
pub const MAX_ALLOCATIONS_PER_TIMETABLE: usize = 100_000;

/// Max days (or allocation ids) handled by one bulk call.
pub const MAX_BATCH_SIZE: usize = 64;

/// Max ids in a single `IN (...)` list.
pub const MAX_IN_CLAUSE_IDS: usize = 1000;
