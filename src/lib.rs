/*!
dedupdog administers host-local deduplication storage services: a dedup index
server and a deduplicating device-mapper target, each layered on an LVM
logical volume. It drives the external tools (`lvcreate`, `dmsetup`,
`modprobe`, the index and formatter binaries) through a uniform
create/start/stop/remove lifecycle and records every managed service in a
locked, schema-versioned configuration file so operations are idempotent and
recoverable across invocations.

All mutating operations hold an exclusive advisory lock on a lock file for
their whole read-modify-write window; read-only queries take a shared lock.
A `--no-run` mode previews every external command without executing it.
*/

pub mod command;
pub mod config;
pub mod defaults;
pub mod error;
pub mod extensions;
pub mod lock;
pub mod lvm;
pub mod service;
pub mod size;

/// Name of the deduplicating device-mapper target type.
pub const DM_TARGET_TYPE: &str = "dedupe";

/// Kernel module providing the device-mapper target.
pub const KERNEL_MODULE: &str = "kdedupe";

// External tools are looked up on PATH; LVM installs them in different
// places across distributions.
pub const DMSETUP_BIN: &str = "dmsetup";
pub const LVCHANGE_BIN: &str = "lvchange";
pub const LVCREATE_BIN: &str = "lvcreate";
pub const LVEXTEND_BIN: &str = "lvextend";
pub const LVREDUCE_BIN: &str = "lvreduce";
pub const LVREMOVE_BIN: &str = "lvremove";
pub const LVS_BIN: &str = "lvs";
pub const VGS_BIN: &str = "vgs";

/// Formats a backing volume as a dedup target.
pub const FORMAT_BIN: &str = "dedupformat";
/// Prints verbose statistics for a running dedup target.
pub const STATS_BIN: &str = "dedupstats";

/// Creates an on-disk dedup index.
pub const INDEX_CREATE_BIN: &str = "dedupindex-create";
/// The dedup index server daemon.
pub const INDEX_SERVER_BIN: &str = "dedupindex-server";
/// Pings a running index server.
pub const INDEX_PING_BIN: &str = "dedupindex-ping";
