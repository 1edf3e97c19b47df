/*!
dedupdog is the command-line manager for host-local deduplication storage.
`create` carves an index volume and a backing volume out of a volume group,
brings up an index server, formats the backing volume, and sets up the
deduplicating device-mapper target; the remaining subcommands drive the
recorded services through their lifecycle. Every invocation serializes on a
lock file, and `--no-run` previews the external commands without executing
anything.
*/

#[macro_use]
extern crate log;

use argh::FromArgs;
use dedupdog::command::RunnerConfig;
use dedupdog::config::{Configuration, OpenOptions};
use dedupdog::defaults;
use dedupdog::error::{self, Result};
use dedupdog::extensions::Extensions;
use dedupdog::lvm::LogicalVolume;
use dedupdog::service::{
    IndexService, KernelModuleService, Outcome, Service, StartOptions, TargetService,
};
use dedupdog::size::Size;
use simplelog::{Config as LogConfig, LevelFilter, SimpleLogger};
use snafu::{ensure, ResultExt};
use std::process;

/// Administers host-local deduplication storage services
#[derive(FromArgs, Debug)]
struct Args {
    /// log-level trace|debug|info|warn|error
    #[argh(option, default = "LevelFilter::Warn")]
    log_level: LevelFilter,
    /// log commands without executing them
    #[argh(switch, short = 'n')]
    no_run: bool,
    /// print each external command before running it
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// configuration file recording managed services
    #[argh(option, short = 'f')]
    conf_file: Option<String>,
    /// lock file serializing invocations
    #[argh(option)]
    lock_file: Option<String>,
    /// comma-separated extension names to disable, or "all"
    #[argh(option)]
    disable_extensions: Option<String>,
    #[argh(subcommand)]
    subcommand: Subcommand,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Subcommand {
    Create(CreateArgs),
    Remove(RemoveArgs),
    Start(StartArgs),
    Stop(StopArgs),
    List(ListArgs),
    Status(StatusArgs),
    GrowPhysical(GrowPhysicalArgs),
}

/// Creates a dedup device and, if necessary, its index server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "create")]
struct CreateArgs {
    /// name of the new dedup device
    #[argh(positional)]
    name: String,
    /// volume group the logical volumes are carved from
    #[argh(option, default = "defaults::VOLUME_GROUP.to_string()")]
    vg: String,
    /// backing volume size; all remaining free space when omitted
    #[argh(option)]
    physical_size: Option<Size>,
    /// size of the device presented to users; the physical size when omitted
    #[argh(option)]
    logical_size: Option<Size>,
    /// address the index server listens on
    #[argh(option, default = "defaults::INDEX_ADDRESS.to_string()")]
    address: String,
    /// port the index server listens on
    #[argh(option, default = "defaults::INDEX_PORT")]
    port: u16,
    /// index server memory setting, in gigabytes
    #[argh(option, default = "String::from(\"0\")")]
    index_mem: String,
    /// use a sparse dedup index
    #[argh(switch)]
    sparse_index: bool,
    /// advertise 512-byte logical blocks instead of 4096
    #[argh(switch)]
    enable_512e: bool,
    /// enable the compression extension on the new device
    #[argh(switch)]
    compression: bool,
    /// write policy of the new device
    #[argh(option, default = "defaults::EXTERNAL_WRITE_POLICY.to_string()")]
    write_policy: String,
}

/// Stops and removes a dedup device and its unshared index
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "remove")]
struct RemoveArgs {
    /// name of the dedup device
    #[argh(positional)]
    name: String,
    /// unmount filesystems and ignore stop failures
    #[argh(switch)]
    force: bool,
}

/// Starts a dedup device and its index server
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "start")]
struct StartArgs {
    /// name of the dedup device
    #[argh(positional)]
    name: String,
    /// rebuild device statistics before starting
    #[argh(switch)]
    rebuild_statistics: bool,
    /// force a metadata rebuild of a read-only device before starting
    #[argh(switch)]
    force_rebuild: bool,
}

/// Stops a dedup device, and its index server if unshared
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "stop")]
struct StopArgs {
    /// name of the dedup device
    #[argh(positional)]
    name: String,
    /// unmount filesystems still using the device
    #[argh(switch)]
    force: bool,
}

/// Lists the names of the managed dedup devices
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "list")]
struct ListArgs {}

/// Prints the status of every managed service
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "status")]
struct StatusArgs {}

/// Grows the backing volume of a running dedup device
#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "grow-physical")]
struct GrowPhysicalArgs {
    /// name of the dedup device
    #[argh(positional)]
    name: String,
    /// new backing volume size; all remaining free space when omitted
    #[argh(option)]
    physical_size: Option<Size>,
}

fn create(
    cfg: &RunnerConfig,
    conf_file: &str,
    lock_file: &str,
    extensions: &Extensions,
    args: CreateArgs,
) -> Result<i32> {
    let mut config = Configuration::open(cfg, conf_file, lock_file, OpenOptions::default())?;
    ensure!(
        !config.have_target(&args.name),
        error::TargetExistsSnafu { name: &args.name }
    );

    let server = format!("dedupe://{}:{}", args.address, args.port);
    let network_spec = format!("{}:{}", args.address, args.port);
    let (index_lv, backing_lv) = defaults::lv_names_for(&args.name);

    let mut opts = StartOptions::new(extensions);
    opts.network_spec = Some(&network_spec);
    let mut outcome = Outcome::Success;

    if !config.have_index(&server) {
        let lv: LogicalVolume = format!("/dev/{}/{}", args.vg, index_lv).parse()?;
        lv.can_create(cfg)?;
        let mut index = IndexService::new(
            &server,
            lv,
            defaults::index_dir_for(&args.name),
            network_spec.clone(),
            defaults::index_size(&args.index_mem, args.sparse_index),
        );
        index.memory = args.index_mem.clone();
        index.sparse = args.sparse_index;

        if index.create(cfg) == Outcome::Error {
            return Ok(Outcome::Error.exit_code());
        }
        outcome = outcome.worst(index.start(cfg, &opts));
        config.add_index(&server, index, false);
    }

    let lv: LogicalVolume = format!("/dev/{}/{}", args.vg, backing_lv).parse()?;
    lv.can_create(cfg)?;
    let mut target = TargetService::new(&args.name, lv, args.enable_512e)?;
    target.restore(&args.name);
    if let Some(size) = args.physical_size {
        target.physical_size = size;
    }
    if let Some(size) = args.logical_size {
        target.logical_size = size;
    }
    target.enable_compression = args.compression;
    target.server = server;
    target.write_policy = args.write_policy;

    if target.create(cfg) == Outcome::Error {
        // Keep the index record; a shared index may already be in use.
        config.persist()?;
        return Ok(Outcome::Error.exit_code());
    }
    outcome = outcome.worst(target.start(cfg, &opts));
    config.add_target(&args.name, target, false);
    config.persist()?;
    Ok(outcome.exit_code())
}

fn remove(
    cfg: &RunnerConfig,
    conf_file: &str,
    lock_file: &str,
    args: RemoveArgs,
) -> Result<i32> {
    let options = OpenOptions {
        must_exist: true,
        delete_empty: true,
        ..OpenOptions::default()
    };
    let mut config = Configuration::open(cfg, conf_file, lock_file, options)?;
    let mut target = config.target(&args.name)?.clone();

    if target.stop(cfg, args.force) == Outcome::Error && !args.force {
        return Ok(Outcome::Error.exit_code());
    }
    let mut outcome = target.remove(cfg);
    config.remove_target(&args.name);

    let server = target.server.clone();
    if config.have_index(&server) && !config.index_in_use(&server, &args.name) {
        let mut index = config.index(&server)?.clone();
        index.stop(cfg, args.force);
        outcome = outcome.worst(index.remove(cfg));
        config.remove_index(&server);
    }
    config.persist()?;
    Ok(outcome.exit_code())
}

fn start(
    cfg: &RunnerConfig,
    conf_file: &str,
    lock_file: &str,
    extensions: &Extensions,
    args: StartArgs,
) -> Result<i32> {
    let options = OpenOptions {
        must_exist: true,
        ..OpenOptions::default()
    };
    let config = Configuration::open(cfg, conf_file, lock_file, options)?;
    let mut target = config.target(&args.name)?.clone();
    let server = target.server.clone();

    let mut opts = StartOptions::new(extensions);
    opts.rebuild_statistics = args.rebuild_statistics;
    opts.force_rebuild = args.force_rebuild;

    let network_spec;
    if config.have_index(&server) {
        let mut index = config.index(&server)?.clone();
        if index.start(cfg, &opts) == Outcome::Error {
            return Ok(Outcome::Error.exit_code());
        }
        network_spec = index.network_spec.clone();
    } else {
        // Older records carry only the server URI.
        network_spec = server
            .strip_prefix("dedupe://")
            .unwrap_or(&server)
            .to_string();
    }
    opts.network_spec = Some(&network_spec);
    Ok(target.start(cfg, &opts).exit_code())
}

fn stop(cfg: &RunnerConfig, conf_file: &str, lock_file: &str, args: StopArgs) -> Result<i32> {
    let options = OpenOptions {
        must_exist: true,
        ..OpenOptions::default()
    };
    let config = Configuration::open(cfg, conf_file, lock_file, options)?;
    let mut target = config.target(&args.name)?.clone();

    let mut outcome = target.stop(cfg, args.force);
    if outcome != Outcome::Error {
        let server = target.server.clone();
        if config.have_index(&server) && !config.index_in_use(&server, &args.name) {
            let mut index = config.index(&server)?.clone();
            if index.stop(cfg, args.force) == Outcome::Error {
                outcome = Outcome::Error;
            }
        }
    }
    Ok(outcome.exit_code())
}

fn list(cfg: &RunnerConfig, conf_file: &str, lock_file: &str) -> Result<i32> {
    let options = OpenOptions {
        readonly: true,
        ..OpenOptions::default()
    };
    let config = Configuration::open(cfg, conf_file, lock_file, options)?;
    for name in config.target_names() {
        println!("{}", name);
    }
    Ok(0)
}

fn status(cfg: &RunnerConfig, conf_file: &str, lock_file: &str) -> Result<i32> {
    let options = OpenOptions {
        readonly: true,
        ..OpenOptions::default()
    };
    let config = Configuration::open(cfg, conf_file, lock_file, options)?;
    println!("Configuration file: {}", conf_file);
    KernelModuleService::new().status(cfg, "");
    println!("Dedup devices:");
    for name in config.target_names() {
        config.target(&name)?.status(cfg, "  ");
    }
    println!("Index servers:");
    for name in config.index_names() {
        config.index(&name)?.status(cfg, "  ");
    }
    Ok(0)
}

fn grow_physical(
    cfg: &RunnerConfig,
    conf_file: &str,
    lock_file: &str,
    args: GrowPhysicalArgs,
) -> Result<i32> {
    let options = OpenOptions {
        must_exist: true,
        ..OpenOptions::default()
    };
    let mut config = Configuration::open(cfg, conf_file, lock_file, options)?;
    let mut target = config.target(&args.name)?.clone();
    target.grow_physical(cfg, args.physical_size)?;
    config.add_target(&args.name, target, true);
    config.persist()?;
    Ok(0)
}

fn run() -> Result<i32> {
    let args: Args = argh::from_env();
    SimpleLogger::init(args.log_level, LogConfig::default()).context(error::LoggerSnafu)?;

    let cfg = RunnerConfig {
        no_run: args.no_run,
        verbose: args.verbose,
    };
    let conf_file = args.conf_file.clone().unwrap_or_else(defaults::conf_file);
    let lock_file = args.lock_file.clone().unwrap_or_else(defaults::lock_file);

    let mut extensions = Extensions::new();
    if let Some(names) = &args.disable_extensions {
        extensions.disable(names);
    }

    match args.subcommand {
        Subcommand::Create(sub) => create(&cfg, &conf_file, &lock_file, &extensions, sub),
        Subcommand::Remove(sub) => remove(&cfg, &conf_file, &lock_file, sub),
        Subcommand::Start(sub) => start(&cfg, &conf_file, &lock_file, &extensions, sub),
        Subcommand::Stop(sub) => stop(&cfg, &conf_file, &lock_file, sub),
        Subcommand::List(_) => list(&cfg, &conf_file, &lock_file),
        Subcommand::Status(_) => status(&cfg, &conf_file, &lock_file),
        Subcommand::GrowPhysical(sub) => grow_physical(&cfg, &conf_file, &lock_file, sub),
    }
}

fn main() {
    match run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{}", e);
            process::exit(Outcome::Error.exit_code());
        }
    }
}
