use std::env;
use std::process;
use std::time::Duration;

use clap::Arg;
use clap::ArgAction;
use clap::Command;
use clap::crate_version;
use log::LevelFilter;
use log::error;

use ffs_fuse::config::Config;
use ffs_fuse::service::Service;
use ffs_fuse::service::ServiceOptions;

const DEBUG_FFS: u32 = 1;
const DEBUG_FUSE: u32 = 2;

fn main() {
    let matches = Command::new("ffs-fuse")
        .version(crate_version!())
        .about("Mount a content-addressed FFS file tree via FUSE")
        .arg(
            Arg::new("mount")
                .long("mount")
                .value_name("PATH")
                .required(true)
                .help("Path of mount point"),
        )
        .arg(
            Arg::new("root")
                .long("root")
                .value_name("SPEC")
                .required(true)
                .help("Root pointer name or @file-key, with optional /subpath (@new starts empty)"),
        )
        .arg(
            Arg::new("store")
                .long("store")
                .value_name("ADDR")
                .help("Blob storage address (default: $FFS_STORE, then the config file)"),
        )
        .arg(
            Arg::new("read-only")
                .long("read-only")
                .action(ArgAction::SetTrue)
                .help("Mount the filesystem as read-only"),
        )
        .arg(
            Arg::new("debug")
                .long("debug")
                .value_name("LEVEL")
                .value_parser(clap::value_parser!(u32))
                .default_value("0")
                .help("Debug logging bits (1=ffs, 2=fuse, 3=both)"),
        )
        .arg(
            Arg::new("auto-flush")
                .long("auto-flush")
                .value_name("DURATION")
                .help("Automatically flush the root at this interval (e.g. 30s, 5m)"),
        )
        .arg(
            Arg::new("v")
                .short('v')
                .action(ArgAction::Count)
                .help("Sets the level of verbosity"),
        )
        .arg(
            Arg::new("exec")
                .long("exec")
                .action(ArgAction::SetTrue)
                .help("Run the trailing command with cwd at the mount point, then unmount"),
        )
        .arg(
            Arg::new("listen")
                .long("listen")
                .value_name("ADDR")
                .help("Serve the HTTP status interface at this address"),
        )
        .arg(
            Arg::new("command")
                .value_name("COMMAND")
                .num_args(0..)
                .trailing_var_arg(true)
                .allow_hyphen_values(true)
                .help("Command for --exec"),
        )
        .get_matches();

    let debug_bits = *matches.get_one::<u32>("debug").unwrap();
    let level = match matches.get_count("v") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut logger = env_logger::Builder::from_default_env();
    logger.filter_level(LevelFilter::Warn);
    logger.filter_module(
        "ffs_fuse",
        if debug_bits & DEBUG_FFS != 0 {
            LevelFilter::Debug
        } else {
            level
        },
    );
    if debug_bits & DEBUG_FUSE != 0 {
        logger.filter_module("fuser", LevelFilter::Debug);
    }
    logger.init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(err) => {
            error!("Loading configuration: {err}");
            process::exit(1);
        }
    };

    let store = matches
        .get_one::<String>("store")
        .cloned()
        .or_else(|| env::var("FFS_STORE").ok().filter(|s| !s.is_empty()))
        .or_else(|| config.default_store.clone());
    let Some(store) = store else {
        error!("No store address: set --store, $FFS_STORE, or the config file");
        process::exit(1);
    };

    let exec_args: Vec<String> = matches
        .get_many::<String>("command")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    if matches.get_flag("exec") && exec_args.is_empty() {
        error!("--exec requires a trailing command");
        process::exit(1);
    }
    if !matches.get_flag("exec") && !exec_args.is_empty() {
        error!("Unexpected arguments without --exec: {exec_args:?}");
        process::exit(1);
    }

    let auto_flush = match matches.get_one::<String>("auto-flush") {
        Some(text) => match parse_duration(text) {
            Ok(duration) => Some(duration),
            Err(err) => {
                error!("Invalid --auto-flush value {text:?}: {err}");
                process::exit(1);
            }
        },
        None => None,
    };

    let key_format = config.key_format;
    let opts = ServiceOptions {
        mount_path: matches.get_one::<String>("mount").unwrap().clone(),
        root: matches.get_one::<String>("root").unwrap().clone(),
        store,
        read_only: matches.get_flag("read-only"),
        auto_flush,
        verbose: matches.get_count("v") > 0,
        exec_args,
        listen: matches.get_one::<String>("listen").cloned(),
        key_format,
    };

    match Service::init(opts).and_then(|mut service| service.run()) {
        Ok(key) => println!("{}", key_format.format(&key)),
        Err(err) => {
            error!("{err:#}");
            process::exit(1);
        }
    }
}

/// Parses `30s`, `200ms`, `5m`, `1h`, or a bare number of seconds.
fn parse_duration(text: &str) -> Result<Duration, String> {
    let (number, scale_ms) = if let Some(n) = text.strip_suffix("ms") {
        (n, 1u64)
    } else if let Some(n) = text.strip_suffix('s') {
        (n, 1000)
    } else if let Some(n) = text.strip_suffix('m') {
        (n, 60 * 1000)
    } else if let Some(n) = text.strip_suffix('h') {
        (n, 60 * 60 * 1000)
    } else {
        (text, 1000)
    };
    let value: u64 = number
        .parse()
        .map_err(|_| format!("{number:?} is not a number"))?;
    if value == 0 {
        return Err("interval must be positive".to_string());
    }
    Ok(Duration::from_millis(value * scale_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse_with_units() {
        assert_eq!(parse_duration("200ms").unwrap(), Duration::from_millis(200));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("fast").is_err());
    }
}
