//! Mount lifecycle: init, mount, serve, shutdown.
//!
//! A [`Service`] owns everything with the lifetime of one mount: the open
//! store, the resolved [`PathInfo`], the filesystem core, and the kernel
//! session. `run` blocks until a termination signal arrives or the `--exec`
//! subprocess exits, then unmounts, performs the final flush exactly once,
//! and returns the resulting base key for the caller to print.

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use fuser::INodeNo;
use fuser::MountOption;
use fuser::Notifier;
use fuser::Session;
use log::debug;
use log::info;
use log::warn;
use nix::sys::signal::Signal;
use nix::sys::signal::SigSet;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use parking_lot::Mutex;

use crate::config::KeyFormat;
use crate::control;
use crate::fs::FsCore;
use crate::fs::Invalidation;
use crate::fs::adapter::FfsFuse;
use crate::path::PathError;
use crate::path::PathInfo;
use crate::store::Key;
use crate::store::Store;

/// Everything the caller decides about a mount.
pub struct ServiceOptions {
    pub mount_path: String,
    /// Root spec: pointer name or `@key`, with optional subpath.
    pub root: String,
    pub store: String,
    pub read_only: bool,
    pub auto_flush: Option<Duration>,
    pub verbose: bool,
    /// Command to run with cwd at the mount point; empty for none. When the
    /// command exits, the filesystem unmounts.
    pub exec_args: Vec<String>,
    /// Address for the HTTP control surface; absent to disable it.
    pub listen: Option<String>,
    pub key_format: KeyFormat,
}

enum Event {
    Signal(Signal),
    SubprocessExited(std::io::Result<process::ExitStatus>),
}

pub struct Service {
    opts: ServiceOptions,
    store: Store,
    path: Arc<Mutex<PathInfo>>,
    core: Arc<FsCore>,
    inval_rx: Option<Receiver<Invalidation>>,
    session: Option<fuser::BackgroundSession>,
}

impl Service {
    /// Checks the options, opens the store, and resolves the root path.
    pub fn init(opts: ServiceOptions) -> anyhow::Result<Service> {
        if opts.mount_path.is_empty() {
            bail!("missing mount path");
        }
        if opts.root.is_empty() {
            bail!("missing root spec");
        }
        if opts.read_only && opts.auto_flush.is_some() {
            bail!("cannot combine read-only with auto-flush");
        }

        let store = Store::open(&opts.store).context("opening blob store")?;
        let path = PathInfo::resolve(&store, &opts.root).context("loading root path")?;
        let (core, inval_rx) = FsCore::new(path.file.clone(), store.cas());

        let service = Service {
            core,
            inval_rx: Some(inval_rx),
            path: Arc::new(Mutex::new(path)),
            store,
            opts,
            session: None,
        };
        {
            let path = service.path.lock();
            match (&path.root_name, &path.root) {
                (Some(name), Some(record)) => {
                    service.vlogf(&format!(
                        "Loaded filesystem from {name:?} ({})",
                        service.opts.key_format.format(&path.base_key)
                    ));
                    if !record.description.is_empty() {
                        service.vlogf(&format!("| Description: {:?}", record.description));
                    }
                }
                _ => service.vlogf(&format!(
                    "Loaded filesystem at {} (no root pointer)",
                    service.opts.key_format.format(&path.base_key)
                )),
            }
        }
        Ok(service)
    }

    fn vlogf(&self, msg: &str) {
        if self.opts.verbose || self.opts.exec_args.is_empty() {
            info!("{msg}");
        }
    }

    /// Opens the FUSE session and starts serving in the background.
    pub fn mount(&mut self) -> anyhow::Result<()> {
        let mut options = vec![
            MountOption::FSName("ffs".to_string()),
            MountOption::Subtype("ffs".to_string()),
        ];
        if self.opts.read_only {
            options.push(MountOption::RO);
        } else {
            options.push(MountOption::RW);
        }

        let fs = FfsFuse::new(self.core.clone());
        let mut config = fuser::Config::default();
        config.mount_options = options;
        let session = Session::new(fs, &self.opts.mount_path, &config)
            .with_context(|| format!("mounting at {:?}", self.opts.mount_path))?;
        let notifier = session.notifier();
        let rx = self
            .inval_rx
            .take()
            .expect("service mounted more than once");
        thread::Builder::new()
            .name("ffs-invalidate".to_string())
            .spawn(move || drain_invalidations(rx, notifier))
            .context("spawning invalidation thread")?;
        self.session = Some(session.spawn().context("starting fuse session")?);
        Ok(())
    }

    /// Serves until shutdown, then unmounts and returns the final base key.
    pub fn run(&mut self) -> anyhow::Result<Key> {
        // Terminal signals are handled on a dedicated thread; block them
        // before any other thread exists so every thread inherits the mask.
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGUSR1);
        mask.add(Signal::SIGUSR2);
        mask.thread_block().context("blocking signals")?;

        if self.session.is_none() {
            self.mount()?;
        }

        let (tx, rx) = crossbeam_channel::unbounded::<Event>();

        {
            let tx = tx.clone();
            thread::Builder::new()
                .name("ffs-signals".to_string())
                .spawn(move || {
                    loop {
                        match mask.wait() {
                            Ok(sig) => {
                                if tx.send(Event::Signal(sig)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!("signal wait failed: {err}");
                                return;
                            }
                        }
                    }
                })
                .context("spawning signal thread")?;
        }

        let _stop_auto_flush = self.opts.auto_flush.map(|interval| {
            self.vlogf(&format!("Enabling auto-flush every {interval:?}"));
            spawn_auto_flush(self.core.clone(), self.path.clone(), interval)
        });

        let mut child_pid: Option<u32> = None;
        if !self.opts.exec_args.is_empty() {
            let name = &self.opts.exec_args[0];
            self.vlogf(&format!("Starting subprocess {name:?}"));
            let mut child = process::Command::new(name)
                .args(&self.opts.exec_args[1..])
                .current_dir(&self.opts.mount_path)
                .spawn()
                .with_context(|| format!("starting subprocess {name:?}"))?;
            child_pid = Some(child.id());
            let tx = tx.clone();
            thread::Builder::new()
                .name("ffs-subprocess".to_string())
                .spawn(move || {
                    // Bounded at one: there is exactly one terminal status.
                    let _ = tx.send(Event::SubprocessExited(child.wait()));
                })
                .context("spawning subprocess monitor")?;
        }

        if let Some(listen) = self.opts.listen.clone() {
            let state = control::Control {
                core: self.core.clone(),
                path: self.path.clone(),
                store: self.store.clone(),
                mount_path: self.opts.mount_path.clone(),
                store_spec: self.opts.store.clone(),
                read_only: self.opts.read_only,
                auto_flush: self.opts.auto_flush,
                key_format: self.opts.key_format,
            };
            control::serve(Arc::new(state), &listen)?;
        }

        loop {
            match rx.recv() {
                Ok(Event::Signal(Signal::SIGUSR1)) => match self.flush_root() {
                    Ok(key) => {
                        self.vlogf(&format!(
                            "Root flushed, storage key is now {}",
                            self.opts.key_format.format(&key)
                        ));
                    }
                    Err(err) => warn!("Error flushing root: {err}"),
                },
                Ok(Event::Signal(Signal::SIGUSR2)) => {
                    match swap_root(&self.core, &self.path, &self.store, &self.opts.root) {
                        Ok((root, key)) => self.vlogf(&format!(
                            "Reloaded root {root:?}, storage key {}",
                            self.opts.key_format.format(&key)
                        )),
                        Err(err) => warn!("Error reloading root: {err}"),
                    }
                }
                Ok(Event::Signal(sig)) => {
                    info!("Received signal {sig}, unmounting...");
                    break;
                }
                Ok(Event::SubprocessExited(status)) => {
                    match status {
                        Ok(status) if status.success() => self.vlogf("Subprocess exited"),
                        Ok(status) => warn!("Subprocess exited with {status}"),
                        Err(err) => warn!("Error from subprocess: {err}"),
                    }
                    break;
                }
                Err(_) => break,
            }
        }

        if let Some(pid) = child_pid {
            // Best effort; the subprocess may already be gone.
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        // Dropping the background session unmounts; failures there are
        // logged as warnings by the session itself and must not stop the
        // final flush.
        if let Some(session) = self.session.take() {
            drop(session);
            self.vlogf("Unmounted filesystem");
        }

        let key = self
            .core
            .with_tree_locked(|| self.path.lock().flush())
            .context("final flush")?;
        Ok(key)
    }

    fn flush_root(&self) -> Result<Key, PathError> {
        self.core.with_tree_locked(|| self.path.lock().flush())
    }
}

/// Resolves `spec` and atomically swaps it in as the mounted root.
/// Returns the new root's description and base key.
pub fn swap_root(
    core: &Arc<FsCore>,
    path: &Arc<Mutex<PathInfo>>,
    store: &Store,
    spec: &str,
) -> Result<(String, Key), PathError> {
    // Resolve outside the tree lock; loading may hit storage.
    let new_path = PathInfo::resolve(store, spec)?;
    let root = new_path.describe_root();
    let key = new_path.base_key;
    let events = core.replace_root(new_path.file.clone());
    *path.lock() = new_path;
    core.queue_invalidations(events);
    Ok((root, key))
}

fn spawn_auto_flush(
    core: Arc<FsCore>,
    path: Arc<Mutex<PathInfo>>,
    interval: Duration,
) -> Sender<()> {
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
    thread::spawn(move || {
        let ticker = crossbeam_channel::tick(interval);
        loop {
            crossbeam_channel::select! {
                recv(stop_rx) -> _ => {
                    debug!("Stopping auto-flush");
                    return;
                }
                recv(ticker) -> _ => {
                    let old_key = path.lock().base_key;
                    match core.with_tree_locked(|| path.lock().flush()) {
                        Err(err) => warn!("Error flushing root: {err}"),
                        Ok(new_key) if new_key != old_key => {
                            info!("Root flushed, storage key is now {new_key}");
                        }
                        Ok(_) => {}
                    }
                }
            }
        }
    });
    stop_tx
}

fn drain_invalidations(rx: Receiver<Invalidation>, notifier: Notifier) {
    for event in rx.iter() {
        let result = match &event {
            Invalidation::Entry { parent, name } => {
                notifier.inval_entry(INodeNo(*parent), name.as_os_str())
            }
            Invalidation::Attr { ino } => notifier.inval_inode(INodeNo(*ino), 0, 0),
        };
        if let Err(err) = result {
            // The kernel dropping a cache entry first is not a problem.
            debug!("invalidation {event:?} not delivered: {err}");
        }
    }
}
