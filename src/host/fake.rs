use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::config::Architecture;

use super::{Host, Invocation, MountEntry, MountRequest};

const DEFAULT_PROGRAMS: &[&str] = &[
    "debootstrap",
    "chroot",
    "mount",
    "umount",
    "parted",
    "mkfs.ext4",
    "cp",
    "losetup",
    "qemu-aarch64-static",
    "qemu-x86_64-static",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Run(Invocation),
    Mount(PathBuf),
    Umount(PathBuf),
    /// An unmount that was attempted and failed.
    UmountFailed(PathBuf),
    LoopAttach { device: PathBuf, image: PathBuf },
    LoopDetach(PathBuf),
    LoopDetachFailed(PathBuf),
}

/// Where an injected failure hits.
#[derive(Debug, Clone, PartialEq)]
pub enum FailPoint {
    /// Any invocation of `program` whose arguments contain `arg` (or any arguments when empty).
    Run { program: String, arg: String },
    /// Mounting onto a target whose path contains the given text.
    Mount(String),
    /// Unmounting a target whose path contains the given text.
    Umount(String),
    LoopAttach,
    LoopDetach,
}

impl FailPoint {
    pub fn run(program: &str) -> Self {
        FailPoint::Run {
            program: program.into(),
            arg: String::new(),
        }
    }

    pub fn run_with_arg(program: &str, arg: &str) -> Self {
        FailPoint::Run {
            program: program.into(),
            arg: arg.into(),
        }
    }
}

#[derive(Default)]
struct State {
    programs: HashSet<String>,
    /// (target, source) in mount order
    mounts: Vec<(PathBuf, PathBuf)>,
    loops: BTreeMap<PathBuf, PathBuf>,
    next_loop: u32,
    events: Vec<Event>,
    failures: Vec<FailPoint>,
    users: HashSet<(PathBuf, String)>,
    partition_nodes_appear: bool,
}

/// An in-memory [`Host`] keeping its own mount table, loop table and event log.
///
/// Commands have no effect except for the few the pipeline depends on observing:
/// `debootstrap` creates a skeleton tree, `id`/`useradd` manage a per-root user list.
pub struct FakeHost {
    arch: Option<Architecture>,
    bin_dir: TempDir,
    resolv_conf: PathBuf,
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        let bin_dir = tempfile::Builder::new()
            .prefix("simetrio-fake-bin-")
            .tempdir()
            .expect("create fake bin dir");
        let resolv_conf = bin_dir.path().join("resolv.conf");
        std::fs::write(&resolv_conf, "nameserver 192.0.2.53\n").expect("write fake resolv.conf");

        let this = Self {
            arch: Some(Architecture::Amd64),
            bin_dir,
            resolv_conf,
            state: Mutex::new(State {
                partition_nodes_appear: true,
                ..Default::default()
            }),
        };
        DEFAULT_PROGRAMS
            .iter()
            .fold(this, |this, program| this.with_program(program))
    }

    pub fn with_arch(mut self, arch: Option<Architecture>) -> Self {
        self.arch = arch;
        self
    }

    pub fn with_program(self, name: &str) -> Self {
        std::fs::write(self.bin_dir.path().join(name), b"#!/bin/true\n").expect("write fake program");
        self.state().programs.insert(name.to_owned());
        self
    }

    pub fn without_program(self, name: &str) -> Self {
        self.state().programs.remove(name);
        self
    }

    pub fn with_failure(self, fail_point: FailPoint) -> Self {
        self.state().failures.push(fail_point);
        self
    }

    /// Drop every injected failure, e.g. to check that a later teardown can recover.
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn without_partition_nodes(self) -> Self {
        self.state().partition_nodes_appear = false;
        self
    }

    pub fn events(&self) -> Vec<Event> {
        self.state().events.clone()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Run(invocation) => Some(invocation),
                _ => None,
            })
            .collect()
    }

    /// Whether some invocation ran `program` with `arg` among its arguments.
    pub fn ran(&self, program: &str, arg: &str) -> bool {
        self.invocations()
            .iter()
            .any(|invocation| invocation.program == program && has_arg(invocation, arg))
    }

    pub fn active_mounts(&self) -> Vec<PathBuf> {
        self.state().mounts.iter().map(|(target, _)| target.clone()).collect()
    }

    pub fn active_loops(&self) -> Vec<PathBuf> {
        self.state().loops.keys().cloned().collect()
    }

    pub fn users_in(&self, root: &Path) -> Vec<String> {
        let mut users = self
            .state()
            .users
            .iter()
            .filter(|(r, _)| r == root)
            .map(|(_, user)| user.clone())
            .collect::<Vec<_>>();
        users.sort();
        users
    }

    /// Position of the first event matching `predicate` in the event log.
    pub fn position(&self, predicate: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(predicate)
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn should_fail(&self, predicate: impl Fn(&FailPoint) -> bool) -> bool {
        self.state().failures.iter().any(predicate)
    }

    fn try_umount(&self, target: &Path) -> Result<()> {
        if self.should_fail(|f| matches!(f, FailPoint::Umount(needle) if path_contains(target, needle)))
        {
            bail!("injected failure: umount {target:?}");
        }

        let mut state = self.state();
        let Some(index) = state.mounts.iter().position(|(m, _)| m == target) else {
            bail!("{target:?} is not mounted");
        };
        if state
            .mounts
            .iter()
            .any(|(m, _)| m != target && m.starts_with(target))
        {
            bail!("umount {target:?}: target is busy");
        }
        state.mounts.remove(index);
        state.events.push(Event::Umount(target.to_owned()));
        Ok(())
    }

    fn try_detach(&self, device: &Path) -> Result<()> {
        if self.should_fail(|f| matches!(f, FailPoint::LoopDetach)) {
            bail!("injected failure: detach {device:?}");
        }

        let mut state = self.state();
        let device_name = device.to_string_lossy();
        if state
            .mounts
            .iter()
            .any(|(_, source)| source.to_string_lossy().starts_with(device_name.as_ref()))
        {
            bail!("detach {device:?}: device is busy");
        }
        if state.loops.remove(device).is_none() {
            bail!("{device:?} is not attached");
        }
        state.events.push(Event::LoopDetach(device.to_owned()));
        Ok(())
    }

    async fn simulate(&self, invocation: &Invocation) -> Result<Vec<u8>> {
        match invocation.program.as_str() {
            "debootstrap" => {
                let target = invocation
                    .args
                    .iter()
                    .rev()
                    .nth(1)
                    .map(PathBuf::from)
                    .context("debootstrap without target")?;
                if has_arg(invocation, "--foreign") {
                    tokio::fs::create_dir_all(target.join("debootstrap")).await?;
                    tokio::fs::write(target.join("debootstrap/debootstrap"), b"").await?;
                } else {
                    tokio::fs::create_dir_all(target.join("etc")).await?;
                    tokio::fs::create_dir_all(target.join("usr/bin")).await?;
                }
                Ok(vec![])
            }
            "id" => {
                let root = invocation.root.clone().unwrap_or_else(|| "/".into());
                let user = last_arg(invocation)?;
                if self.state().users.contains(&(root, user.clone())) {
                    Ok(b"1000\n".to_vec())
                } else {
                    bail!("id: '{user}': no such user")
                }
            }
            "useradd" => {
                let root = invocation.root.clone().unwrap_or_else(|| "/".into());
                let user = last_arg(invocation)?;
                if !self.state().users.insert((root, user.clone())) {
                    bail!("useradd: user '{user}' already exists")
                }
                Ok(vec![])
            }
            _ => Ok(vec![]),
        }
    }
}

fn has_arg(invocation: &Invocation, arg: &str) -> bool {
    invocation
        .args
        .iter()
        .any(|a| a.to_string_lossy() == arg)
}

fn last_arg(invocation: &Invocation) -> Result<String> {
    invocation
        .args
        .last()
        .map(|arg| arg.to_string_lossy().into_owned())
        .with_context(|| format!("{} without arguments", invocation.program))
}

fn path_contains(path: &Path, needle: &str) -> bool {
    path.to_string_lossy().contains(needle)
}

#[async_trait]
impl Host for FakeHost {
    fn host_arch(&self) -> Option<Architecture> {
        self.arch
    }

    fn find_program(&self, name: &str) -> Option<PathBuf> {
        self.state()
            .programs
            .contains(name)
            .then(|| self.bin_dir.path().join(name))
    }

    fn resolver_config(&self) -> PathBuf {
        self.resolv_conf.clone()
    }

    fn device_exists(&self, device: &Path) -> bool {
        let state = self.state();
        state.partition_nodes_appear
            && state.loops.keys().any(|dev| {
                let mut partition = dev.clone().into_os_string();
                partition.push("p1");
                Path::new(&partition) == device
            })
    }

    async fn run(&self, invocation: &Invocation) -> Result<Vec<u8>> {
        self.state().events.push(Event::Run(invocation.clone()));

        let fail = self.should_fail(|fail_point| match fail_point {
            FailPoint::Run { program, arg } => {
                *program == invocation.program && (arg.is_empty() || has_arg(invocation, arg))
            }
            _ => false,
        });
        if fail {
            bail!("injected failure: {invocation}");
        }

        self.simulate(invocation).await
    }

    async fn mount(&self, request: &MountRequest) -> Result<()> {
        if self.should_fail(|f| matches!(f, FailPoint::Mount(needle) if path_contains(&request.target, needle)))
        {
            bail!("injected failure: mount {:?}", request.target);
        }

        let mut state = self.state();
        if state.mounts.iter().any(|(target, _)| target == &request.target) {
            bail!("{:?} is already mounted", request.target);
        }
        state
            .mounts
            .push((request.target.clone(), request.source.clone()));
        state.events.push(Event::Mount(request.target.clone()));
        Ok(())
    }

    async fn umount(&self, target: &Path) -> Result<()> {
        let result = self.try_umount(target);
        if result.is_err() {
            self.state().events.push(Event::UmountFailed(target.to_owned()));
        }
        result
    }

    async fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        if self.should_fail(|f| matches!(f, FailPoint::LoopAttach)) {
            bail!("injected failure: attach {image:?}");
        }

        let mut state = self.state();
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.loops.insert(device.clone(), image.to_owned());
        state.events.push(Event::LoopAttach {
            device: device.clone(),
            image: image.to_owned(),
        });
        Ok(device)
    }

    async fn detach_loop(&self, device: &Path) -> Result<()> {
        let result = self.try_detach(device);
        if result.is_err() {
            self.state().events.push(Event::LoopDetachFailed(device.to_owned()));
        }
        result
    }

    async fn loops_backing(&self, image: &Path) -> Result<Vec<PathBuf>> {
        Ok(self
            .state()
            .loops
            .iter()
            .filter(|(_, backing)| backing.as_path() == image)
            .map(|(device, _)| device.clone())
            .collect())
    }

    async fn mount_table(&self) -> Result<Vec<MountEntry>> {
        Ok(self
            .state()
            .mounts
            .iter()
            .map(|(target, source)| MountEntry {
                target: target.clone(),
                source: source.to_string_lossy().into_owned(),
            })
            .collect())
    }
}
