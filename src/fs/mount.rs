// SPDX-License-Identifier: MIT
// Copyright 2025. Triad National Security, LLC.

//! ceph-fuse client mounts and the background file workloads run through them.

use std::{collections::BTreeMap, time::Duration};

use log::{debug, info, warn};

use crate::{
    daemon::WaitOutcome,
    ensure,
    error::{Error, Result},
    manager::{status::parse_json, ClusterManager},
    poll::PollPolicy,
    remote::{CommandOutput, RemoteProcess, RunOptions},
};

const MOUNT_POLL: Duration = Duration::from_secs(5);
const VISIBLE_POLL: Duration = Duration::from_secs(1);
pub const VISIBLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const BACKGROUND_FILE: &str = "background_file";
const TEST_FILES: [&str; 3] = ["a", "b", "c"];

/// Handle to a background process started through a mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BackgroundId(usize);

#[derive(Debug, serde::Deserialize)]
struct MdsSessions {
    id: u64,
}

async fn stat_mounted(manager: &ClusterManager, host: &str, mountpoint: &str) -> Result<bool> {
    let out = manager
        .executor()
        .run(
            host,
            RunOptions::new(["stat", "--file-system", "--printf=%T\n", "--", mountpoint])
                .unchecked(),
        )
        .await?;
    if !out.success() {
        debug!("mount point does not exist: {mountpoint}");
        return Ok(false);
    }
    Ok(out.stdout.trim_end() == "fuseblk")
}

/// A ceph-fuse mount of the test filesystem for one client role.
///
/// The fuse process runs under `daemon-helper`, so closing its stdin kills the client without
/// touching the mountpoint, which is how client death is simulated.
#[derive(Debug)]
pub struct ClientMount {
    manager: ClusterManager,
    client_id: String,
    host: String,
    test_dir: String,
    fuse: Option<Box<dyn RemoteProcess>>,
    /// Background processes still being tracked. Finished ones are dropped.
    background: BTreeMap<BackgroundId, Box<dyn RemoteProcess>>,
    next_background: usize,
}

impl ClientMount {
    pub fn new(manager: ClusterManager, client_id: &str, host: &str, test_dir: &str) -> Self {
        ClientMount {
            manager,
            client_id: client_id.to_string(),
            host: host.to_string(),
            test_dir: test_dir.to_string(),
            fuse: None,
            background: BTreeMap::new(),
            next_background: 0,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn mountpoint(&self) -> String {
        format!("{}/mnt.{}", self.test_dir, self.client_id)
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{name}", self.mountpoint())
    }

    async fn run(&self, opts: RunOptions) -> Result<CommandOutput> {
        self.manager.executor().run(&self.host, opts).await
    }

    /// Start ceph-fuse in the background. Use [`ClientMount::wait_until_mounted`] to wait for
    /// the mount to appear.
    pub async fn mount(&mut self) -> Result<()> {
        let mnt = self.mountpoint();
        info!(
            "mounting ceph-fuse client.{} at {} {mnt}...",
            self.client_id, self.host
        );
        self.run(RunOptions::new(["mkdir", "-p", "--", &mnt])).await?;

        let client = format!("client.{}", self.client_id);
        let args = self.manager.wrapped(
            "daemon-helper",
            &["kill", "ceph-fuse", "-f", "--name", &client, &mnt],
        );
        self.fuse = Some(self.manager.executor().spawn(&self.host, args).await?);
        Ok(())
    }

    pub async fn is_mounted(&self) -> Result<bool> {
        stat_mounted(&self.manager, &self.host, &self.mountpoint()).await
    }

    /// Poll until the fuse filesystem shows up on the mountpoint, then open it up to every
    /// user. Fails early if ceph-fuse exits in the meantime.
    pub async fn wait_until_mounted(&mut self) -> Result<()> {
        let mnt = self.mountpoint();
        let client = format!("client.{}", self.client_id);
        let timeout = self.manager.timeouts().mount();
        let ClientMount {
            manager,
            host,
            fuse,
            ..
        } = &mut *self;
        let (manager, host): (&ClusterManager, &str) = (manager, host);

        PollPolicy::new(MOUNT_POLL, timeout)
            .until(&format!("{client} to mount"), || {
                let exited = match fuse.as_mut() {
                    Some(process) => process.try_wait(),
                    None => Ok(None),
                };
                let client = client.clone();
                let mnt = mnt.clone();
                async move {
                    if let Some(status) = exited? {
                        return Err(Error::DaemonExited {
                            role: client,
                            outcome: status.into(),
                        });
                    }
                    stat_mounted(manager, host, &mnt).await
                }
            })
            .await?;

        self.run(RunOptions::new(["chmod", "1777", &mnt]).sudo())
            .await?;
        Ok(())
    }

    /// Unmount, forcing a lazy unmount if fusermount fails.
    pub async fn umount(&mut self) -> Result<()> {
        let mnt = self.mountpoint();
        info!("running fusermount -u on {}...", self.host);
        let out = self
            .run(RunOptions::new(["fusermount", "-u", &mnt]).sudo().unchecked())
            .await?;
        if !out.success() {
            info!("failed to unmount ceph-fuse on {}, aborting...", self.host);
            let out = self
                .run(
                    RunOptions::new(["umount", "-l", "-f", &mnt])
                        .sudo()
                        .unchecked(),
                )
                .await?;
            if !out.success() {
                debug!("umount -l -f {mnt} exited with {}", out.exit_status);
            }
        }
        ensure!(
            !self.is_mounted().await?,
            "{mnt} is still mounted after unmounting"
        );
        Ok(())
    }

    /// Unmount and wait for ceph-fuse to exit, then remove the mountpoint.
    ///
    /// `force` kills the fuse process first, so that the unmount completes even with no MDS
    /// available.
    pub async fn umount_wait(&mut self, force: bool) -> Result<()> {
        if force {
            if let Some(fuse) = self.fuse.as_mut() {
                fuse.close_stdin().await?;
            }
        }
        self.umount().await?;
        if let Some(mut fuse) = self.fuse.take() {
            let status = fuse.wait().await?;
            debug!("ceph-fuse client.{} {}", self.client_id, status);
        }
        self.cleanup().await
    }

    /// Remove the mountpoint. The client must not be mounted.
    pub async fn cleanup(&self) -> Result<()> {
        let out = self
            .run(RunOptions::new(["rmdir", "--", &self.mountpoint()]).unchecked())
            .await?;
        // A missing mountpoint is already clean.
        if !out.success() {
            debug!("rmdir {} exited with {}", self.mountpoint(), out.exit_status);
        }
        Ok(())
    }

    /// Kill the client without unmounting or removing the mountpoint.
    pub async fn kill(&mut self) -> Result<()> {
        info!("killing ceph-fuse client.{}", self.client_id);
        if let Some(mut fuse) = self.fuse.take() {
            fuse.close_stdin().await?;
            let status = fuse.wait().await?;
            debug!("ceph-fuse client.{} {status}", self.client_id);
        }
        Ok(())
    }

    /// Follow up [`ClientMount::kill`] to get to a clean unmounted state.
    pub async fn kill_cleanup(&mut self) -> Result<()> {
        self.umount().await?;
        self.cleanup().await
    }

    /// Get rid of the mount whatever state it is in.
    pub async fn teardown(&mut self) -> Result<()> {
        while let Some((_, mut process)) = self.background.pop_first() {
            info!("terminating background process");
            process.close_stdin().await?;
            process.wait().await?;
        }

        if self.is_mounted().await? {
            self.umount().await?;
        }
        if let Some(mut fuse) = self.fuse.take() {
            if fuse.try_wait()?.is_none() {
                fuse.close_stdin().await?;
                fuse.wait().await?;
            }
        }
        self.run(RunOptions::new(["rm", "-rf", &self.mountpoint()]))
            .await?;
        Ok(())
    }

    /// The client's global id, as the MDS knows it in its session list.
    pub async fn get_global_id(&self) -> Result<u64> {
        let script = format!(
            "ceph --admin-daemon /var/run/ceph/ceph-client.{}.*.asok mds_sessions",
            self.client_id
        );
        let out = self
            .run(RunOptions::new(["sh", "-c", &script]).sudo())
            .await?;
        Ok(parse_json::<MdsSessions>("client mds_sessions", &out.stdout)?.id)
    }

    pub async fn create_files(&self) -> Result<()> {
        ensure!(self.is_mounted().await?, "client.{} is not mounted", self.client_id);
        for name in TEST_FILES {
            info!("creating file {name}");
            self.run(RunOptions::new(["touch", &self.path(name)]).sudo())
                .await?;
        }
        Ok(())
    }

    pub async fn check_files(&self) -> Result<()> {
        ensure!(self.is_mounted().await?, "client.{} is not mounted", self.client_id);
        for name in TEST_FILES {
            info!("checking file {name}");
            let out = self
                .run(RunOptions::new(["ls", &self.path(name)]).sudo().unchecked())
                .await?;
            ensure!(out.success(), "expected file {name} not found");
        }
        Ok(())
    }

    /// Create and remove a uniquely named file, proving metadata I/O works.
    pub async fn create_destroy(&self) -> Result<()> {
        ensure!(self.is_mounted().await?, "client.{} is not mounted", self.client_id);
        let name = format!(
            "{} {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            self.client_id
        );
        let path = self.path(&name);
        debug!("creating test file {name}");
        self.run(RunOptions::new(["touch", &path]).sudo()).await?;
        debug!("deleting test file {name}");
        self.run(RunOptions::new(["rm", "-f", &path]).sudo()).await?;
        Ok(())
    }

    async fn run_python(&mut self, script: String) -> Result<BackgroundId> {
        let args = [
            "sudo",
            "adjust-ulimits",
            "daemon-helper",
            "kill",
            "python",
            "-c",
        ]
        .iter()
        .map(|s| s.to_string())
        .chain(std::iter::once(script))
        .collect();
        let process = self.manager.executor().spawn(&self.host, args).await?;
        let id = BackgroundId(self.next_background);
        self.next_background += 1;
        self.background.insert(id, process);
        Ok(id)
    }

    /// Open a file for writing and keep it open, so the client holds a capability on it.
    pub async fn open_background(&mut self, basename: &str) -> Result<BackgroundId> {
        ensure!(self.is_mounted().await?, "client.{} is not mounted", self.client_id);
        let script = format!(
            "import time\n\
             f = open(\"{}\", 'w')\n\
             f.write('content')\n\
             f.flush()\n\
             f.write('content2')\n\
             while True:\n    time.sleep(1)\n",
            self.path(basename)
        );
        self.run_python(script).await
    }

    /// Open a file for writing, write once and exit. The write needs the file's write
    /// capability, so this blocks while another client holds it.
    pub async fn write_background(&mut self, basename: &str) -> Result<BackgroundId> {
        ensure!(self.is_mounted().await?, "client.{} is not mounted", self.client_id);
        let script = format!(
            "import os\n\
             import time\n\
             fd = os.open(\"{}\", os.O_RDWR | os.O_CREAT, 0o644)\n\
             try:\n    os.write(fd, b'content')\n\
             finally:\n    os.close(fd)\n",
            self.path(basename)
        );
        self.run_python(script).await
    }

    /// Number of background processes not yet waited for or stopped.
    pub fn background_count(&self) -> usize {
        self.background.len()
    }

    fn background_mut(&mut self, id: BackgroundId) -> Result<&mut Box<dyn RemoteProcess>> {
        self.background
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("background process", id.0.to_string()))
    }

    /// Wait for a background process to finish. `StillRunning` if it outlives `timeout`.
    pub async fn wait_background(&mut self, id: BackgroundId, timeout: Option<Duration>) -> Result<WaitOutcome> {
        let process = self.background_mut(id)?;
        let status = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, process.wait()).await {
                Ok(status) => status?,
                Err(_) => return Ok(WaitOutcome::StillRunning),
            },
            None => process.wait().await?,
        };
        self.background.remove(&id);
        Ok(status.into())
    }

    pub fn background_finished(&mut self, id: BackgroundId) -> Result<bool> {
        Ok(self.background_mut(id)?.try_wait()?.is_some())
    }

    /// Stop a background process by closing its stdin.
    pub async fn stop_background(&mut self, id: BackgroundId) -> Result<WaitOutcome> {
        let process = self.background_mut(id)?;
        process.close_stdin().await?;
        let status = process.wait().await?;
        self.background.remove(&id);
        if !status.success() {
            warn!("background process on client.{} {status}", self.client_id);
        }
        Ok(status.into())
    }

    /// Poll until `basename` can be listed through this mount.
    pub async fn wait_for_visible(&self, basename: &str, timeout: Option<Duration>) -> Result<Duration> {
        let path = self.path(basename);
        let elapsed = PollPolicy::new(VISIBLE_POLL, timeout.unwrap_or(VISIBLE_TIMEOUT))
            .until(&format!("{basename} visible from client.{}", self.client_id), || async {
                Ok(self
                    .run(RunOptions::new(["ls", &path]).sudo().unchecked())
                    .await?
                    .success())
            })
            .await?;
        debug!(
            "file {basename} became visible from client.{} after {elapsed:?}",
            self.client_id
        );
        Ok(elapsed)
    }
}
