use std::path::Path;

use anyhow::{Context as _, Result};

use crate::host::{Host, Invocation};

/// apt-get driven non-interactively inside a chroot.
pub struct Apt<'a> {
    host: &'a dyn Host,
    root: &'a Path,
}

impl<'a> Apt<'a> {
    pub fn new(host: &'a dyn Host, root: &'a Path) -> Self {
        Self { host, root }
    }

    fn apt_get(&self) -> Invocation {
        Invocation::new("apt-get")
            .in_root(self.root)
            .env("DEBIAN_FRONTEND", "noninteractive")
    }

    pub async fn update(&self) -> Result<()> {
        self.host
            .run(&self.apt_get().arg("update"))
            .await
            .context("Failed to refresh the package index")?;
        Ok(())
    }

    pub async fn install(&self, packages: &[&str]) -> Result<()> {
        tracing::info!(?packages, "Installing packages");
        self.host
            .run(
                &self
                    .apt_get()
                    .args(["install", "-y"])
                    .args(packages.iter().copied()),
            )
            .await
            .with_context(|| format!("Failed to install {}", packages.join(" ")))?;
        Ok(())
    }

    pub async fn clean(&self) -> Result<()> {
        self.host
            .run(&self.apt_get().arg("clean"))
            .await
            .context("Failed to clean the package cache")?;
        Ok(())
    }
}
