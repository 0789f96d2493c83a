use std::path::Path;

use anyhow::{bail, Result};

use super::{BuildConfig, ImageSize};

impl BuildConfig {
    /// Collect every problem of the config instead of stopping at the first one.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = vec![];

        if self.suite.is_empty() || self.suite.contains(char::is_whitespace) {
            problems.push(format!("suite {:?} is not a valid suite name", self.suite));
        }

        if !["http://", "https://", "file://"]
            .iter()
            .any(|scheme| self.mirror.starts_with(scheme))
        {
            problems.push(format!(
                "mirror {:?} must be a http://, https:// or file:// URL",
                self.mirror
            ));
        }

        if self.rootfs.as_os_str().is_empty() || self.rootfs == Path::new("/") {
            problems.push(format!("rootfs {:?} cannot be used as a build tree", self.rootfs));
        }

        if matches!(&self.kernel_package, Some(kernel) if kernel.trim().is_empty()) {
            problems.push("kernel_package cannot be empty".to_owned());
        }

        if self.image.path.as_os_str().is_empty() {
            problems.push("image.path cannot be empty".to_owned());
        } else if self.image.path.starts_with(&self.rootfs) {
            problems.push(format!(
                "image.path {:?} cannot live inside the rootfs {:?}",
                self.image.path, self.rootfs
            ));
        }

        if self.image.size < ImageSize::MIN {
            problems.push(format!(
                "image.size {} is smaller than the minimum of {}",
                self.image.size,
                ImageSize::MIN
            ));
        }

        if !is_valid_login_name(&self.account.username) {
            problems.push(format!(
                "account.username {:?} is not a valid login name",
                self.account.username
            ));
        }

        if self.account.password.is_empty() || self.account.password.contains(['\n', ':']) {
            problems.push("account.password must be non-empty and cannot contain ':' or newlines".to_owned());
        }

        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if !problems.is_empty() {
            bail!("Invalid build config:\n\t{}", problems.join("\n\t"));
        }
        Ok(())
    }
}

/// Same rule as the default NAME_REGEX of Debian's adduser.
fn is_valid_login_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };

    name.len() <= 32
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}
