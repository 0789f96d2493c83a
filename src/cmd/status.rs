use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, *};

use crate::{
    host::{require_programs, Host},
    stage::BuildContext,
    teardown::{self, canonical_targets, owned_mounts, TeardownTargets},
};

pub struct StatusCommand {
    pub ctx: BuildContext,
}

#[async_trait]
impl super::Command for StatusCommand {
    async fn run(&self) -> Result<()> {
        let targets = TeardownTargets::from_config(&self.ctx.config);
        let table = status_table(self.ctx.host.as_ref(), &targets).await?;
        println!("{table}");
        Ok(())
    }
}

fn presence(path: &Path) -> Cell {
    if path.exists() {
        Cell::new("Present").fg(Color::Green)
    } else {
        Cell::new("Missing").fg(Color::DarkGrey)
    }
}

pub async fn status_table(host: &dyn Host, targets: &TeardownTargets) -> Result<Table> {
    require_programs(host, teardown::REQUIRED_PROGRAMS)?;
    let targets = canonical_targets(targets);
    let devices = host.loops_backing(&targets.image).await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Resource", "Path", "State"]);

    table.add_row(vec![
        Cell::new("Root filesystem"),
        Cell::new(targets.rootfs.display()),
        presence(&targets.rootfs),
    ]);
    table.add_row(vec![
        Cell::new("Disk image"),
        Cell::new(targets.image.display()),
        presence(&targets.image),
    ]);

    for mount_point in owned_mounts(host.mount_table().await?, &targets, &devices) {
        table.add_row(vec![
            Cell::new("Mount"),
            Cell::new(mount_point.display()),
            Cell::new("Held").fg(Color::Yellow),
        ]);
    }

    for device in &devices {
        table.add_row(vec![
            Cell::new("Loop device"),
            Cell::new(device.display()),
            Cell::new("Attached").fg(Color::Yellow),
        ]);
    }

    Ok(table)
}
