/*
 * Copyright (c) Huawei Technologies Co., Ltd. 2023. All rights reserved.
 * reboot-operator is licensed under the Mulan PSL v2.
 * You can use this software according to the terms and conditions of the Mulan PSL v2.
 * You may obtain a copy of Mulan PSL v2 at:
 *     http://license.coscl.org.cn/MulanPSL2
 * THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR
 * PURPOSE.
 * See the Mulan PSL v2 for more details.
 */

use std::env;

use anyhow::{Context, Result};
use env_logger::{Builder, Env, Target};
use kube::client::Client;
use log::info;
use tokio::signal;
use tokio::time::Duration;

pub mod controller;

use controller::{Config, Operator};

const OPERATOR_VERSION: Option<&'static str> = option_env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("reboot_operator=info"))
        .target(Target::Stdout)
        .init();
    let client = Client::try_default().await?;
    info!(
        "reboot-operator version is {}, starting operator",
        OPERATOR_VERSION.unwrap_or("Not Found")
    );

    let mut config = Config::new(client, &env_or_default("NAMESPACE"), &env_or_default("LOCK_ID"));
    config.lock_type = env_or_default("LOCK_TYPE");
    config.before_reboot_annotations = annotation_list("BEFORE_REBOOT_ANNOTATIONS");
    config.after_reboot_annotations = annotation_list("AFTER_REBOOT_ANNOTATIONS");
    config.reboot_window_start = env_or_default("REBOOT_WINDOW_START");
    config.reboot_window_length = env_or_default("REBOOT_WINDOW_LENGTH");
    config.reconciliation_period = seconds_from_env("RECONCILIATION_PERIOD")?;
    config.leader_election_lease = seconds_from_env("LEADER_ELECTION_LEASE")?;
    config.max_rebooting_nodes = count_from_env("MAX_REBOOTING_NODES")?;

    let operator = Operator::new(config)?;
    operator
        .run(async {
            let _ = signal::ctrl_c().await;
        })
        .await?;

    info!("reboot-operator terminated");
    Ok(())
}

fn env_or_default(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

fn annotation_list(key: &str) -> Vec<String> {
    env_or_default(key)
        .split(',')
        .map(str::trim)
        .filter(|annotation| !annotation.is_empty())
        .map(String::from)
        .collect()
}

fn seconds_from_env(key: &str) -> Result<Duration> {
    let raw = env_or_default(key);
    if raw.is_empty() {
        return Ok(Duration::ZERO);
    }
    let seconds: u64 = raw.parse().with_context(|| format!("parsing {} as seconds", key))?;
    Ok(Duration::from_secs(seconds))
}

fn count_from_env(key: &str) -> Result<usize> {
    let raw = env_or_default(key);
    if raw.is_empty() {
        return Ok(0);
    }
    raw.parse().with_context(|| format!("parsing {} as a count", key))
}
